use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use taskrelay_core::models::{
    CreateNotificationPayload, PaymentOutcome, PaymentPlan, RecurringPayload, Task, TaskKind,
};
use taskrelay_core::{EnqueueOptions, NewTask};
use taskrelay_infra::{ChargeRequest, ProviderError};

use super::{provider_failure, TaskHandler};
use crate::state::AppState;

const PLAN_BATCH_SIZE: i64 = 100;
const MAX_BATCHES: usize = 50;

/// Charges every payment plan installment due at the slot.
///
/// Charges carry a per-installment idempotency key, so a retried run that
/// repeats a charge the provider already took gets the original result back.
/// A declined card is recorded on the installment and does not fail the run.
pub struct ChargePaymentPlansHandler;

fn charge_request(plan: &PaymentPlan) -> ChargeRequest {
    ChargeRequest {
        customer_id: plan.stripe_customer_id.clone(),
        payment_method_id: plan.stripe_payment_method_id.clone(),
        amount_cents: plan.amount_cents,
        currency: plan.currency.clone(),
        idempotency_key: plan.idempotency_key(),
        description: Some(format!("Payment plan {}", plan.id)),
    }
}

fn declined_notification(plan: &PaymentPlan, reason: &str) -> Result<NewTask> {
    let task = NewTask::new(
        TaskKind::CreateNotification(CreateNotificationPayload {
            trainer_id: plan.trainer_id,
            title: "Payment plan charge declined".to_string(),
            body: format!(
                "A scheduled payment of {:.2} {} was declined: {}",
                plan.amount_cents as f64 / 100.0,
                plan.currency.to_uppercase(),
                reason
            ),
        }),
        EnqueueOptions::default().dedupe_key(format!(
            "createNotification:declined:{}",
            plan.idempotency_key()
        )),
    )?;
    Ok(task)
}

#[async_trait]
impl TaskHandler for ChargePaymentPlansHandler {
    type Payload = RecurringPayload;

    async fn process(
        &self,
        _task: &Task,
        payload: RecurringPayload,
        state: Arc<AppState>,
    ) -> Result<serde_json::Value> {
        let mut seen: HashSet<(Uuid, DateTime<Utc>)> = HashSet::new();
        let mut paid = 0u32;
        let mut declined = 0u32;

        for _ in 0..MAX_BATCHES {
            let plans = state
                .billing
                .due_payment_plans(payload.scheduled_for, PLAN_BATCH_SIZE)
                .await?;
            let fresh: Vec<PaymentPlan> = plans
                .into_iter()
                .filter(|plan| seen.insert((plan.id, plan.next_payment_at)))
                .collect();
            if fresh.is_empty() {
                break;
            }

            for plan in fresh {
                let outcome = match state.payments.charge(&charge_request(&plan)).await {
                    Ok(charge_id) => PaymentOutcome::Paid { charge_id },
                    Err(ProviderError::Rejected { code, message, .. }) => {
                        tracing::warn!(plan_id = %plan.id, code = %code, reason = %message, "Payment plan charge declined");
                        PaymentOutcome::Declined {
                            reason: format!("{}: {}", code, message),
                        }
                    }
                    Err(e) => {
                        return Err(provider_failure(e))
                            .with_context(|| format!("Failed to charge payment plan {}", plan.id))
                    }
                };

                let follow_up = match &outcome {
                    PaymentOutcome::Paid { .. } => {
                        paid += 1;
                        None
                    }
                    PaymentOutcome::Declined { reason } => {
                        declined += 1;
                        Some(declined_notification(&plan, reason)?)
                    }
                };

                state
                    .billing
                    .record_payment(&plan, &outcome, follow_up)
                    .await?;
            }
        }

        tracing::info!(paid, declined, slot = %payload.scheduled_for, "Payment plans charged");
        Ok(json!({ "paid": paid, "declined": declined }))
    }
}
