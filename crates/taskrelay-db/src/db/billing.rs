use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use taskrelay_core::models::{AppStoreSubscription, PaymentOutcome, PaymentPlan};
use taskrelay_core::NewTask;

use super::task::enqueue;

#[async_trait]
pub trait BillingRepository: Send + Sync {
    /// Active plans with an installment due at or before `as_of`.
    async fn due_payment_plans(&self, as_of: DateTime<Utc>, limit: i64) -> Result<Vec<PaymentPlan>>;

    /// Record the outcome of the installment due at `plan.next_payment_at`,
    /// advance the plan to its next due date and enqueue `follow_up`, all in one
    /// transaction. A second call for the same installment changes nothing.
    async fn record_payment(
        &self,
        plan: &PaymentPlan,
        outcome: &PaymentOutcome,
        follow_up: Option<NewTask>,
    ) -> Result<()>;

    /// Active App Store subscriptions expiring before `before`.
    async fn expiring_subscriptions(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AppStoreSubscription>>;

    async fn update_subscription(
        &self,
        subscription_id: Uuid,
        expires_at: DateTime<Utc>,
        active: bool,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct PgBillingRepository {
    pool: PgPool,
}

impl PgBillingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingRepository for PgBillingRepository {
    #[tracing::instrument(skip(self))]
    async fn due_payment_plans(&self, as_of: DateTime<Utc>, limit: i64) -> Result<Vec<PaymentPlan>> {
        let plans = sqlx::query_as::<Postgres, PaymentPlan>(
            r#"
            SELECT id, trainer_id, client_id, stripe_customer_id, stripe_payment_method_id,
                   amount_cents, currency, frequency, next_payment_at, ends_at
            FROM payment_plans
            WHERE status = 'active'
                AND next_payment_at <= $1
            ORDER BY next_payment_at ASC
            LIMIT $2
            "#,
        )
        .bind(as_of)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list due payment plans")?;

        Ok(plans)
    }

    #[tracing::instrument(skip(self, plan, outcome, follow_up), fields(plan.id = %plan.id))]
    async fn record_payment(
        &self,
        plan: &PaymentPlan,
        outcome: &PaymentOutcome,
        follow_up: Option<NewTask>,
    ) -> Result<()> {
        let next_payment_at = plan
            .frequency
            .advance(plan.next_payment_at)
            .context("Next payment date is out of range")?;
        let (status, charge_id, failure_reason) = match outcome {
            PaymentOutcome::Paid { charge_id } => ("paid", Some(charge_id.as_str()), None),
            PaymentOutcome::Declined { reason } => ("declined", None, Some(reason.as_str())),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for plan payment")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO payment_plan_payments
                (payment_plan_id, due_at, amount_cents, currency, status, charge_id, failure_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (payment_plan_id, due_at) DO NOTHING
            "#,
        )
        .bind(plan.id)
        .bind(plan.next_payment_at)
        .bind(plan.amount_cents)
        .bind(&plan.currency)
        .bind(status)
        .bind(charge_id)
        .bind(failure_reason)
        .execute(&mut *tx)
        .await
        .context("Failed to record plan payment")?
        .rows_affected();

        if inserted == 0 {
            tracing::debug!(plan_id = %plan.id, "Installment already recorded");
            tx.rollback().await.ok();
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE payment_plans
            SET next_payment_at = $3,
                status = CASE
                    WHEN ends_at IS NOT NULL AND $3 > ends_at THEN 'ended'
                    ELSE status
                END,
                updated_at = NOW()
            WHERE id = $1
                AND next_payment_at = $2
            "#,
        )
        .bind(plan.id)
        .bind(plan.next_payment_at)
        .bind(next_payment_at)
        .execute(&mut *tx)
        .await
        .context("Failed to advance payment plan")?;

        if let Some(task) = follow_up {
            enqueue(&mut *tx, &task).await?;
        }

        tx.commit()
            .await
            .context("Failed to commit plan payment")?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn expiring_subscriptions(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AppStoreSubscription>> {
        let subscriptions = sqlx::query_as::<Postgres, AppStoreSubscription>(
            r#"
            SELECT id, trainer_id, latest_receipt, expires_at, active
            FROM app_store_subscriptions
            WHERE active = TRUE
                AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list expiring subscriptions")?;

        Ok(subscriptions)
    }

    #[tracing::instrument(skip(self))]
    async fn update_subscription(
        &self,
        subscription_id: Uuid,
        expires_at: DateTime<Utc>,
        active: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE app_store_subscriptions
            SET expires_at = $2,
                active = $3,
                verified_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(expires_at)
        .bind(active)
        .execute(&self.pool)
        .await
        .context("Failed to update subscription")?;

        Ok(())
    }
}
