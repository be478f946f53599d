use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use taskrelay_core::models::{SendSmsPayload, SmsMessage, TaskKind};
use taskrelay_core::{EnqueueOptions, NewTask};

use super::task::enqueue;

/// Outbound SMS rows as the send handlers see them.
#[async_trait]
pub trait SmsRepository: Send + Sync {
    async fn get(&self, sms_id: Uuid) -> Result<Option<SmsMessage>>;

    async fn mark_sent(&self, sms_id: Uuid, provider_sid: &str) -> Result<()>;

    /// Record a permanent failure, enqueueing `follow_up` in the same transaction.
    async fn mark_failed(&self, sms_id: Uuid, reason: &str, follow_up: Option<NewTask>)
        -> Result<()>;

    /// Move up to `limit` scheduled messages due at `now` to `queued` and enqueue
    /// one `sendSms` task for each, atomically. Returns the queued ids.
    async fn queue_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>>;
}

/// Dedupe key for the send task of one message.
pub fn send_sms_dedupe_key(sms_id: Uuid) -> String {
    format!("sendSms:{}", sms_id)
}

#[derive(Clone)]
pub struct PgSmsRepository {
    pool: PgPool,
}

impl PgSmsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SmsRepository for PgSmsRepository {
    #[tracing::instrument(skip(self))]
    async fn get(&self, sms_id: Uuid) -> Result<Option<SmsMessage>> {
        let sms = sqlx::query_as::<Postgres, SmsMessage>(
            r#"
            SELECT id, trainer_id, to_number, body, status, send_at, provider_sid, failure_reason
            FROM sms_messages
            WHERE id = $1
            "#,
        )
        .bind(sms_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch sms message")?;

        Ok(sms)
    }

    #[tracing::instrument(skip(self))]
    async fn mark_sent(&self, sms_id: Uuid, provider_sid: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sms_messages
            SET status = 'sent',
                provider_sid = $2,
                sent_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sms_id)
        .bind(provider_sid)
        .execute(&self.pool)
        .await
        .context("Failed to mark sms as sent")?;

        Ok(())
    }

    #[tracing::instrument(skip(self, follow_up))]
    async fn mark_failed(
        &self,
        sms_id: Uuid,
        reason: &str,
        follow_up: Option<NewTask>,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for sms failure")?;

        sqlx::query(
            r#"
            UPDATE sms_messages
            SET status = 'failed',
                failure_reason = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sms_id)
        .bind(reason)
        .execute(&mut *tx)
        .await
        .context("Failed to mark sms as failed")?;

        if let Some(task) = follow_up {
            enqueue(&mut *tx, &task).await?;
        }

        tx.commit()
            .await
            .context("Failed to commit sms failure")?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn queue_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for due sms")?;

        let ids: Vec<Uuid> = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            UPDATE sms_messages
            SET status = 'queued',
                updated_at = NOW()
            WHERE id IN (
                SELECT id
                FROM sms_messages
                WHERE status = 'scheduled'
                    AND send_at <= $1
                ORDER BY send_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to queue due sms messages")?;

        for sms_id in &ids {
            let task = NewTask::new(
                TaskKind::SendSms(SendSmsPayload { sms_id: *sms_id }),
                EnqueueOptions::default().dedupe_key(send_sms_dedupe_key(*sms_id)),
            )?;
            enqueue(&mut *tx, &task).await?;
        }

        tx.commit()
            .await
            .context("Failed to commit queued sms messages")?;

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_dedupe_key_is_per_message() {
        let id = Uuid::nil();
        assert_eq!(
            send_sms_dedupe_key(id),
            "sendSms:00000000-0000-0000-0000-000000000000"
        );
    }
}
