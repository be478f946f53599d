use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use taskrelay_core::models::{MailingListStatus, NewNotification, Trainer};

#[async_trait]
pub trait TrainerRepository: Send + Sync {
    async fn get(&self, trainer_id: Uuid) -> Result<Option<Trainer>>;

    async fn set_mailing_list_status(
        &self,
        trainer_id: Uuid,
        status: MailingListStatus,
    ) -> Result<()>;

    /// Trainers whose trial ended before `as_of` without a subscription and who
    /// have not been tagged yet.
    async fn trialled_didnt_subscribe(&self, as_of: DateTime<Utc>, limit: i64)
        -> Result<Vec<Trainer>>;

    async fn mark_trial_tagged(&self, trainer_id: Uuid) -> Result<()>;

    /// Returns false when the notification for this source task already exists.
    async fn insert_notification(&self, notification: &NewNotification) -> Result<bool>;
}

#[derive(Clone)]
pub struct PgTrainerRepository {
    pool: PgPool,
}

impl PgTrainerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrainerRepository for PgTrainerRepository {
    #[tracing::instrument(skip(self))]
    async fn get(&self, trainer_id: Uuid) -> Result<Option<Trainer>> {
        let trainer = sqlx::query_as::<Postgres, Trainer>(
            r#"
            SELECT id, email, first_name, trial_ends_at, has_subscription,
                   mailing_list_status, trial_tagged_at
            FROM trainers
            WHERE id = $1
            "#,
        )
        .bind(trainer_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch trainer")?;

        Ok(trainer)
    }

    #[tracing::instrument(skip(self))]
    async fn set_mailing_list_status(
        &self,
        trainer_id: Uuid,
        status: MailingListStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trainers
            SET mailing_list_status = $2,
                mailing_list_updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(trainer_id)
        .bind(status)
        .execute(&self.pool)
        .await
        .context("Failed to update trainer mailing list status")?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn trialled_didnt_subscribe(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Trainer>> {
        let trainers = sqlx::query_as::<Postgres, Trainer>(
            r#"
            SELECT id, email, first_name, trial_ends_at, has_subscription,
                   mailing_list_status, trial_tagged_at
            FROM trainers
            WHERE trial_ends_at IS NOT NULL
                AND trial_ends_at <= $1
                AND has_subscription = FALSE
                AND trial_tagged_at IS NULL
            ORDER BY trial_ends_at ASC
            LIMIT $2
            "#,
        )
        .bind(as_of)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list trialled trainers")?;

        Ok(trainers)
    }

    #[tracing::instrument(skip(self))]
    async fn mark_trial_tagged(&self, trainer_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE trainers SET trial_tagged_at = NOW() WHERE id = $1 AND trial_tagged_at IS NULL")
            .bind(trainer_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark trainer as trial tagged")?;

        Ok(())
    }

    #[tracing::instrument(skip(self, notification), fields(trainer.id = %notification.trainer_id))]
    async fn insert_notification(&self, notification: &NewNotification) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO notifications (trainer_id, title, body, source_task_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_task_id) DO NOTHING
            "#,
        )
        .bind(notification.trainer_id)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(notification.source_task_id)
        .execute(&self.pool)
        .await
        .context("Failed to insert notification")?
        .rows_affected();

        Ok(inserted > 0)
    }
}
