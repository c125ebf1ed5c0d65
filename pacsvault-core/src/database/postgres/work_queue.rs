use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacsvault_model::{
    StudyStorageId, WorkQueueId, WorkQueueItem, WorkQueueStatus, WorkQueueType, WorkQueueUid,
    WorkQueueUidId,
};

use super::PostgresStore;
use super::rows::{
    WORK_QUEUE_COLUMNS, WORK_QUEUE_UID_COLUMNS, WorkQueueRow, WorkQueueUidRow, convert_all,
};
use super::service_lock::qualified;
use crate::database::ports::WorkQueueRepository;
use crate::error::{PacsError, Result};

#[async_trait]
impl WorkQueueRepository for PostgresStore {
    async fn insert_item(&self, item: &WorkQueueItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO work_queue
                (id, partition_id, study_storage_id, work_queue_type, status, processor_id,
                 scheduled_time, expiration_time, insert_time, failure_count, failure_description)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(item.id.to_uuid())
        .bind(item.partition_id.to_uuid())
        .bind(item.study_storage_id.to_uuid())
        .bind(item.work_queue_type.as_str())
        .bind(item.status.as_str())
        .bind(item.processor_id.as_deref())
        .bind(item.scheduled_time)
        .bind(item.expiration_time)
        .bind(item.insert_time)
        .bind(item.failure_count)
        .bind(item.failure_description.as_deref())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_item(&self, id: WorkQueueId) -> Result<Option<WorkQueueItem>> {
        let sql = format!("SELECT {WORK_QUEUE_COLUMNS} FROM work_queue WHERE id = $1");
        let row: Option<WorkQueueRow> = sqlx::query_as(&sql)
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?;
        row.map(WorkQueueItem::try_from).transpose()
    }

    async fn save_item(&self, item: &WorkQueueItem) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = $2,
                processor_id = $3,
                scheduled_time = $4,
                expiration_time = $5,
                failure_count = $6,
                failure_description = $7
            WHERE id = $1
            "#,
        )
        .bind(item.id.to_uuid())
        .bind(item.status.as_str())
        .bind(item.processor_id.as_deref())
        .bind(item.scheduled_time)
        .bind(item.expiration_time)
        .bind(item.failure_count)
        .bind(item.failure_description.as_deref())
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(PacsError::NotFound(format!("work queue item {}", item.id)));
        }
        Ok(())
    }

    async fn delete_item(&self, id: WorkQueueId) -> Result<()> {
        sqlx::query("DELETE FROM work_queue WHERE id = $1")
            .bind(id.to_uuid())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn select_and_lock_due_item(
        &self,
        processor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkQueueItem>> {
        let sql = format!(
            r#"
            WITH next AS (
                SELECT id
                FROM work_queue
                WHERE processor_id IS NULL
                  AND status IN ('{pending}', '{idle}')
                  AND scheduled_time <= $2
                ORDER BY scheduled_time
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_queue w
            SET status = '{in_progress}', processor_id = $1
            FROM next
            WHERE w.id = next.id
            RETURNING {columns}
            "#,
            pending = WorkQueueStatus::Pending,
            idle = WorkQueueStatus::Idle,
            in_progress = WorkQueueStatus::InProgress,
            columns = qualified(WORK_QUEUE_COLUMNS, "w"),
        );
        let row: Option<WorkQueueRow> = sqlx::query_as(&sql)
            .bind(processor_id)
            .bind(now)
            .fetch_optional(self.pool())
            .await?;
        row.map(WorkQueueItem::try_from).transpose()
    }

    async fn reset_orphaned_items(
        &self,
        processor_id: &str,
        max_failure_count: i32,
    ) -> Result<Vec<WorkQueueItem>> {
        let sql = format!(
            r#"
            UPDATE work_queue
            SET processor_id = NULL,
                scheduled_time = NOW(),
                status = CASE WHEN failure_count >= $2 THEN '{failed}' ELSE '{pending}' END
            WHERE status = '{in_progress}' AND processor_id = $1
            RETURNING {WORK_QUEUE_COLUMNS}
            "#,
            failed = WorkQueueStatus::Failed,
            pending = WorkQueueStatus::Pending,
            in_progress = WorkQueueStatus::InProgress,
        );
        let rows: Vec<WorkQueueRow> = sqlx::query_as(&sql)
            .bind(processor_id)
            .bind(max_failure_count)
            .fetch_all(self.pool())
            .await?;
        convert_all(rows)
    }

    async fn find_item_for_study(
        &self,
        study_storage_id: StudyStorageId,
        work_queue_type: WorkQueueType,
    ) -> Result<Option<WorkQueueItem>> {
        let sql = format!(
            r#"
            SELECT {WORK_QUEUE_COLUMNS}
            FROM work_queue
            WHERE study_storage_id = $1 AND work_queue_type = $2 AND status <> '{failed}'
            ORDER BY insert_time
            LIMIT 1
            "#,
            failed = WorkQueueStatus::Failed,
        );
        let row: Option<WorkQueueRow> = sqlx::query_as(&sql)
            .bind(study_storage_id.to_uuid())
            .bind(work_queue_type.as_str())
            .fetch_optional(self.pool())
            .await?;
        row.map(WorkQueueItem::try_from).transpose()
    }

    async fn load_uids(&self, work_queue_id: WorkQueueId) -> Result<Vec<WorkQueueUid>> {
        let sql = format!(
            "SELECT {WORK_QUEUE_UID_COLUMNS} FROM work_queue_uids WHERE work_queue_id = $1 ORDER BY seq"
        );
        let rows: Vec<WorkQueueUidRow> = sqlx::query_as(&sql)
            .bind(work_queue_id.to_uuid())
            .fetch_all(self.pool())
            .await?;
        convert_all(rows)
    }

    async fn insert_uid(&self, uid: &WorkQueueUid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO work_queue_uids
                (id, work_queue_id, series_uid, sop_uid, duplicate, failed, failure_count,
                 extension, group_id, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(uid.id.to_uuid())
        .bind(uid.work_queue_id.to_uuid())
        .bind(&uid.series_uid)
        .bind(&uid.sop_uid)
        .bind(uid.duplicate)
        .bind(uid.failed)
        .bind(uid.failure_count)
        .bind(uid.extension.as_deref())
        .bind(uid.group_id.as_deref())
        .bind(serde_json::to_value(&uid.data)?)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn update_uid(&self, uid: &WorkQueueUid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE work_queue_uids
            SET duplicate = $2, failed = $3, failure_count = $4, extension = $5,
                group_id = $6, data = $7
            WHERE id = $1
            "#,
        )
        .bind(uid.id.to_uuid())
        .bind(uid.duplicate)
        .bind(uid.failed)
        .bind(uid.failure_count)
        .bind(uid.extension.as_deref())
        .bind(uid.group_id.as_deref())
        .bind(serde_json::to_value(&uid.data)?)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn delete_uid(&self, id: WorkQueueUidId) -> Result<()> {
        sqlx::query("DELETE FROM work_queue_uids WHERE id = $1")
            .bind(id.to_uuid())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
