use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacsvault_model::{ServiceLockEntry, ServiceLockId};

use super::PostgresStore;
use super::rows::{SERVICE_LOCK_COLUMNS, ServiceLockRow, convert_all};
use crate::database::ports::ServiceLockRepository;
use crate::error::{PacsError, Result};

#[async_trait]
impl ServiceLockRepository for PostgresStore {
    async fn select_and_lock_due_entry(
        &self,
        processor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ServiceLockEntry>> {
        let sql = format!(
            r#"
            WITH next AS (
                SELECT id
                FROM service_locks
                WHERE locked = FALSE
                  AND enabled = TRUE
                  AND scheduled_time <= $2
                ORDER BY scheduled_time
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE service_locks s
            SET locked = TRUE, processor_id = $1
            FROM next
            WHERE s.id = next.id
            RETURNING {}
            "#,
            qualified(SERVICE_LOCK_COLUMNS, "s")
        );
        let row: Option<ServiceLockRow> = sqlx::query_as(&sql)
            .bind(processor_id)
            .bind(now)
            .fetch_optional(self.pool())
            .await?;
        row.map(ServiceLockEntry::try_from).transpose()
    }

    async fn unlock_entry(
        &self,
        id: ServiceLockId,
        enabled: bool,
        scheduled_time: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE service_locks
            SET locked = FALSE, processor_id = NULL, enabled = $2, scheduled_time = $3
            WHERE id = $1
            "#,
        )
        .bind(id.to_uuid())
        .bind(enabled)
        .bind(scheduled_time)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(PacsError::NotFound(format!("service lock {id}")));
        }
        Ok(())
    }

    async fn reset_orphaned_locks(&self, processor_id: &str) -> Result<Vec<ServiceLockEntry>> {
        let sql = format!(
            r#"
            UPDATE service_locks
            SET locked = FALSE, processor_id = NULL
            WHERE locked = TRUE AND processor_id = $1
            RETURNING {SERVICE_LOCK_COLUMNS}
            "#
        );
        let rows: Vec<ServiceLockRow> = sqlx::query_as(&sql)
            .bind(processor_id)
            .fetch_all(self.pool())
            .await?;
        convert_all(rows)
    }

    async fn get_entry(&self, id: ServiceLockId) -> Result<Option<ServiceLockEntry>> {
        let sql = format!("SELECT {SERVICE_LOCK_COLUMNS} FROM service_locks WHERE id = $1");
        let row: Option<ServiceLockRow> = sqlx::query_as(&sql)
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?;
        row.map(ServiceLockEntry::try_from).transpose()
    }

    async fn insert_entry(&self, entry: &ServiceLockEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_locks
                (id, lock_type, filesystem_id, processor_id, scheduled_time, locked, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id.to_uuid())
        .bind(entry.lock_type.as_str())
        .bind(entry.filesystem_id.map(|id| id.to_uuid()))
        .bind(entry.processor_id.as_deref())
        .bind(entry.scheduled_time)
        .bind(entry.locked)
        .bind(entry.enabled)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

/// Prefix every column of a list with `alias.`.
pub(super) fn qualified(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
