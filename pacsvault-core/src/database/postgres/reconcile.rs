use async_trait::async_trait;
use pacsvault_model::{
    ReconcileHistory, ReconcileRecordId, ReconciliationRecord, StudyStorageId,
};

use super::PostgresStore;
use super::rows::{HistoryRow, RECONCILE_COLUMNS, ReconcileRow, convert_all};
use crate::database::ports::{ReconcileEntryDraft, ReconcileInsert, ReconcileRepository};
use crate::error::Result;

#[async_trait]
impl ReconcileRepository for PostgresStore {
    async fn insert_or_update_entry(&self, draft: &ReconcileEntryDraft) -> Result<ReconcileInsert> {
        let mut tx = self.pool().begin().await?;

        let sql = format!(
            r#"
            SELECT {RECONCILE_COLUMNS}
            FROM reconcile_records
            WHERE study_storage_id = $1 AND group_id = $2 AND reason = $3
            FOR UPDATE
            "#
        );
        let existing: Option<ReconcileRow> = sqlx::query_as(&sql)
            .bind(draft.study_storage_id.to_uuid())
            .bind(&draft.group_id)
            .bind(draft.reason.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match existing {
            Some(row) => {
                let mut record = ReconciliationRecord::try_from(row)?;
                if !record.uids.iter().any(|uid| uid.sop_uid == draft.uid.sop_uid) {
                    record.uids.push(draft.uid.clone());
                }
                record.differences.extend(draft.differences.iter().cloned());

                sqlx::query(
                    "UPDATE reconcile_records SET uids = $2, differences = $3 WHERE id = $1",
                )
                .bind(record.id.to_uuid())
                .bind(serde_json::to_value(&record.uids)?)
                .bind(serde_json::to_value(&record.differences)?)
                .execute(&mut *tx)
                .await?;

                ReconcileInsert {
                    record_id: record.id,
                    created: false,
                }
            }
            None => {
                let record_id = ReconcileRecordId::new();
                sqlx::query(
                    r#"
                    INSERT INTO reconcile_records
                        (id, study_storage_id, group_id, reason, group_path, uids, differences)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(record_id.to_uuid())
                .bind(draft.study_storage_id.to_uuid())
                .bind(&draft.group_id)
                .bind(draft.reason.as_str())
                .bind(&draft.group_path)
                .bind(serde_json::to_value([&draft.uid])?)
                .bind(serde_json::to_value(&draft.differences)?)
                .execute(&mut *tx)
                .await?;

                ReconcileInsert {
                    record_id,
                    created: true,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn remove_entry_uid(&self, record_id: ReconcileRecordId, sop_uid: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            UPDATE reconcile_records
            SET uids = COALESCE(
                (SELECT jsonb_agg(u) FROM jsonb_array_elements(uids) AS u
                 WHERE u->>'sop_uid' <> $2),
                '[]'::jsonb)
            WHERE id = $1
            "#,
        )
        .bind(record_id.to_uuid())
        .bind(sop_uid)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM reconcile_records WHERE id = $1 AND jsonb_array_length(uids) = 0")
            .bind(record_id.to_uuid())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_entries(
        &self,
        study_storage_id: StudyStorageId,
    ) -> Result<Vec<ReconciliationRecord>> {
        let sql = format!(
            "SELECT {RECONCILE_COLUMNS} FROM reconcile_records WHERE study_storage_id = $1 ORDER BY inserted_at"
        );
        let rows: Vec<ReconcileRow> = sqlx::query_as(&sql)
            .bind(study_storage_id.to_uuid())
            .fetch_all(self.pool())
            .await?;
        convert_all(rows)
    }

    async fn find_history(
        &self,
        study_storage_id: StudyStorageId,
        context_id: &str,
    ) -> Result<Option<ReconcileHistory>> {
        let row: Option<HistoryRow> = sqlx::query_as(
            r#"
            SELECT study_storage_id, context_id, action, recorded_at
            FROM reconcile_history
            WHERE study_storage_id = $1 AND context_id = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(study_storage_id.to_uuid())
        .bind(context_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(ReconcileHistory::try_from).transpose()
    }

    async fn insert_history(&self, history: &ReconcileHistory) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reconcile_history (study_storage_id, context_id, action, recorded_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(history.study_storage_id.to_uuid())
        .bind(&history.context_id)
        .bind(serde_json::to_value(&history.action)?)
        .bind(history.recorded_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
