use async_trait::async_trait;
use pacsvault_model::{
    FilesystemId, InstanceRecord, PartitionId, QueueStudyState, StudyLockOutcome, StudyRecord,
    StudyStatus, StudyStorage, StudyStorageId,
};
use sqlx::{Postgres, Transaction};

use super::PostgresStore;
use super::rows::{InstanceRow, STUDY_STORAGE_COLUMNS, StudyRecordRow, StudyStorageRow, convert_all};
use crate::database::ports::{InstanceIndexRepository, StudyStorageRepository};
use crate::error::{PacsError, Result};

const REBUILD_STUDY_RECORD: &str = r#"
    INSERT INTO study_records (study_storage_id, study_uid, num_series, num_instances, modalities)
    SELECT s.id,
           s.study_uid,
           COUNT(DISTINCT i.series_uid)::INTEGER,
           COUNT(i.sop_uid)::INTEGER,
           COALESCE(ARRAY_AGG(DISTINCT i.modality) FILTER (WHERE i.modality IS NOT NULL), '{}')
    FROM study_storage s
    LEFT JOIN instances i ON i.study_storage_id = s.id
    WHERE s.id = $1
    GROUP BY s.id, s.study_uid
    ON CONFLICT (study_storage_id) DO UPDATE
    SET num_series = EXCLUDED.num_series,
        num_instances = EXCLUDED.num_instances,
        modalities = EXCLUDED.modalities
"#;

async fn rebuild_study_record(
    tx: &mut Transaction<'_, Postgres>,
    id: StudyStorageId,
) -> Result<()> {
    sqlx::query(REBUILD_STUDY_RECORD)
        .bind(id.to_uuid())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Upsert an instance row, returning whether it was newly inserted.
async fn upsert_instance(
    tx: &mut Transaction<'_, Postgres>,
    record: &InstanceRecord,
) -> Result<bool> {
    let inserted: bool = sqlx::query_scalar(
        r#"
        INSERT INTO instances
            (study_storage_id, series_uid, sop_uid, transfer_syntax, file_size, modality)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (study_storage_id, sop_uid) DO UPDATE
        SET series_uid = EXCLUDED.series_uid,
            transfer_syntax = EXCLUDED.transfer_syntax,
            file_size = EXCLUDED.file_size,
            modality = EXCLUDED.modality
        RETURNING (xmax = 0)
        "#,
    )
    .bind(record.study_storage_id.to_uuid())
    .bind(&record.series_uid)
    .bind(&record.sop_uid)
    .bind(record.transfer_syntax.as_str())
    .bind(i64::try_from(record.file_size).unwrap_or(i64::MAX))
    .bind(record.modality.as_deref())
    .fetch_one(&mut **tx)
    .await?;
    Ok(inserted)
}

#[async_trait]
impl StudyStorageRepository for PostgresStore {
    async fn get_storage(&self, id: StudyStorageId) -> Result<Option<StudyStorage>> {
        let sql = format!("SELECT {STUDY_STORAGE_COLUMNS} FROM study_storage WHERE id = $1");
        let row: Option<StudyStorageRow> = sqlx::query_as(&sql)
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?;
        row.map(StudyStorage::try_from).transpose()
    }

    async fn find_storage(
        &self,
        partition_id: PartitionId,
        study_uid: &str,
    ) -> Result<Option<StudyStorage>> {
        let sql = format!(
            "SELECT {STUDY_STORAGE_COLUMNS} FROM study_storage WHERE partition_id = $1 AND study_uid = $2"
        );
        let row: Option<StudyStorageRow> = sqlx::query_as(&sql)
            .bind(partition_id.to_uuid())
            .bind(study_uid)
            .fetch_optional(self.pool())
            .await?;
        row.map(StudyStorage::try_from).transpose()
    }

    async fn list_storage_on_filesystem(
        &self,
        filesystem_id: FilesystemId,
    ) -> Result<Vec<StudyStorage>> {
        let sql = format!(
            "SELECT {STUDY_STORAGE_COLUMNS} FROM study_storage WHERE filesystem_id = $1 ORDER BY study_uid"
        );
        let rows: Vec<StudyStorageRow> = sqlx::query_as(&sql)
            .bind(filesystem_id.to_uuid())
            .fetch_all(self.pool())
            .await?;
        convert_all(rows)
    }

    async fn insert_storage(&self, storage: &StudyStorage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO study_storage
                (id, partition_id, study_uid, filesystem_id, study_folder, queue_state, status,
                 transfer_syntax, latest_archive_lossless, restore_requested, study_size_kb,
                 last_accessed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(storage.id.to_uuid())
        .bind(storage.partition_id.to_uuid())
        .bind(&storage.study_uid)
        .bind(storage.filesystem_id.to_uuid())
        .bind(&storage.study_folder)
        .bind(storage.queue_state.as_str())
        .bind(storage.status.as_str())
        .bind(storage.transfer_syntax.as_str())
        .bind(storage.latest_archive_lossless)
        .bind(storage.restore_requested)
        .bind(storage.study_size_kb)
        .bind(storage.last_accessed)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn lock_study(
        &self,
        id: StudyStorageId,
        desired: QueueStudyState,
    ) -> Result<StudyLockOutcome> {
        let updated = sqlx::query(
            r#"
            UPDATE study_storage
            SET queue_state = $2
            WHERE id = $1 AND (queue_state = $2 OR queue_state = $3)
            "#,
        )
        .bind(id.to_uuid())
        .bind(desired.as_str())
        .bind(QueueStudyState::Idle.as_str())
        .execute(self.pool())
        .await?;
        if updated.rows_affected() > 0 {
            return Ok(StudyLockOutcome::acquired());
        }

        let current: Option<(String, String)> =
            sqlx::query_as("SELECT study_uid, queue_state FROM study_storage WHERE id = $1")
                .bind(id.to_uuid())
                .fetch_optional(self.pool())
                .await?;
        match current {
            Some((study_uid, queue_state)) => Ok(StudyLockOutcome::refused(format!(
                "study {study_uid} is {queue_state}"
            ))),
            None => Err(PacsError::NotFound(format!("study storage {id}"))),
        }
    }

    async fn set_queue_state(&self, id: StudyStorageId, state: QueueStudyState) -> Result<()> {
        let result = sqlx::query("UPDATE study_storage SET queue_state = $2 WHERE id = $1")
            .bind(id.to_uuid())
            .bind(state.as_str())
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(PacsError::NotFound(format!("study storage {id}")));
        }
        Ok(())
    }

    async fn request_restore(&self, id: StudyStorageId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE study_storage SET restore_requested = TRUE \
             WHERE id = $1 AND status = $2 AND latest_archive_lossless IS NOT NULL",
        )
        .bind(id.to_uuid())
        .bind(StudyStatus::Nearline.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_study_size(&self, id: StudyStorageId, size_kb: i64) -> Result<()> {
        sqlx::query("UPDATE study_storage SET study_size_kb = $2 WHERE id = $1")
            .bind(id.to_uuid())
            .bind(size_kb)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn load_study_record(&self, id: StudyStorageId) -> Result<Option<StudyRecord>> {
        let row: Option<StudyRecordRow> = sqlx::query_as(
            r#"
            SELECT study_storage_id, study_uid, num_series, num_instances, modalities
            FROM study_records
            WHERE study_storage_id = $1
            "#,
        )
        .bind(id.to_uuid())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl InstanceIndexRepository for PostgresStore {
    async fn load_instance_index(
        &self,
        study_storage_id: StudyStorageId,
    ) -> Result<Vec<InstanceRecord>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(
            r#"
            SELECT study_storage_id, series_uid, sop_uid, transfer_syntax, file_size, modality
            FROM instances
            WHERE study_storage_id = $1
            ORDER BY series_uid, sop_uid
            "#,
        )
        .bind(study_storage_id.to_uuid())
        .fetch_all(self.pool())
        .await?;
        convert_all(rows)
    }

    async fn get_instance(
        &self,
        study_storage_id: StudyStorageId,
        sop_uid: &str,
    ) -> Result<Option<InstanceRecord>> {
        let row: Option<InstanceRow> = sqlx::query_as(
            r#"
            SELECT study_storage_id, series_uid, sop_uid, transfer_syntax, file_size, modality
            FROM instances
            WHERE study_storage_id = $1 AND sop_uid = $2
            "#,
        )
        .bind(study_storage_id.to_uuid())
        .bind(sop_uid)
        .fetch_optional(self.pool())
        .await?;
        row.map(InstanceRecord::try_from).transpose()
    }

    async fn insert_instance(&self, record: &InstanceRecord) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        if upsert_instance(&mut tx, record).await? {
            rebuild_study_record(&mut tx, record.study_storage_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_instance(&self, record: &InstanceRecord) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        upsert_instance(&mut tx, record).await?;
        rebuild_study_record(&mut tx, record.study_storage_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_instance(&self, study_storage_id: StudyStorageId, sop_uid: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let deleted = sqlx::query("DELETE FROM instances WHERE study_storage_id = $1 AND sop_uid = $2")
            .bind(study_storage_id.to_uuid())
            .bind(sop_uid)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let has_record: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM study_records WHERE study_storage_id = $1)",
        )
        .bind(study_storage_id.to_uuid())
        .fetch_one(&mut *tx)
        .await?;
        if deleted > 0 && has_record {
            rebuild_study_record(&mut tx, study_storage_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
