use async_trait::async_trait;
use pacsvault_model::{Filesystem, FilesystemId, PartitionId, ServerPartition};

use super::PostgresStore;
use super::rows::{FilesystemRow, PartitionRow};
use crate::database::ports::FilesystemRepository;
use crate::error::Result;

const FILESYSTEM_COLUMNS: &str = "id, path, description, enabled, read_only, write_only";
const PARTITION_COLUMNS: &str = "id, ae_title, partition_folder, enabled";

#[async_trait]
impl FilesystemRepository for PostgresStore {
    async fn get_filesystem(&self, id: FilesystemId) -> Result<Option<Filesystem>> {
        let sql = format!("SELECT {FILESYSTEM_COLUMNS} FROM filesystems WHERE id = $1");
        let row: Option<FilesystemRow> = sqlx::query_as(&sql)
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_filesystems(&self) -> Result<Vec<Filesystem>> {
        let sql = format!("SELECT {FILESYSTEM_COLUMNS} FROM filesystems ORDER BY path");
        let rows: Vec<FilesystemRow> = sqlx::query_as(&sql).fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_filesystem(&self, filesystem: &Filesystem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO filesystems (id, path, description, enabled, read_only, write_only)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(filesystem.id.to_uuid())
        .bind(filesystem.path.to_string_lossy().as_ref())
        .bind(&filesystem.description)
        .bind(filesystem.enabled)
        .bind(filesystem.read_only)
        .bind(filesystem.write_only)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_partition(&self, id: PartitionId) -> Result<Option<ServerPartition>> {
        let sql = format!("SELECT {PARTITION_COLUMNS} FROM server_partitions WHERE id = $1");
        let row: Option<PartitionRow> = sqlx::query_as(&sql)
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_partitions(&self) -> Result<Vec<ServerPartition>> {
        let sql = format!("SELECT {PARTITION_COLUMNS} FROM server_partitions ORDER BY ae_title");
        let rows: Vec<PartitionRow> = sqlx::query_as(&sql).fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_partition(&self, partition: &ServerPartition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO server_partitions (id, ae_title, partition_folder, enabled)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(partition.id.to_uuid())
        .bind(&partition.ae_title)
        .bind(&partition.partition_folder)
        .bind(partition.enabled)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
