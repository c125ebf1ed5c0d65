use async_trait::async_trait;
use pacsvault_model::{Filesystem, FilesystemId, PartitionId, ServerPartition};

use crate::error::Result;

#[async_trait]
pub trait FilesystemRepository: Send + Sync {
    async fn get_filesystem(&self, id: FilesystemId) -> Result<Option<Filesystem>>;

    async fn list_filesystems(&self) -> Result<Vec<Filesystem>>;

    async fn insert_filesystem(&self, filesystem: &Filesystem) -> Result<()>;

    async fn get_partition(&self, id: PartitionId) -> Result<Option<ServerPartition>>;

    async fn list_partitions(&self) -> Result<Vec<ServerPartition>>;

    async fn insert_partition(&self, partition: &ServerPartition) -> Result<()>;
}
