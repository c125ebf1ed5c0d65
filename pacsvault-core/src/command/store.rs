use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pacsvault_model::{InstanceRecord, WorkQueueUid};

use super::ServerCommand;
use crate::database::PacsStore;
use crate::database::ports::{ReconcileEntryDraft, ReconcileInsert};
use crate::error::Result;

/// Remove a pending image object record.
pub struct DeleteWorkQueueUidCommand {
    store: Arc<dyn PacsStore>,
    uid: WorkQueueUid,
}

impl DeleteWorkQueueUidCommand {
    pub fn new(store: Arc<dyn PacsStore>, uid: WorkQueueUid) -> Self {
        Self { store, uid }
    }
}

impl fmt::Debug for DeleteWorkQueueUidCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteWorkQueueUidCommand")
            .field("uid", &self.uid.id)
            .finish()
    }
}

#[async_trait]
impl ServerCommand for DeleteWorkQueueUidCommand {
    fn description(&self) -> String {
        format!("delete work queue uid {}", self.uid.sop_uid)
    }

    async fn execute(&mut self) -> Result<()> {
        self.store.delete_uid(self.uid.id).await
    }

    async fn undo(&mut self) -> Result<()> {
        self.store.insert_uid(&self.uid).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceWrite {
    Insert,
    Update,
}

struct InstanceCommand {
    store: Arc<dyn PacsStore>,
    record: InstanceRecord,
    mode: InstanceWrite,
    previous: Option<Option<InstanceRecord>>,
}

impl InstanceCommand {
    async fn execute(&mut self) -> Result<()> {
        let previous = self
            .store
            .get_instance(self.record.study_storage_id, &self.record.sop_uid)
            .await?;
        match self.mode {
            InstanceWrite::Insert => self.store.insert_instance(&self.record).await?,
            InstanceWrite::Update => self.store.update_instance(&self.record).await?,
        }
        self.previous = Some(previous);
        Ok(())
    }

    async fn undo(&mut self) -> Result<()> {
        match self.previous.take() {
            Some(Some(previous)) => self.store.insert_instance(&previous).await,
            Some(None) => {
                self.store
                    .delete_instance(self.record.study_storage_id, &self.record.sop_uid)
                    .await
            }
            None => Ok(()),
        }
    }
}

/// Add an instance to the persistent index.
pub struct InsertInstanceCommand(InstanceCommand);

impl InsertInstanceCommand {
    pub fn new(store: Arc<dyn PacsStore>, record: InstanceRecord) -> Self {
        Self(InstanceCommand {
            store,
            record,
            mode: InstanceWrite::Insert,
            previous: None,
        })
    }
}

impl fmt::Debug for InsertInstanceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertInstanceCommand")
            .field("record", &self.0.record)
            .finish()
    }
}

#[async_trait]
impl ServerCommand for InsertInstanceCommand {
    fn description(&self) -> String {
        format!("insert instance {}", self.0.record.sop_uid)
    }

    async fn execute(&mut self) -> Result<()> {
        self.0.execute().await
    }

    async fn undo(&mut self) -> Result<()> {
        self.0.undo().await
    }
}

/// Replace an instance row and rebuild its study record.
pub struct UpdateInstanceCommand(InstanceCommand);

impl UpdateInstanceCommand {
    pub fn new(store: Arc<dyn PacsStore>, record: InstanceRecord) -> Self {
        Self(InstanceCommand {
            store,
            record,
            mode: InstanceWrite::Update,
            previous: None,
        })
    }
}

impl fmt::Debug for UpdateInstanceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateInstanceCommand")
            .field("record", &self.0.record)
            .finish()
    }
}

#[async_trait]
impl ServerCommand for UpdateInstanceCommand {
    fn description(&self) -> String {
        format!("update instance {}", self.0.record.sop_uid)
    }

    async fn execute(&mut self) -> Result<()> {
        self.0.execute().await
    }

    async fn undo(&mut self) -> Result<()> {
        self.0.undo().await
    }
}

/// Park an object under a reconciliation record.
pub struct InsertReconcileEntryCommand {
    store: Arc<dyn PacsStore>,
    draft: ReconcileEntryDraft,
    inserted: Option<ReconcileInsert>,
}

impl InsertReconcileEntryCommand {
    pub fn new(store: Arc<dyn PacsStore>, draft: ReconcileEntryDraft) -> Self {
        Self {
            store,
            draft,
            inserted: None,
        }
    }
}

impl fmt::Debug for InsertReconcileEntryCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertReconcileEntryCommand")
            .field("draft", &self.draft)
            .field("inserted", &self.inserted)
            .finish()
    }
}

#[async_trait]
impl ServerCommand for InsertReconcileEntryCommand {
    fn description(&self) -> String {
        format!(
            "insert reconciliation entry {} for group {}",
            self.draft.uid.sop_uid, self.draft.group_id
        )
    }

    async fn execute(&mut self) -> Result<()> {
        self.inserted = Some(self.store.insert_or_update_entry(&self.draft).await?);
        Ok(())
    }

    async fn undo(&mut self) -> Result<()> {
        if let Some(inserted) = self.inserted.take() {
            self.store
                .remove_entry_uid(inserted.record_id, &self.draft.uid.sop_uid)
                .await?;
        }
        Ok(())
    }
}
