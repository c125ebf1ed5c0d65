//! Transactional command batches.
//!
//! A [`CommandProcessor`] runs an ordered list of reversible commands. Either
//! every command succeeds and each is committed, or the first failure stops
//! the batch and every command already executed is undone in reverse order.
//! Manifest and artifact updates only ever happen through a batch so the two
//! never diverge.

mod file;
mod manifest;
mod store;

pub use file::{DeleteFileCommand, RenameFileCommand};
pub use manifest::InsertManifestEntryCommand;
pub use store::{
    DeleteWorkQueueUidCommand, InsertInstanceCommand, InsertReconcileEntryCommand,
    UpdateInstanceCommand,
};

use std::fmt;

use async_trait::async_trait;

use crate::error::{PacsError, Result};

/// One reversible step of a batch.
#[async_trait]
pub trait ServerCommand: Send + Sync {
    fn description(&self) -> String;

    async fn execute(&mut self) -> Result<()>;

    /// Revert a successful `execute`. Only called after `execute` returned `Ok`.
    async fn undo(&mut self) -> Result<()>;

    /// Release resources kept for `undo` once the whole batch succeeded.
    async fn commit(&mut self) {}
}

pub struct CommandProcessor {
    description: String,
    commands: Vec<Box<dyn ServerCommand>>,
    failure_reason: Option<String>,
    failure: Option<PacsError>,
}

impl fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("description", &self.description)
            .field(
                "commands",
                &self
                    .commands
                    .iter()
                    .map(|command| command.description())
                    .collect::<Vec<_>>(),
            )
            .field("failure_reason", &self.failure_reason)
            .finish()
    }
}

impl CommandProcessor {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            commands: Vec::new(),
            failure_reason: None,
            failure: None,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn add_command(&mut self, command: impl ServerCommand + 'static) -> &mut Self {
        self.commands.push(Box::new(command));
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Why the last `execute` failed.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Error raised by the failing command of the last `execute`.
    pub fn failure(&self) -> Option<&PacsError> {
        self.failure.as_ref()
    }

    pub fn take_failure(&mut self) -> Option<PacsError> {
        self.failure.take()
    }

    /// Run every command in order. Returns `false` after rolling back if any
    /// command failed.
    pub async fn execute(&mut self) -> bool {
        self.failure_reason = None;
        self.failure = None;

        let mut executed = 0;
        for command in self.commands.iter_mut() {
            match command.execute().await {
                Ok(()) => executed += 1,
                Err(err) => {
                    let reason = format!("{} failed: {err}", command.description());
                    tracing::warn!(
                        target: "pacsvault::command",
                        batch = %self.description,
                        error = %err,
                        "{reason}; rolling back {executed} command(s)"
                    );
                    self.failure_reason = Some(reason);
                    self.failure = Some(err);
                    break;
                }
            }
        }

        if self.failure.is_some() {
            for command in self.commands[..executed].iter_mut().rev() {
                if let Err(err) = command.undo().await {
                    tracing::error!(
                        target: "pacsvault::command",
                        batch = %self.description,
                        command = %command.description(),
                        error = %err,
                        "undo failed"
                    );
                }
            }
            return false;
        }

        for command in self.commands.iter_mut() {
            command.commit().await;
        }
        tracing::debug!(
            target: "pacsvault::command",
            batch = %self.description,
            commands = self.commands.len(),
            "batch committed"
        );
        true
    }
}
