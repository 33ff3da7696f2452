//! Transition log of command executions.
//!
//! Every status transition the engine makes is appended here before it is
//! audited. After a restart, [`OrchestrationJournal::unfinished`] yields the
//! commands that must be resumed. [`TableJournal`] keeps the log in a
//! [`TableStore`], so it survives as long as that store does.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use teamcloud_commands::{Command, CommandResult};
use teamcloud_core::CommandId;

use crate::audit::sanitize_prefix;
use crate::storage::{
    Filter, OrderBy, StorageError, TableEntity, TableQuery, TableStore, WritePrecondition,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    /// Monotonic across the whole journal.
    pub sequence: u64,
    pub command: Command,
    pub result: CommandResult,
    pub recorded: DateTime<Utc>,
}

#[async_trait]
pub trait OrchestrationJournal: Send + Sync {
    /// Record a transition; returns its sequence number.
    async fn append(&self, command: &Command, result: &CommandResult) -> Result<u64, StorageError>;

    async fn last(&self, command_id: CommandId) -> Result<Option<JournalEntry>, StorageError>;

    async fn history(&self, command_id: CommandId) -> Result<Vec<JournalEntry>, StorageError>;

    /// Latest entry of every command that has not reached a final status,
    /// ordered by the command's first appearance.
    async fn unfinished(&self) -> Result<Vec<JournalEntry>, StorageError>;
}

#[async_trait]
impl<J: OrchestrationJournal + ?Sized> OrchestrationJournal for Arc<J> {
    async fn append(&self, command: &Command, result: &CommandResult) -> Result<u64, StorageError> {
        (**self).append(command, result).await
    }

    async fn last(&self, command_id: CommandId) -> Result<Option<JournalEntry>, StorageError> {
        (**self).last(command_id).await
    }

    async fn history(&self, command_id: CommandId) -> Result<Vec<JournalEntry>, StorageError> {
        (**self).history(command_id).await
    }

    async fn unfinished(&self) -> Result<Vec<JournalEntry>, StorageError> {
        (**self).unfinished().await
    }
}

#[derive(Debug, Default)]
struct JournalState {
    entries: Vec<JournalEntry>,
    /// Command id -> indexes into `entries`, oldest first.
    by_command: HashMap<CommandId, Vec<usize>>,
    /// Command ids in order of first appearance.
    order: Vec<CommandId>,
}

#[derive(Debug, Default)]
pub struct InMemoryJournal {
    state: RwLock<JournalState>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OrchestrationJournal for InMemoryJournal {
    async fn append(&self, command: &Command, result: &CommandResult) -> Result<u64, StorageError> {
        let mut state = self.state.write().map_err(|_| StorageError::poisoned())?;
        let sequence = state.entries.len() as u64 + 1;
        let index = state.entries.len();
        state.entries.push(JournalEntry {
            sequence,
            command: command.clone(),
            result: result.clone(),
            recorded: Utc::now(),
        });

        let indexes = state.by_command.entry(command.command_id).or_default();
        let first = indexes.is_empty();
        indexes.push(index);
        if first {
            state.order.push(command.command_id);
        }
        Ok(sequence)
    }

    async fn last(&self, command_id: CommandId) -> Result<Option<JournalEntry>, StorageError> {
        let state = self.state.read().map_err(|_| StorageError::poisoned())?;
        Ok(state
            .by_command
            .get(&command_id)
            .and_then(|indexes| indexes.last())
            .map(|i| state.entries[*i].clone()))
    }

    async fn history(&self, command_id: CommandId) -> Result<Vec<JournalEntry>, StorageError> {
        let state = self.state.read().map_err(|_| StorageError::poisoned())?;
        Ok(state
            .by_command
            .get(&command_id)
            .map(|indexes| indexes.iter().map(|i| state.entries[*i].clone()).collect())
            .unwrap_or_default())
    }

    async fn unfinished(&self) -> Result<Vec<JournalEntry>, StorageError> {
        let state = self.state.read().map_err(|_| StorageError::poisoned())?;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.by_command.get(id).and_then(|ix| ix.last()))
            .map(|i| &state.entries[*i])
            .filter(|entry| !entry.result.is_final())
            .cloned()
            .collect())
    }
}

const ENTRY_PROPERTY: &str = "Entry";
const FINAL_PROPERTY: &str = "Final";
const FIRST_SEQUENCE_PROPERTY: &str = "FirstSequence";
const SEQUENCE_PROPERTY: &str = "Value";
const HEADS_PARTITION: &str = "heads";
const SEQUENCE_PARTITION: &str = "sequence";
const PAGE_SIZE: usize = 100;
const MAX_SEQUENCE_RETRIES: usize = 16;

/// Journal in the `{prefix}Journal` table.
///
/// Transitions are rows partitioned by command id. The latest transition of
/// each command is mirrored into a `heads` partition that recovery scans, and
/// a single counter row hands out sequence numbers through conditional
/// writes.
#[derive(Clone)]
pub struct TableJournal {
    tables: Arc<dyn TableStore>,
    name: String,
}

impl std::fmt::Debug for TableJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableJournal").field("name", &self.name).finish_non_exhaustive()
    }
}

impl TableJournal {
    pub fn new(tables: Arc<dyn TableStore>, prefix: &str) -> Self {
        Self {
            tables,
            name: format!("{}Journal", sanitize_prefix(prefix)),
        }
    }

    pub fn arc(tables: Arc<dyn TableStore>, prefix: &str) -> Arc<Self> {
        Arc::new(Self::new(tables, prefix))
    }

    pub fn table_name(&self) -> &str {
        &self.name
    }

    async fn next_sequence(&self) -> Result<u64, StorageError> {
        for _ in 0..MAX_SEQUENCE_RETRIES {
            let row = self
                .tables
                .get(&self.name, SEQUENCE_PARTITION, SEQUENCE_PARTITION)
                .await?;
            let (current, precondition) = match &row {
                Some(row) => (
                    row.get(SEQUENCE_PROPERTY).and_then(|v| v.as_u64()).unwrap_or(0),
                    row.version.map_or(WritePrecondition::None, WritePrecondition::MatchesVersion),
                ),
                None => (0, WritePrecondition::DoesNotExist),
            };

            let next = current + 1;
            let counter = TableEntity::new(SEQUENCE_PARTITION, SEQUENCE_PARTITION)
                .with(SEQUENCE_PROPERTY, next);
            if self
                .tables
                .upsert_if(&self.name, counter, precondition)
                .await?
                .is_success()
            {
                return Ok(next);
            }
        }
        Err(StorageError::Unavailable(format!(
            "sequence counter of {} is contended",
            self.name
        )))
    }

    async fn scan(
        &self,
        partition_key: &str,
        filter: Option<Filter>,
    ) -> Result<Vec<JournalEntry>, StorageError> {
        let mut query = TableQuery {
            partition_key: Some(partition_key.to_string()),
            filter,
            order_by: Some(OrderBy {
                property: FIRST_SEQUENCE_PROPERTY.to_string(),
                descending: false,
            }),
            page_size: PAGE_SIZE,
            continuation: None,
        };

        let mut entries = Vec::new();
        loop {
            let page = self.tables.query(&self.name, &query).await?;
            for row in &page.entities {
                entries.push(decode_entry(row)?);
            }
            match page.continuation {
                Some(token) => query.continuation = Some(token),
                None => break,
            }
        }
        Ok(entries)
    }
}

fn decode_entry(row: &TableEntity) -> Result<JournalEntry, StorageError> {
    let json = row.get_str(ENTRY_PROPERTY).ok_or_else(|| {
        StorageError::Serialization(format!("journal row {} has no {ENTRY_PROPERTY}", row.row_key))
    })?;
    Ok(serde_json::from_str(json)?)
}

#[async_trait]
impl OrchestrationJournal for TableJournal {
    async fn append(&self, command: &Command, result: &CommandResult) -> Result<u64, StorageError> {
        let sequence = self.next_sequence().await?;
        let entry = JournalEntry {
            sequence,
            command: command.clone(),
            result: result.clone(),
            recorded: Utc::now(),
        };
        let json = serde_json::to_string(&entry)?;
        let command_key = command.command_id.to_string();

        let transition = TableEntity::new(&command_key, format!("{sequence:020}"))
            .with(ENTRY_PROPERTY, json.as_str())
            .with(FIRST_SEQUENCE_PROPERTY, sequence);
        self.tables.upsert(&self.name, transition).await?;

        let first = self
            .tables
            .get(&self.name, HEADS_PARTITION, &command_key)
            .await?
            .and_then(|head| head.get(FIRST_SEQUENCE_PROPERTY).and_then(|v| v.as_u64()))
            .unwrap_or(sequence);
        let head = TableEntity::new(HEADS_PARTITION, &command_key)
            .with(ENTRY_PROPERTY, json)
            .with(FINAL_PROPERTY, result.is_final())
            .with(FIRST_SEQUENCE_PROPERTY, first);
        self.tables.upsert(&self.name, head).await?;
        Ok(sequence)
    }

    async fn last(&self, command_id: CommandId) -> Result<Option<JournalEntry>, StorageError> {
        self.tables
            .get(&self.name, HEADS_PARTITION, &command_id.to_string())
            .await?
            .map(|row| decode_entry(&row))
            .transpose()
    }

    async fn history(&self, command_id: CommandId) -> Result<Vec<JournalEntry>, StorageError> {
        self.scan(&command_id.to_string(), None).await
    }

    async fn unfinished(&self) -> Result<Vec<JournalEntry>, StorageError> {
        self.scan(HEADS_PARTITION, Some(Filter::eq(FINAL_PROPERTY, false)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTableStore;
    use teamcloud_commands::{CommandAction, CommandPayload, RuntimeStatus};
    use teamcloud_core::{OrganizationId, User, UserId, UserRole};

    fn command() -> Command {
        let organization = OrganizationId::new();
        let user = User {
            id: UserId::new(),
            organization,
            display_name: "alice".to_string(),
            role: UserRole::Admin,
        };
        Command::new(
            CommandAction::Custom,
            user,
            CommandPayload::Custom {
                name: "PingCommand".to_string(),
                data: serde_json::Value::Null,
            },
        )
    }

    #[tokio::test]
    async fn history_keeps_every_transition_in_order() {
        let journal = InMemoryJournal::new();
        let command = command();
        let mut result = CommandResult::new(&command);

        for status in [RuntimeStatus::Pending, RuntimeStatus::Running, RuntimeStatus::Completed] {
            result.set_runtime_status(status);
            journal.append(&command, &result).await.unwrap();
        }

        let history = journal.history(command.command_id).await.unwrap();
        let statuses: Vec<_> = history.iter().map(|e| e.result.runtime_status()).collect();
        assert_eq!(
            statuses,
            vec![RuntimeStatus::Pending, RuntimeStatus::Running, RuntimeStatus::Completed]
        );
        assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(
            journal.last(command.command_id).await.unwrap().unwrap().result.runtime_status(),
            RuntimeStatus::Completed
        );
    }

    async fn assert_unfinished_in_first_seen_order(journal: &dyn OrchestrationJournal) {
        let (a, b, c) = (command(), command(), command());

        for cmd in [&a, &b, &c] {
            let mut result = CommandResult::new(cmd);
            result.set_runtime_status(RuntimeStatus::Pending);
            journal.append(cmd, &result).await.unwrap();
        }
        let mut done = CommandResult::new(&b);
        done.set_runtime_status(RuntimeStatus::Completed);
        journal.append(&b, &done).await.unwrap();

        let mut running = CommandResult::new(&a);
        running.set_runtime_status(RuntimeStatus::Running);
        journal.append(&a, &running).await.unwrap();

        let unfinished: Vec<_> = journal
            .unfinished()
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.command.command_id, e.result.runtime_status()))
            .collect();
        assert_eq!(
            unfinished,
            vec![
                (a.command_id, RuntimeStatus::Running),
                (c.command_id, RuntimeStatus::Pending)
            ]
        );
    }

    #[tokio::test]
    async fn unfinished_lists_active_commands_in_first_seen_order() {
        assert_unfinished_in_first_seen_order(&InMemoryJournal::new()).await;
        assert_unfinished_in_first_seen_order(&TableJournal::new(MemoryTableStore::arc(), "tc")).await;
    }

    #[tokio::test]
    async fn table_journal_survives_a_new_instance() {
        let tables = MemoryTableStore::arc();
        let command = command();
        let mut result = CommandResult::new(&command);

        let before = TableJournal::new(tables.clone(), "tc");
        assert_eq!(before.table_name(), "tcJournal");
        for status in [RuntimeStatus::Pending, RuntimeStatus::Running] {
            result.set_runtime_status(status);
            before.append(&command, &result).await.unwrap();
        }

        let after = TableJournal::new(tables, "tc");
        let history = after.history(command.command_id).await.unwrap();
        assert_eq!(history.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(after.unfinished().await.unwrap().len(), 1);

        result.set_runtime_status(RuntimeStatus::Completed);
        assert_eq!(after.append(&command, &result).await.unwrap(), 3);
        assert!(after.unfinished().await.unwrap().is_empty());
        assert_eq!(
            after.last(command.command_id).await.unwrap().unwrap().result.runtime_status(),
            RuntimeStatus::Completed
        );
    }
}
