use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use teamcloud_commands::{Command, CommandResult};

use crate::storage::{BlobStore, TableStore, WritePrecondition};

use super::entity::{command_dump_path, result_dump_path, CommandAuditEntity};
use super::{AuditError, AuditOptions};

/// Attempts at a conditional write before giving up on a contended record.
const MAX_CONFLICT_RETRIES: usize = 8;

/// Writes command snapshots to the audit trail.
///
/// The blob dumps and the table row are written concurrently and both are
/// always attempted; one failing does not stop the other.
#[derive(Clone)]
pub struct CommandAuditWriter {
    blobs: Arc<dyn BlobStore>,
    tables: Arc<dyn TableStore>,
    options: AuditOptions,
}

impl std::fmt::Debug for CommandAuditWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandAuditWriter")
            .field("options", &self.options)
            .finish()
    }
}

impl CommandAuditWriter {
    pub fn new(blobs: Arc<dyn BlobStore>, tables: Arc<dyn TableStore>, options: AuditOptions) -> Self {
        Self {
            blobs,
            tables,
            options,
        }
    }

    pub fn options(&self) -> &AuditOptions {
        &self.options
    }

    pub async fn write(
        &self,
        command: &Command,
        result: Option<&CommandResult>,
    ) -> Result<(), AuditError> {
        let (blob, table) = tokio::join!(
            self.write_blobs(command, result),
            self.write_table(command, result)
        );

        match (blob, table) {
            (Ok(()), Ok(())) => {
                debug!(command_id = %command.command_id, "command audited");
                Ok(())
            }
            (blob, table) => Err(AuditError::Incomplete {
                blob: outcome(&blob),
                table: outcome(&table),
            }),
        }
    }

    /// Audit and swallow any failure. Auditing must never fail a command.
    pub async fn write_or_log(&self, command: &Command, result: Option<&CommandResult>) {
        if let Err(e) = self.write(command, result).await {
            warn!(
                command_id = %command.command_id,
                command = %command.name(),
                error = %e,
                "failed to audit command"
            );
        }
    }

    async fn write_blobs(
        &self,
        command: &Command,
        result: Option<&CommandResult>,
    ) -> Result<(), AuditError> {
        let container = self.options.container_name();
        let command_dump = self.put_json(&container, command_dump_path(command), command);
        let result_dump = async {
            match result {
                Some(result) => {
                    self.put_result(&container, result_dump_path(command, result), result)
                        .await
                }
                None => Ok(()),
            }
        };

        let (command_dump, result_dump) = tokio::join!(command_dump, result_dump);
        command_dump.and(result_dump)
    }

    /// Replace the result dump unless the stored one is newer.
    async fn put_result(
        &self,
        container: &str,
        path: String,
        result: &CommandResult,
    ) -> Result<(), AuditError> {
        let data = Bytes::from(serde_json::to_vec(result)?);
        for _ in 0..MAX_CONFLICT_RETRIES {
            let precondition = match self.blobs.head(container, &path).await? {
                None => WritePrecondition::DoesNotExist,
                Some(props) => {
                    let stored = self.blobs.get(container, &path).await?;
                    let stored_update = stored
                        .and_then(|bytes| serde_json::from_slice::<CommandResult>(&bytes).ok())
                        .and_then(|stored| stored.last_updated_time);
                    if is_older(result.last_updated_time, stored_update) {
                        debug!(command_id = %result.command_id, "stale result dump skipped");
                        return Ok(());
                    }
                    WritePrecondition::MatchesVersion(props.version)
                }
            };

            if self
                .blobs
                .put(container, &path, data.clone(), precondition)
                .await?
                .is_success()
            {
                return Ok(());
            }
        }
        Err(AuditError::Contended(path))
    }

    async fn put_json<T: Serialize + Sync>(
        &self,
        container: &str,
        path: String,
        value: &T,
    ) -> Result<(), AuditError> {
        let data = Bytes::from(serde_json::to_vec(value)?);
        self.blobs
            .put(container, &path, data, WritePrecondition::None)
            .await?;
        Ok(())
    }

    async fn write_table(
        &self,
        command: &Command,
        result: Option<&CommandResult>,
    ) -> Result<(), AuditError> {
        let table = self.options.table_name();
        let partition_key = command.organization_id.to_string();
        let row_key = command.command_id.to_string();

        for _ in 0..MAX_CONFLICT_RETRIES {
            let row = self.tables.get(&table, &partition_key, &row_key).await?;
            let precondition = match row.as_ref().and_then(|row| row.version) {
                Some(version) => WritePrecondition::MatchesVersion(version),
                None => WritePrecondition::DoesNotExist,
            };
            let existing = row
                .map(|row| CommandAuditEntity::from_table_entity(&row))
                .transpose()?;

            let entity = CommandAuditEntity::merge(existing, command, result);
            if self
                .tables
                .upsert_if(&table, entity.to_table_entity(), precondition)
                .await?
                .is_success()
            {
                return Ok(());
            }
            debug!(command_id = %command.command_id, "audit row changed concurrently, merging again");
        }
        Err(AuditError::Contended(row_key))
    }
}

fn is_older(incoming: Option<DateTime<Utc>>, stored: Option<DateTime<Utc>>) -> bool {
    matches!((incoming, stored), (Some(incoming), Some(stored)) if incoming < stored)
}

fn outcome(result: &Result<(), AuditError>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::FaultPoint;
    use crate::storage::{
        MemoryBlobStore, MemoryTableStore, StorageError, TableEntity, TablePage, TableQuery,
        WriteResult,
    };
    use teamcloud_commands::{CommandAction, CommandPayload, RuntimeStatus};
    use teamcloud_core::{OrganizationId, Project, ProjectId, ResourceState, User, UserId, UserRole};

    fn command() -> Command {
        let org = OrganizationId::new();
        let user = User {
            id: UserId::new(),
            organization: org,
            display_name: "ops".to_string(),
            role: UserRole::Owner,
        };
        let project = Project {
            id: ProjectId::new(),
            organization: org,
            display_name: "alpha".to_string(),
            resource_state: ResourceState::Pending,
        };
        Command::new(CommandAction::Create, user, CommandPayload::Project(project))
    }

    fn writer() -> (Arc<MemoryBlobStore>, Arc<MemoryTableStore>, CommandAuditWriter) {
        let blobs = MemoryBlobStore::arc();
        let tables = MemoryTableStore::arc();
        let writer = CommandAuditWriter::new(blobs.clone(), tables.clone(), AuditOptions::default());
        (blobs, tables, writer)
    }

    #[tokio::test]
    async fn writes_dumps_and_row() {
        let (blobs, tables, writer) = writer();
        let command = command();
        let mut result = CommandResult::new(&command);
        result.set_runtime_status(RuntimeStatus::Running);

        writer.write(&command, Some(&result)).await.unwrap();

        let dumps = blobs.list("teamcloud-audit");
        assert_eq!(dumps.len(), 2);
        assert!(dumps.iter().any(|d| d.ends_with(".command.json")));
        assert!(dumps.iter().any(|d| d.ends_with(".result.json")));
        assert_eq!(tables.len("teamcloudAudit"), 1);
    }

    #[tokio::test]
    async fn table_is_written_even_when_blob_write_fails() {
        let (blobs, tables, writer) = writer();
        blobs.fail_next(FaultPoint::BlobPut, 1);

        let err = writer.write(&command(), None).await.unwrap_err();
        assert!(matches!(err, AuditError::Incomplete { ref table, .. } if table == "ok"));
        assert_eq!(tables.len("teamcloudAudit"), 1);
    }

    #[tokio::test]
    async fn blobs_are_written_even_when_table_write_fails() {
        let (blobs, tables, writer) = writer();
        tables.fail_next(FaultPoint::TableUpsert, 1);

        let err = writer.write(&command(), None).await.unwrap_err();
        assert!(matches!(err, AuditError::Incomplete { ref blob, .. } if blob == "ok"));
        assert_eq!(blobs.list("teamcloud-audit").len(), 1);
    }

    fn snapshot(command: &Command, status: RuntimeStatus, offset_secs: i64) -> CommandResult {
        let mut result = CommandResult::new(command);
        result.set_runtime_status(status);
        result.last_updated_time = Some(command.created + chrono::Duration::seconds(offset_secs));
        result
    }

    async fn stored_result(blobs: &MemoryBlobStore, command: &Command) -> CommandResult {
        let path = result_dump_path(command, &CommandResult::new(command));
        let bytes = blobs.get("teamcloud-audit", &path).await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn late_snapshot_does_not_replace_newer_result_dump() {
        let (blobs, tables, writer) = writer();
        let command = command();

        writer
            .write(&command, Some(&snapshot(&command, RuntimeStatus::Completed, 5)))
            .await
            .unwrap();
        writer
            .write(&command, Some(&snapshot(&command, RuntimeStatus::Pending, 0)))
            .await
            .unwrap();

        assert_eq!(stored_result(&blobs, &command).await.runtime_status(), RuntimeStatus::Completed);
        let row = tables
            .get(
                "teamcloudAudit",
                &command.organization_id.to_string(),
                &command.command_id.to_string(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get_str("RuntimeStatus"), Some("Completed"));
    }

    /// Lands a competing row right after the first read, as a concurrent
    /// writer would.
    struct Interleaved {
        inner: Arc<MemoryTableStore>,
        competing: std::sync::Mutex<Option<TableEntity>>,
    }

    #[async_trait::async_trait]
    impl TableStore for Interleaved {
        async fn get(
            &self,
            table: &str,
            partition_key: &str,
            row_key: &str,
        ) -> Result<Option<TableEntity>, StorageError> {
            let read = self.inner.get(table, partition_key, row_key).await?;
            let competing = self.competing.lock().unwrap().take();
            if let Some(row) = competing {
                self.inner.upsert(table, row).await?;
            }
            Ok(read)
        }

        async fn upsert(&self, table: &str, entity: TableEntity) -> Result<(), StorageError> {
            self.inner.upsert(table, entity).await
        }

        async fn upsert_if(
            &self,
            table: &str,
            entity: TableEntity,
            precondition: WritePrecondition,
        ) -> Result<WriteResult, StorageError> {
            self.inner.upsert_if(table, entity, precondition).await
        }

        async fn delete(
            &self,
            table: &str,
            partition_key: &str,
            row_key: &str,
        ) -> Result<bool, StorageError> {
            self.inner.delete(table, partition_key, row_key).await
        }

        async fn query(&self, table: &str, query: &TableQuery) -> Result<TablePage, StorageError> {
            self.inner.query(table, query).await
        }
    }

    #[tokio::test]
    async fn concurrent_row_write_is_merged_not_overwritten() {
        let command = command();
        let completed = snapshot(&command, RuntimeStatus::Completed, 5);
        let inner = MemoryTableStore::arc();
        let tables = Arc::new(Interleaved {
            inner: inner.clone(),
            competing: std::sync::Mutex::new(Some(
                CommandAuditEntity::merge(None, &command, Some(&completed)).to_table_entity(),
            )),
        });
        let writer = CommandAuditWriter::new(MemoryBlobStore::arc(), tables, AuditOptions::default());

        writer
            .write(&command, Some(&snapshot(&command, RuntimeStatus::Pending, 0)))
            .await
            .unwrap();

        let row = inner
            .get(
                "teamcloudAudit",
                &command.organization_id.to_string(),
                &command.command_id.to_string(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get_str("RuntimeStatus"), Some("Completed"));
        assert_eq!(row.version, Some(2));
    }

    #[tokio::test]
    async fn write_or_log_swallows_failures() {
        let (_, tables, writer) = writer();
        tables.fail_next(FaultPoint::TableGet, 1);
        writer.write_or_log(&command(), None).await;
        assert_eq!(tables.len("teamcloudAudit"), 0);
    }
}
