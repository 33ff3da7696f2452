use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::warn;

use teamcloud_core::{CommandId, OrganizationId, ProjectId};

use crate::storage::{BlobStore, Filter, OrderBy, TableEntity, TableQuery, TableStore};

use super::entity::{row_keys, CommandAuditEntity};
use super::{AuditError, AuditOptions};

/// Marker that turns a command pattern into a prefix match.
pub const PREFIX_MARKER: &str = "<>";

/// Filters for [`CommandAuditReader::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditQuery {
    pub project_id: Option<ProjectId>,
    /// Only rows written within this window before now.
    pub time_range: Option<Duration>,
    /// Command names; `Project<>` matches every name starting with `Project`.
    pub commands: Vec<String>,
}

impl AuditQuery {
    pub fn for_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn within(mut self, range: Duration) -> Self {
        self.time_range = Some(range);
        self
    }

    pub fn commands<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = patterns.into_iter().map(Into::into).collect();
        self
    }

    fn filter(&self) -> Option<Filter> {
        let mut clauses = Vec::new();
        if let Some(project) = self.project_id {
            clauses.push(Filter::eq("ProjectId", project.to_string()));
        }
        if let Some(range) = self.time_range {
            let since = chrono::Duration::from_std(range)
                .ok()
                .and_then(|range| Utc::now().checked_sub_signed(range));
            if let Some(since) = since {
                clauses.push(Filter::TimestampGe(since));
            }
        }
        if !self.commands.is_empty() {
            clauses.push(Filter::Or(
                self.commands.iter().map(|p| command_filter(p)).collect(),
            ));
        }
        (!clauses.is_empty()).then(|| Filter::And(clauses))
    }
}

/// Equality, or a `[prefix, prefix')` range when the pattern ends with `<>`.
fn command_filter(pattern: &str) -> Filter {
    let Some(prefix) = pattern.strip_suffix(PREFIX_MARKER) else {
        return Filter::eq("Command", pattern);
    };
    let mut chars: Vec<char> = prefix.chars().collect();
    let Some(last) = chars.pop() else {
        return Filter::And(Vec::new());
    };
    match char::from_u32(last as u32 + 1) {
        Some(next) => {
            chars.push(next);
            let upper: String = chars.into_iter().collect();
            Filter::And(vec![
                Filter::ge("Command", prefix),
                Filter::lt("Command", upper),
            ])
        }
        None => Filter::ge("Command", prefix),
    }
}

/// Reads the audit trail.
#[derive(Clone)]
pub struct CommandAuditReader {
    blobs: Arc<dyn BlobStore>,
    tables: Arc<dyn TableStore>,
    options: AuditOptions,
}

impl std::fmt::Debug for CommandAuditReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandAuditReader")
            .field("options", &self.options)
            .finish()
    }
}

impl CommandAuditReader {
    pub fn new(blobs: Arc<dyn BlobStore>, tables: Arc<dyn TableStore>, options: AuditOptions) -> Self {
        Self {
            blobs,
            tables,
            options,
        }
    }

    /// The audit row of one command, optionally with its JSON dumps.
    ///
    /// A missing dump leaves the corresponding field `None`.
    pub async fn get(
        &self,
        organization_id: OrganizationId,
        command_id: CommandId,
        include_json_dumps: bool,
    ) -> Result<Option<CommandAuditEntity>, AuditError> {
        let (partition, row) = row_keys(organization_id, command_id);
        let Some(stored) = self
            .tables
            .get(&self.options.table_name(), &partition, &row)
            .await?
        else {
            return Ok(None);
        };
        let mut entity = CommandAuditEntity::from_table_entity(&stored)?;

        if include_json_dumps {
            let container = self.options.container_name();
            let (command_json, result_json) = tokio::join!(
                self.read_dump(&container, entity.command_path()),
                self.read_dump(&container, entity.result_path())
            );
            entity.command_json = command_json;
            entity.result_json = result_json;
        }

        Ok(Some(entity))
    }

    async fn read_dump(&self, container: &str, path: String) -> Option<String> {
        match self.blobs.get(container, &path).await {
            Ok(data) => data.map(|bytes: Bytes| String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                warn!(audit_path = %path, error = %e, "failed to read audit dump");
                None
            }
        }
    }

    /// Audit rows of an organization, newest first.
    ///
    /// The stream pages through the table lazily; a page is only fetched once
    /// the previous one has been consumed.
    pub fn list(
        &self,
        organization_id: OrganizationId,
        query: &AuditQuery,
    ) -> BoxStream<'static, Result<CommandAuditEntity, AuditError>> {
        let pager = Pager {
            tables: self.tables.clone(),
            table: self.options.table_name(),
            query: TableQuery {
                partition_key: Some(organization_id.to_string()),
                filter: query.filter(),
                order_by: Some(OrderBy::descending("Created")),
                page_size: self.options.page_size,
                continuation: None,
            },
            buffer: VecDeque::new(),
            exhausted: false,
        };
        stream::try_unfold(pager, next_entity).boxed()
    }
}

struct Pager {
    tables: Arc<dyn TableStore>,
    table: String,
    query: TableQuery,
    buffer: VecDeque<TableEntity>,
    exhausted: bool,
}

async fn next_entity(
    mut pager: Pager,
) -> Result<Option<(CommandAuditEntity, Pager)>, AuditError> {
    loop {
        if let Some(row) = pager.buffer.pop_front() {
            let entity = CommandAuditEntity::from_table_entity(&row)?;
            return Ok(Some((entity, pager)));
        }
        if pager.exhausted {
            return Ok(None);
        }
        let page = pager.tables.query(&pager.table, &pager.query).await?;
        pager.exhausted = page.continuation.is_none();
        pager.query.continuation = page.continuation;
        pager.buffer.extend(page.entities);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::CommandAuditWriter;
    use crate::storage::memory::FaultPoint;
    use crate::storage::{MemoryBlobStore, MemoryTableStore};
    use futures::TryStreamExt;
    use teamcloud_commands::{Command, CommandAction, CommandPayload, CommandResult, RuntimeStatus};
    use teamcloud_core::{Component, ComponentId, DeploymentScopeId, Project, ResourceState, User, UserId, UserRole};

    struct Fixture {
        org: OrganizationId,
        user: User,
        blobs: Arc<MemoryBlobStore>,
        tables: Arc<MemoryTableStore>,
        writer: CommandAuditWriter,
        reader: CommandAuditReader,
    }

    fn fixture(page_size: usize) -> Fixture {
        let org = OrganizationId::new();
        let blobs = MemoryBlobStore::arc();
        let tables = MemoryTableStore::arc();
        let options = AuditOptions::default().with_page_size(page_size);
        Fixture {
            org,
            user: User {
                id: UserId::new(),
                organization: org,
                display_name: "ops".to_string(),
                role: UserRole::Admin,
            },
            writer: CommandAuditWriter::new(blobs.clone(), tables.clone(), options.clone()),
            reader: CommandAuditReader::new(blobs.clone(), tables.clone(), options),
            blobs,
            tables,
        }
    }

    impl Fixture {
        fn project_command(&self, project: ProjectId, action: CommandAction) -> Command {
            let payload = CommandPayload::Project(Project {
                id: project,
                organization: self.org,
                display_name: "p".to_string(),
                resource_state: ResourceState::Pending,
            });
            Command::new(action, self.user.clone(), payload)
        }

        fn component_command(&self, project: ProjectId) -> Command {
            let payload = CommandPayload::Component(Component {
                id: ComponentId::new(),
                organization: self.org,
                project,
                deployment_scope: DeploymentScopeId::new(),
                display_name: "c".to_string(),
                resource_id: None,
                resource_state: ResourceState::Pending,
            });
            Command::new(CommandAction::Create, self.user.clone(), payload)
        }
    }

    #[test]
    fn prefix_pattern_becomes_range() {
        assert_eq!(
            command_filter("Project<>"),
            Filter::And(vec![
                Filter::ge("Command", "Project"),
                Filter::lt("Command", "Projecu"),
            ])
        );
        assert_eq!(
            command_filter("ProjectCreateCommand"),
            Filter::eq("Command", "ProjectCreateCommand")
        );
    }

    #[tokio::test]
    async fn get_joins_dumps_on_request() {
        let f = fixture(10);
        let command = f.project_command(ProjectId::new(), CommandAction::Create);
        let mut result = CommandResult::new(&command);
        result.set_runtime_status(RuntimeStatus::Completed);
        f.writer.write(&command, Some(&result)).await.unwrap();

        let plain = f.reader.get(f.org, command.command_id, false).await.unwrap().unwrap();
        assert!(plain.command_json.is_none());
        assert_eq!(plain.runtime_status, RuntimeStatus::Completed);

        let full = f.reader.get(f.org, command.command_id, true).await.unwrap().unwrap();
        let dumped: Command = serde_json::from_str(full.command_json.as_deref().unwrap()).unwrap();
        assert_eq!(dumped.command_id, command.command_id);
        assert!(full.result_json.is_some());
    }

    #[tokio::test]
    async fn get_without_result_dump_leaves_it_empty() {
        let f = fixture(10);
        let command = f.project_command(ProjectId::new(), CommandAction::Create);
        f.writer.write(&command, None).await.unwrap();

        let full = f.reader.get(f.org, command.command_id, true).await.unwrap().unwrap();
        assert!(full.command_json.is_some());
        assert!(full.result_json.is_none());
        assert_eq!(f.blobs.list("teamcloud-audit").len(), 1);
    }

    #[tokio::test]
    async fn get_unknown_command_is_none() {
        let f = fixture(10);
        assert!(f.reader.get(f.org, CommandId::new(), true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_pages_transparently_newest_first() {
        let f = fixture(2);
        let project = ProjectId::new();
        let base = Utc::now() - chrono::Duration::minutes(10);
        let mut written = Vec::new();
        for i in 0..5 {
            let mut command = f.project_command(project, CommandAction::Update);
            command.created = base + chrono::Duration::seconds(i);
            f.writer.write(&command, None).await.unwrap();
            written.push(command.command_id.to_string());
        }

        let listed: Vec<String> = f
            .reader
            .list(f.org, &AuditQuery::default())
            .map_ok(|e| e.command_id)
            .try_collect()
            .await
            .unwrap();

        written.reverse();
        assert_eq!(listed, written);
    }

    #[tokio::test]
    async fn list_filters_by_project_and_pattern() {
        let f = fixture(100);
        let p1 = ProjectId::new();
        let p2 = ProjectId::new();
        for command in [
            f.project_command(p1, CommandAction::Create),
            f.project_command(p1, CommandAction::Delete),
            f.component_command(p1),
            f.project_command(p2, CommandAction::Create),
        ] {
            f.writer.write(&command, None).await.unwrap();
        }

        let query = AuditQuery::default().for_project(p1).commands(["Project<>"]);
        let rows: Vec<CommandAuditEntity> =
            f.reader.list(f.org, &query).try_collect().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.command.starts_with("Project")));

        let query = AuditQuery::default().commands(["ComponentCreateCommand", "ProjectDeleteCommand"]);
        let rows: Vec<CommandAuditEntity> =
            f.reader.list(f.org, &query).try_collect().await.unwrap();
        assert_eq!(rows.len(), 2);

        let rows: Vec<CommandAuditEntity> = f
            .reader
            .list(f.org, &AuditQuery::default().within(Duration::from_secs(3600)))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 4);
    }

    #[tokio::test]
    async fn list_surfaces_storage_errors() {
        let f = fixture(10);
        f.tables.fail_next(FaultPoint::TableQuery, 1);
        let outcome: Result<Vec<CommandAuditEntity>, AuditError> =
            f.reader.list(f.org, &AuditQuery::default()).try_collect().await;
        assert!(matches!(outcome, Err(AuditError::Storage(_))));
    }
}
