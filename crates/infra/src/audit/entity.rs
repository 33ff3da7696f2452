use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use teamcloud_commands::{Command, CommandResult, RuntimeStatus};
use teamcloud_core::{path_segment_safe, CommandId, OrganizationId};

use crate::storage::TableEntity;

use super::AuditError;

/// Seconds between 1601-01-01 and the unix epoch. Table storage cannot hold
/// anything at or before that instant, so such values are ignored.
const MIN_STORABLE_TIMESTAMP: i64 = -11_644_473_600;

const COMMAND_QUALIFIER: &str = "command";
const RESULT_QUALIFIER: &str = "result";

/// One audit row per command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAuditEntity {
    pub organization_id: String,
    pub command_id: String,
    pub project_id: Option<String>,
    pub parent_id: Option<String>,
    pub user_id: Option<String>,
    /// Canonical command name, e.g. `ProjectCreateCommand`.
    pub command: String,
    pub runtime_status: RuntimeStatus,
    pub custom_status: String,
    /// `[Severity] message` lines.
    pub errors: String,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    /// Last write as recorded by the store.
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_json: Option<String>,
}

impl CommandAuditEntity {
    /// Fresh row for a command that has not been audited yet.
    pub fn from_command(command: &Command) -> Self {
        Self {
            organization_id: command.organization_id.to_string(),
            command_id: command.command_id.to_string(),
            project_id: command.project_id.map(|p| p.to_string()),
            parent_id: command.parent_id.map(|p| p.to_string()),
            user_id: Some(command.user.id.to_string()),
            command: command.name(),
            runtime_status: RuntimeStatus::Unknown,
            custom_status: String::new(),
            errors: String::new(),
            created: None,
            updated: None,
            timestamp: None,
            command_json: None,
            result_json: None,
        }
    }

    /// Fold a (command, result) snapshot into the existing row.
    ///
    /// `created` only moves back and `updated` only moves forward, so writing
    /// the same snapshot twice, or an older snapshot after a newer one, never
    /// regresses either. Status fields are taken from the result unless it is
    /// older than what the row already reflects.
    pub fn merge(existing: Option<Self>, command: &Command, result: Option<&CommandResult>) -> Self {
        let mut entity = existing.unwrap_or_else(|| Self::from_command(command));
        entity.command = command.name();
        if entity.project_id.is_none() {
            entity.project_id = command.project_id.map(|p| p.to_string());
        }
        if entity.parent_id.is_none() {
            entity.parent_id = command.parent_id.map(|p| p.to_string());
        }

        let previous_update = entity.updated;
        let result_created = result.and_then(|r| r.created_time);
        let result_updated = result.and_then(|r| r.last_updated_time);

        entity.created = earliest([entity.created, Some(command.created), result_created]);
        entity.updated = latest([entity.updated, Some(command.created), result_updated]);
        if entity.created.is_none() && entity.updated.is_none() {
            let now = Utc::now();
            entity.created = Some(now);
            entity.updated = Some(now);
        }

        if let Some(result) = result {
            let stale = matches!(
                (result_updated, previous_update),
                (Some(incoming), Some(seen)) if incoming < seen
            );
            if !stale {
                entity.runtime_status = result.runtime_status();
                entity.custom_status = result.custom_status.clone().unwrap_or_default();
                entity.errors = result.errors_text();
            }
        }

        entity
    }

    pub fn partition_key(&self) -> &str {
        &self.organization_id
    }

    pub fn row_key(&self) -> &str {
        &self.command_id
    }

    pub fn command_path(&self) -> String {
        dump_path(
            Some(&self.organization_id),
            self.project_id.as_deref(),
            &self.command_id,
            COMMAND_QUALIFIER,
        )
    }

    pub fn result_path(&self) -> String {
        dump_path(
            Some(&self.organization_id),
            self.project_id.as_deref(),
            &self.command_id,
            RESULT_QUALIFIER,
        )
    }

    pub fn to_table_entity(&self) -> TableEntity {
        let mut row = TableEntity::new(&self.organization_id, &self.command_id)
            .with("OrganizationId", self.organization_id.as_str())
            .with("CommandId", self.command_id.as_str())
            .with("Command", self.command.as_str())
            .with("RuntimeStatus", self.runtime_status.as_str())
            .with("CustomStatus", self.custom_status.as_str())
            .with("Errors", self.errors.as_str());
        for (name, value) in [
            ("ProjectId", self.project_id.as_deref()),
            ("ParentId", self.parent_id.as_deref()),
            ("UserId", self.user_id.as_deref()),
        ] {
            if let Some(value) = value {
                row = row.with(name, value);
            }
        }
        if let Some(created) = self.created {
            row = row.with("Created", format_timestamp(created));
        }
        if let Some(updated) = self.updated {
            row = row.with("Updated", format_timestamp(updated));
        }
        row
    }

    pub fn from_table_entity(row: &TableEntity) -> Result<Self, AuditError> {
        let text = |name: &str| row.get_str(name).map(str::to_string);
        let runtime_status = match row.get_str("RuntimeStatus") {
            Some(raw) => raw
                .parse()
                .map_err(|_| AuditError::Serialization(format!("unknown runtime status '{raw}'")))?,
            None => RuntimeStatus::Unknown,
        };
        Ok(Self {
            organization_id: row.partition_key.clone(),
            command_id: row.row_key.clone(),
            project_id: text("ProjectId"),
            parent_id: text("ParentId"),
            user_id: text("UserId"),
            command: text("Command").unwrap_or_default(),
            runtime_status,
            custom_status: text("CustomStatus").unwrap_or_default(),
            errors: text("Errors").unwrap_or_default(),
            created: parse_timestamp(row.get_str("Created"))?,
            updated: parse_timestamp(row.get_str("Updated"))?,
            timestamp: row.timestamp,
            command_json: None,
            result_json: None,
        })
    }
}

/// Blob path of a command or result dump:
/// `{organizationId}/{projectId}/{commandId}.{qualifier}.json`.
///
/// Identifiers that are missing or not UUIDs become the nil UUID so the path
/// never contains an empty segment.
pub fn dump_path(
    organization_id: Option<&str>,
    project_id: Option<&str>,
    command_id: &str,
    qualifier: &str,
) -> String {
    format!(
        "{}/{}/{}.{}.json",
        path_segment_safe(organization_id),
        path_segment_safe(project_id),
        command_id,
        qualifier
    )
}

pub fn command_dump_path(command: &Command) -> String {
    let project = command.project_id.map(|p| p.to_string());
    dump_path(
        Some(&command.organization_id.to_string()),
        project.as_deref(),
        &command.command_id.to_string(),
        COMMAND_QUALIFIER,
    )
}

pub fn result_dump_path(command: &Command, result: &CommandResult) -> String {
    let project = command.project_id.map(|p| p.to_string());
    dump_path(
        Some(&result.organization_id.to_string()),
        project.as_deref(),
        &result.command_id.to_string(),
        RESULT_QUALIFIER,
    )
}

pub(crate) fn row_keys(organization_id: OrganizationId, command_id: CommandId) -> (String, String) {
    (organization_id.to_string(), command_id.to_string())
}

fn is_storable(value: &DateTime<Utc>) -> bool {
    value.timestamp() > MIN_STORABLE_TIMESTAMP
}

fn earliest<const N: usize>(values: [Option<DateTime<Utc>>; N]) -> Option<DateTime<Utc>> {
    values.into_iter().flatten().filter(is_storable).min()
}

fn latest<const N: usize>(values: [Option<DateTime<Utc>>; N]) -> Option<DateTime<Utc>> {
    values.into_iter().flatten().filter(is_storable).max()
}

/// Fixed-width RFC 3339, so string order equals time order.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: Option<&str>) -> Result<Option<DateTime<Utc>>, AuditError> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| AuditError::Serialization(format!("bad timestamp '{raw}': {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use teamcloud_commands::{CommandAction, CommandError, CommandPayload};
    use teamcloud_core::{Project, ProjectId, ResourceState, User, UserRole, UserId};

    pub(crate) fn project_command() -> Command {
        let org = OrganizationId::new();
        let user = User {
            id: UserId::new(),
            organization: org,
            display_name: "ops".to_string(),
            role: UserRole::Admin,
        };
        let project = Project {
            id: ProjectId::new(),
            organization: org,
            display_name: "alpha".to_string(),
            resource_state: ResourceState::Pending,
        };
        Command::new(CommandAction::Create, user, CommandPayload::Project(project))
    }

    #[test]
    fn first_write_creates_row_from_command() {
        let command = project_command();
        let row = CommandAuditEntity::merge(None, &command, None);

        assert_eq!(row.command, "ProjectCreateCommand");
        assert_eq!(row.organization_id, command.organization_id.to_string());
        assert_eq!(row.project_id, command.project_id.map(|p| p.to_string()));
        assert_eq!(row.created, Some(command.created));
        assert_eq!(row.runtime_status, RuntimeStatus::Unknown);
    }

    #[test]
    fn result_fields_overwrite_and_errors_render_as_lines() {
        let command = project_command();
        let mut result = CommandResult::new(&command);
        result.set_runtime_status(RuntimeStatus::Running);
        result.set_custom_status("Processing command");
        result.add_error(CommandError::warning("slow"));
        result.add_error(CommandError::error("boom"));

        let row = CommandAuditEntity::merge(None, &command, Some(&result));
        assert_eq!(row.runtime_status, RuntimeStatus::Failed);
        assert_eq!(row.custom_status, "Processing command");
        assert_eq!(row.errors, "[Warning] slow\n[Error] boom");
    }

    #[test]
    fn stale_result_does_not_regress_row() {
        let command = project_command();
        let mut pending = CommandResult::new(&command);
        pending.set_runtime_status(RuntimeStatus::Pending);
        let mut completed = pending.clone();
        completed.set_runtime_status(RuntimeStatus::Completed);
        completed.last_updated_time = pending.last_updated_time.map(|t| t + Duration::seconds(5));

        let row = CommandAuditEntity::merge(None, &command, Some(&completed));
        let row = CommandAuditEntity::merge(Some(row), &command, Some(&pending));

        assert_eq!(row.runtime_status, RuntimeStatus::Completed);
        assert_eq!(row.updated, completed.last_updated_time);
    }

    #[test]
    fn sentinel_timestamps_are_ignored() {
        let command = project_command();
        let mut result = CommandResult::new(&command);
        result.created_time = DateTime::<Utc>::from_timestamp(MIN_STORABLE_TIMESTAMP - 10, 0);

        let row = CommandAuditEntity::merge(None, &command, Some(&result));
        assert_eq!(row.created, Some(command.created));
    }

    #[test]
    fn table_mapping_preserves_fields() {
        let command = project_command();
        let mut result = CommandResult::new(&command);
        result.set_runtime_status(RuntimeStatus::Running);
        let row = CommandAuditEntity::merge(None, &command, Some(&result));

        let back = CommandAuditEntity::from_table_entity(&row.to_table_entity()).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn dump_paths_normalise_identifiers() {
        assert_eq!(
            dump_path(Some("not-a-guid"), None, "c1", "command"),
            "00000000-0000-0000-0000-000000000000/00000000-0000-0000-0000-000000000000/c1.command.json"
        );

        let command = project_command();
        let path = command_dump_path(&command);
        assert!(path.starts_with(&command.organization_id.to_string()));
        assert!(path.ends_with(&format!("{}.command.json", command.command_id)));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn snapshot(offset_secs: i64, status: RuntimeStatus) -> (Command, CommandResult) {
            let command = project_command();
            let mut result = CommandResult::new(&command);
            result.set_runtime_status(status);
            result.last_updated_time = Some(command.created + Duration::seconds(offset_secs));
            (command, result)
        }

        proptest! {
            #[test]
            fn merge_is_idempotent(offset in 0i64..86_400, idx in 0usize..RuntimeStatus::ALL.len()) {
                let (command, result) = snapshot(offset, RuntimeStatus::ALL[idx]);
                let once = CommandAuditEntity::merge(None, &command, Some(&result));
                let twice = CommandAuditEntity::merge(Some(once.clone()), &command, Some(&result));
                prop_assert_eq!(once, twice);
            }

            #[test]
            fn updated_never_moves_backwards(offsets in proptest::collection::vec(0i64..86_400, 1..8)) {
                let command = project_command();
                let mut row: Option<CommandAuditEntity> = None;
                let mut high = None;
                for offset in offsets {
                    let mut result = CommandResult::new(&command);
                    result.last_updated_time = Some(command.created + Duration::seconds(offset));
                    let merged = CommandAuditEntity::merge(row.take(), &command, Some(&result));
                    prop_assert!(merged.updated >= high);
                    prop_assert!(merged.created <= Some(command.created));
                    high = merged.updated;
                    row = Some(merged);
                }
            }
        }
    }
}
