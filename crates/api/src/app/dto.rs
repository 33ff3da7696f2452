use std::time::Duration;

use serde::Deserialize;

use teamcloud_core::ProjectId;
use teamcloud_infra::audit::AuditQuery;

// -------------------------
// Query DTOs
// -------------------------

/// `GET /orgs/{org}/audit?project=&range_secs=&commands=a,b<>`
#[derive(Debug, Default, Deserialize)]
pub struct AuditListQuery {
    pub project: Option<ProjectId>,
    pub range_secs: Option<u64>,
    /// Comma separated command names; a trailing `<>` makes a prefix match.
    pub commands: Option<String>,
}

impl AuditListQuery {
    pub fn to_audit_query(&self) -> AuditQuery {
        let mut query = AuditQuery::default();
        if let Some(project) = self.project {
            query = query.for_project(project);
        }
        if let Some(secs) = self.range_secs.filter(|s| *s > 0) {
            query = query.within(Duration::from_secs(secs));
        }
        if let Some(commands) = &self.commands {
            query = query.commands(
                commands
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty()),
            );
        }
        query
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_filter() {
        let project = ProjectId::new();
        let dto = AuditListQuery {
            project: Some(project),
            range_secs: Some(3600),
            commands: Some(" ProjectCreateCommand, Component<> ,".to_string()),
        };

        let query = dto.to_audit_query();
        assert_eq!(query.project_id, Some(project));
        assert_eq!(query.time_range, Some(Duration::from_secs(3600)));
        assert_eq!(
            query.commands,
            vec!["ProjectCreateCommand".to_string(), "Component<>".to_string()]
        );
    }

    #[test]
    fn empty_query_lists_everything() {
        assert_eq!(
            AuditListQuery {
                range_secs: Some(0),
                ..Default::default()
            }
            .to_audit_query(),
            AuditQuery::default()
        );
    }
}
