//! Hierarchy exploration over `group` queries.

use crate::grpc::MasterClient;
use crate::workflow::name::{SIGNAL_MARKER, TokenName, RUNNABLE_STATE, WORKFLOW_PREFIX};
use crate::workflow::Result;

/// Read-only view of the workflow namespace.
pub struct Inspector {
    client: MasterClient,
}

impl Inspector {
    pub fn new(client: MasterClient) -> Self {
        Self { client }
    }

    fn group_members(counts: impl IntoIterator<Item = (String, i64)>) -> Vec<String> {
        counts
            .into_iter()
            .filter_map(|(group, _)| {
                let member = group.strip_suffix('/').unwrap_or(&group);
                if member.is_empty() || member == SIGNAL_MARKER {
                    None
                } else {
                    Some(member.to_string())
                }
            })
            .collect()
    }

    /// Names of workflows with any live tokens.
    pub async fn workflow_names(&mut self) -> Result<Vec<String>> {
        let counts = self.client.group(WORKFLOW_PREFIX, "/").await?;
        Ok(Self::group_members(counts))
    }

    /// Live instance ids of a workflow.
    pub async fn instance_ids(&mut self, workflow: &str) -> Result<Vec<String>> {
        let prefix = TokenName::new()
            .with_workflow(workflow)
            .workflow_prefix()
            .expect("workflow is set");
        let counts = self.client.group(&prefix, "/").await?;
        Ok(Self::group_members(counts))
    }

    /// True iff the instance has any token under its runnable branch
    /// (claimable or running).
    pub async fn has_runnable_jobs(&mut self, workflow: &str, instance: &str) -> Result<bool> {
        let prefix = TokenName::new()
            .with_workflow(workflow)
            .with_instance(instance)
            .with_job_state(RUNNABLE_STATE)
            .job_state_prefix()
            .expect("name components are set");
        let tokens = self.client.query_prefix(&prefix, 1).await?;
        Ok(!tokens.is_empty())
    }
}
