//! Construction and parsing of workflow token names.
//!
//! Token names are hierarchical with `/` as the level separator.
//!
//! Job tokens:
//! `/workflow/<workflow>/<instance>/job/[waiting|runnable]/<job>`
//!
//! Event tokens:
//! `/workflow/<workflow>/<instance>/input/<job>/<input>/<event>`
//! where `<input>` names the upstream job the event came from, or the
//! distinguished workflow-start input for jobs with no dependencies.
//!
//! Signal tokens, by scope:
//! `/workflow/__SIGNAL__/<action>`,
//! `/workflow/<workflow>/__SIGNAL__/<action>`,
//! `/workflow/<workflow>/<instance>/__SIGNAL__/<action>`.
//!
//! Schedule tokens: `/schedule/workflow/<workflow>`.

pub const WORKFLOW_PREFIX: &str = "/workflow/";
pub const SCHEDULE_PREFIX: &str = "/schedule/";
pub const WORKFLOW_SCHEDULE_PREFIX: &str = "/schedule/workflow/";

pub const WAITING_STATE: &str = "waiting";
pub const RUNNABLE_STATE: &str = "runnable";

pub const SIGNAL_MARKER: &str = "__SIGNAL__";

/// Input defined for jobs with no upstream dependencies.
pub const WORKFLOW_START_INPUT: &str = "__WORKFLOW_START__";

/// A (partially filled) hierarchical token name.
///
/// Prefix accessors return `None` unless every component they need is set,
/// so a caller cannot accidentally build a prefix that silently matches too
/// much of the namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenName {
    pub workflow: Option<String>,
    pub instance: Option<String>,
    pub job_state: Option<String>,
    pub job: Option<String>,
    pub input: Option<String>,
    pub event: Option<String>,
    pub signal: Option<String>,
}

impl TokenName {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(mut self, workflow: &str) -> Self {
        self.workflow = Some(workflow.to_string());
        self
    }

    pub fn with_instance(mut self, instance: &str) -> Self {
        self.instance = Some(instance.to_string());
        self
    }

    pub fn with_job_state(mut self, job_state: &str) -> Self {
        self.job_state = Some(job_state.to_string());
        self
    }

    pub fn with_job(mut self, job: &str) -> Self {
        self.job = Some(job.to_string());
        self
    }

    pub fn with_input(mut self, input: &str) -> Self {
        self.input = Some(input.to_string());
        self
    }

    pub fn with_event(mut self, event: &str) -> Self {
        self.event = Some(event.to_string());
        self
    }

    pub fn with_signal(mut self, signal: &str) -> Self {
        self.signal = Some(signal.to_string());
        self
    }

    pub fn workflow_prefix(&self) -> Option<String> {
        let workflow = self.workflow.as_ref()?;
        Some(format!("{}{}/", WORKFLOW_PREFIX, workflow))
    }

    pub fn instance_prefix(&self) -> Option<String> {
        let workflow = self.workflow.as_ref()?;
        let instance = self.instance.as_ref()?;
        Some(format!("{}{}/{}/", WORKFLOW_PREFIX, workflow, instance))
    }

    pub fn job_prefix(&self) -> Option<String> {
        Some(format!("{}job/", self.instance_prefix()?))
    }

    pub fn job_state_prefix(&self) -> Option<String> {
        let state = self.job_state.as_ref()?;
        Some(format!("{}{}/", self.job_prefix()?, state))
    }

    pub fn job_token_name(&self) -> Option<String> {
        let job = self.job.as_ref()?;
        Some(format!("{}{}", self.job_state_prefix()?, job))
    }

    /// Prefix of all events on one input of one job.
    pub fn input_prefix(&self) -> Option<String> {
        let job = self.job.as_ref()?;
        let input = self.input.as_ref()?;
        Some(format!("{}input/{}/{}/", self.instance_prefix()?, job, input))
    }

    pub fn event_token_name(&self) -> Option<String> {
        let event = self.event.as_ref()?;
        Some(format!("{}{}", self.input_prefix()?, event))
    }

    /// Signal prefix at the most specific scope the name describes.
    pub fn signal_prefix(&self) -> String {
        match (&self.workflow, &self.instance) {
            (Some(workflow), Some(instance)) => format!(
                "{}{}/{}/{}/",
                WORKFLOW_PREFIX, workflow, instance, SIGNAL_MARKER
            ),
            (Some(workflow), None) => {
                format!("{}{}/{}/", WORKFLOW_PREFIX, workflow, SIGNAL_MARKER)
            }
            _ => format!("{}{}/", WORKFLOW_PREFIX, SIGNAL_MARKER),
        }
    }

    pub fn signal_token_name(&self) -> Option<String> {
        let signal = self.signal.as_ref()?;
        Some(format!("{}{}", self.signal_prefix(), signal))
    }

    pub fn workflow_schedule_token_name(&self) -> Option<String> {
        let workflow = self.workflow.as_ref()?;
        Some(format!("{}{}", WORKFLOW_SCHEDULE_PREFIX, workflow))
    }

    /// Parse `/workflow/<w>/<i>/job/<state>/<job>`.
    pub fn from_job_token_name(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split('/').collect();
        match parts.as_slice() {
            ["", "workflow", workflow, instance, "job", state, job]
                if *state == WAITING_STATE || *state == RUNNABLE_STATE =>
            {
                Some(
                    Self::new()
                        .with_workflow(workflow)
                        .with_instance(instance)
                        .with_job_state(state)
                        .with_job(job),
                )
            }
            _ => None,
        }
    }

    /// Parse `/workflow/<w>/<i>/input/<job>/<input>/<event>`.
    pub fn from_event_token_name(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split('/').collect();
        match parts.as_slice() {
            ["", "workflow", workflow, instance, "input", job, input, event] => Some(
                Self::new()
                    .with_workflow(workflow)
                    .with_instance(instance)
                    .with_job(job)
                    .with_input(input)
                    .with_event(event),
            ),
            _ => None,
        }
    }

    /// Parse a signal token name at any of the three scopes.
    pub fn from_signal_token_name(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split('/').collect();
        match parts.as_slice() {
            ["", "workflow", marker, signal] if *marker == SIGNAL_MARKER => {
                Some(Self::new().with_signal(signal))
            }
            ["", "workflow", workflow, marker, signal] if *marker == SIGNAL_MARKER => {
                Some(Self::new().with_workflow(workflow).with_signal(signal))
            }
            ["", "workflow", workflow, instance, marker, signal] if *marker == SIGNAL_MARKER => {
                Some(
                    Self::new()
                        .with_workflow(workflow)
                        .with_instance(instance)
                        .with_signal(signal),
                )
            }
            _ => None,
        }
    }

    /// Parse `/schedule/workflow/<w>`.
    pub fn from_workflow_schedule_token_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(WORKFLOW_SCHEDULE_PREFIX)?;
        if rest.is_empty() || rest.contains('/') {
            return None;
        }
        Some(Self::new().with_workflow(rest))
    }
}
