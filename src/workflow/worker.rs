//! Workflow worker handling job execution.
//!
//! A worker repeatedly claims a runnable job token, executes the job, and
//! posts the results back in one atomic batch: the consumed triggering
//! events disappear, the job token returns to the waiting branch with its
//! history extended, output events land on successor inputs, and any
//! successor whose inputs are now all satisfied moves to the runnable
//! branch.  Ownership of the claimed token is leased and renewed while the
//! job runs; a worker that dies simply loses its tokens at expiration and
//! someone else redoes the work, so jobs are assumed idempotent.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use slog::{debug, info, warn, Logger};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::grpc::proto::{Token, TokenQuery};
use crate::grpc::MasterClient;
use crate::master::{now_secs, MasterError};
use crate::workflow::archiver::Archiver;
use crate::workflow::event::{consolidate_attributes, EventRecord};
use crate::workflow::executor::{ExecutionContext, ExecutorError, JobExecutor};
use crate::workflow::inspector::Inspector;
use crate::workflow::job::{ExecutionRecord, JobRecord};
use crate::workflow::name::{TokenName, RUNNABLE_STATE, WAITING_STATE};
use crate::workflow::signal::{SignalAction, SignalRecord, Signaller};
use crate::workflow::{Result, WorkflowError};

// How many times a completion batch is rebuilt after racing with another
// actor before the lease is left to expire.
const COMPLETION_ATTEMPTS: usize = 5;

/// What one pass of the worker loop did.
#[derive(Debug, PartialEq)]
pub enum LoopOutcome {
    /// Claimed and executed a job.
    Executed,
    /// Found nothing claimable.
    Idle,
    /// Observed an applicable EXIT signal.
    Exit,
}

pub struct Worker {
    client: MasterClient,
    executor: Arc<dyn JobExecutor>,
    config: WorkerConfig,
    name: String,
    log: Logger,
}

impl Worker {
    pub fn new(
        client: MasterClient,
        executor: Arc<dyn JobExecutor>,
        config: WorkerConfig,
        log: Logger,
    ) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let name = format!("{}-{}-{}", host, std::process::id(), Uuid::new_v4());
        Self {
            client,
            executor,
            config,
            name,
            log,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn jittered_poll(&self) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64((1.0 + jitter) * self.config.poll_secs as f64)
    }

    /// Run the worker until an applicable EXIT signal appears.
    pub async fn run(&mut self) {
        info!(self.log, "running worker"; "name" => &self.name, "generation" => self.config.generation);
        loop {
            match self.run_once().await {
                Ok(LoopOutcome::Exit) => break,
                Ok(LoopOutcome::Executed) => {}
                Ok(LoopOutcome::Idle) => tokio::time::sleep(self.jittered_poll()).await,
                Err(e) => {
                    warn!(self.log, "worker loop error"; "error" => %e);
                    tokio::time::sleep(self.jittered_poll()).await;
                }
            }
        }
        info!(self.log, "exiting worker"; "name" => &self.name);
    }

    /// Run until a pass finds nothing to do.  Test and drain helper.
    pub async fn run_until_idle(&mut self) -> Result<()> {
        loop {
            match self.run_once().await? {
                LoopOutcome::Executed => {}
                LoopOutcome::Idle | LoopOutcome::Exit => return Ok(()),
            }
        }
    }

    async fn run_once(&mut self) -> Result<LoopOutcome> {
        let signals = Signaller::load(self.client.clone(), None, None).await?;
        if signals.exit_requested(self.config.generation) {
            return Ok(LoopOutcome::Exit);
        }
        if signals.is_set(SignalAction::Drain) {
            return Ok(LoopOutcome::Idle);
        }
        match self.claim_job().await? {
            Some(token) => {
                self.execute_job(token).await?;
                Ok(LoopOutcome::Executed)
            }
            None => Ok(LoopOutcome::Idle),
        }
    }

    /// Attempt to own one runnable job token from any workflow instance.
    ///
    /// Workflows and instances are shuffled to address starvation.
    async fn claim_job(&mut self) -> Result<Option<Token>> {
        let mut inspector = Inspector::new(self.client.clone());
        let mut workflows = inspector.workflow_names().await?;
        workflows.shuffle(&mut rand::thread_rng());
        for workflow in workflows {
            let mut instances = inspector.instance_ids(&workflow).await?;
            instances.shuffle(&mut rand::thread_rng());
            for instance in instances {
                if !self.process_signals(&workflow, &instance).await? {
                    continue;
                }
                let prefix = TokenName::new()
                    .with_workflow(&workflow)
                    .with_instance(&instance)
                    .with_job_state(RUNNABLE_STATE)
                    .job_state_prefix()
                    .expect("name components are set");
                let expiration = now_secs() + self.config.lease_secs;
                let mut claimed = self
                    .client
                    .query_and_own(&self.name, expiration, &prefix, 1)
                    .await?;
                if let Some(token) = claimed.pop() {
                    info!(self.log, "claimed job token"; "name" => &token.name);
                    return Ok(Some(token));
                }
            }
        }
        Ok(None)
    }

    /// Consult instance signals.  Returns true iff the worker may claim
    /// jobs in this instance; archival work happens here as a side effect.
    async fn process_signals(&mut self, workflow: &str, instance: &str) -> Result<bool> {
        let mut signals =
            Signaller::load(self.client.clone(), Some(workflow), Some(instance)).await?;
        if signals.exit_requested(self.config.generation) {
            return Ok(false);
        }
        if signals.is_set(SignalAction::Archive) {
            if self.is_done(workflow, instance).await? {
                let deadline = now_secs() + self.config.archive_delay_secs;
                if !signals
                    .set_timestamp_if_missing(SignalAction::Archive, deadline)
                    .await?
                {
                    if let Some(timestamp) = signals.timestamp(SignalAction::Archive) {
                        Archiver::new(self.client.clone(), workflow, instance)
                            .archive_if_expired(timestamp)
                            .await?;
                    }
                }
            }
            return Ok(false);
        }
        if signals.is_set(SignalAction::Abort) {
            Archiver::new(self.client.clone(), workflow, instance)
                .archive_if_aborted()
                .await?;
            return Ok(false);
        }
        if signals.is_set(SignalAction::Drain) {
            return Ok(false);
        }
        Ok(true)
    }

    /// An instance is done once nothing sits under its runnable branch;
    /// successors are armed inside completion batches, so no waiting job
    /// can become runnable on its own afterwards.
    async fn is_done(&mut self, workflow: &str, instance: &str) -> Result<bool> {
        let mut inspector = Inspector::new(self.client.clone());
        Ok(!inspector.has_runnable_jobs(workflow, instance).await?)
    }

    /// One event token per job input, in input order.  An input may come
    /// back empty when a previous completion already consumed its events;
    /// the execution then runs with the events that do exist.
    async fn triggering_event_tokens(
        &mut self,
        name: &TokenName,
        job: &JobRecord,
    ) -> Result<Vec<Token>> {
        if job.inputs.is_empty() {
            return Ok(Vec::new());
        }
        let queries: Vec<TokenQuery> = job
            .inputs
            .iter()
            .map(|input| TokenQuery {
                name_prefix: name
                    .clone()
                    .with_job(&job.name)
                    .with_input(input)
                    .input_prefix()
                    .expect("name components are set"),
                max_tokens: 1,
            })
            .collect();
        let results = self.client.query(queries).await?;
        Ok(results
            .into_iter()
            .filter_map(|tokens| tokens.into_iter().next())
            .collect())
    }

    async fn execute_job(&mut self, token: Token) -> Result<()> {
        let name = TokenName::from_job_token_name(&token.name)
            .ok_or_else(|| WorkflowError::MalformedName(token.name.clone()))?;
        let workflow = name.workflow.clone().expect("parsed job name");
        let instance = name.instance.clone().expect("parsed job name");
        let mut job = JobRecord::decode(&token.data)?;

        if job.disabled {
            // Disabled jobs are marked successful without executing and
            // without consuming events; downstream arming proceeds.
            let mut record = ExecutionRecord::started(&instance, &self.name, now_secs());
            record.end_time = Some(now_secs());
            record.exit_code = Some(0);
            job.history.push(record);
            info!(self.log, "skipping disabled job"; "name" => &token.name);
            self.complete_success(token, job, Vec::new(), &name).await?;
            self.process_signals(&workflow, &instance).await?;
            return Ok(());
        }

        let triggering = self.triggering_event_tokens(&name, &job).await?;

        // Record the execution start before running; this also refreshes
        // the token version, so a lost lease is caught here.
        let mut record = ExecutionRecord::started(&instance, &self.name, now_secs());
        record.events = triggering
            .iter()
            .filter_map(|t| EventRecord::decode(&t.data).ok())
            .collect();
        job.history.push(record);
        let mut started = token.clone();
        started.data = job.encode();
        let owned = match self.client.modify(vec![started], vec![]).await {
            Ok(mut written) => written
                .pop()
                .ok_or_else(|| MasterError::Unknown("modify returned no tokens".to_string()))?,
            Err(MasterError::VersionConflict(_)) => {
                warn!(self.log, "lease lost before execution"; "name" => &token.name);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let shared = Arc::new(Mutex::new(owned));
        let (abort_tx, abort_rx) = watch::channel(false);
        let renewal = self.spawn_lease_renewal(
            shared.clone(),
            abort_tx,
            workflow.clone(),
            instance.clone(),
        );

        let attributes = consolidate_attributes(
            &job.last_record().map(|r| r.events.clone()).unwrap_or_default(),
        );
        let outcome = self
            .executor
            .execute(ExecutionContext {
                workflow: workflow.clone(),
                instance: instance.clone(),
                job: job.name.clone(),
                command: job.command.clone(),
                attributes,
                abort: abort_rx,
            })
            .await;
        renewal.abort();

        let token = shared.lock().await.clone();
        let (exit_code, aborted) = match &outcome {
            Ok(outcome) => (outcome.exit_code, false),
            Err(ExecutorError::Aborted) => (-1, true),
            Err(ExecutorError::Launch(_)) => (-1, false),
        };
        {
            let record = job.last_record_mut().expect("record pushed above");
            record.end_time = Some(now_secs());
            record.exit_code = Some(exit_code);
            if let Ok(outcome) = &outcome {
                record.properties = outcome.properties.clone();
            }
        }
        debug!(self.log, "job execution finished";
            "name" => &token.name,
            "exit_code" => exit_code
        );

        if exit_code == 0 {
            self.complete_success(token, job, triggering, &name).await?;
        } else if !aborted && job.retry(&instance) {
            self.release_for_retry(token, job).await?;
        } else {
            self.complete_failure(token, job, &name).await?;
        }
        // If this was the end of the instance, archive it.
        self.process_signals(&workflow, &instance).await?;
        Ok(())
    }

    /// Periodic lease renewal for the owned token.  Extends the lease when
    /// less than half of it remains and aborts the execution on an
    /// instance ABORT signal or a renewal conflict (lost lease).
    fn spawn_lease_renewal(
        &self,
        shared: Arc<Mutex<Token>>,
        abort_tx: watch::Sender<bool>,
        workflow: String,
        instance: String,
    ) -> tokio::task::JoinHandle<()> {
        let mut client = self.client.clone();
        let lease_secs = self.config.lease_secs;
        let poll_secs = self.config.poll_secs;
        let log = self.log.clone();
        tokio::spawn(async move {
            loop {
                let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
                let sleep = Duration::from_secs_f64((1.0 + jitter) * poll_secs as f64);
                tokio::time::sleep(sleep).await;

                match Signaller::load(client.clone(), Some(&workflow), Some(&instance)).await {
                    Ok(signals) if signals.is_set(SignalAction::Abort) => {
                        let _ = abort_tx.send(true);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(log, "signal check failed, aborting job"; "error" => %e);
                        let _ = abort_tx.send(true);
                        return;
                    }
                }

                let mut token = shared.lock().await;
                if token.expiration_time < now_secs() + lease_secs / 2 {
                    let mut renewed = token.clone();
                    renewed.expiration_time = now_secs() + lease_secs;
                    match client.modify(vec![renewed], vec![]).await {
                        Ok(mut written) => {
                            if let Some(fresh) = written.pop() {
                                *token = fresh;
                            }
                        }
                        Err(e) => {
                            warn!(log, "lease renewal failed, aborting job"; "error" => %e);
                            let _ = abort_tx.send(true);
                            return;
                        }
                    }
                }
            }
        })
    }

    fn waiting_token(&self, name: &TokenName, token: &Token, job: &JobRecord) -> Token {
        Token {
            name: name
                .clone()
                .with_job_state(WAITING_STATE)
                .job_token_name()
                .expect("name components are set"),
            priority: token.priority,
            data: job.encode(),
            ..Default::default()
        }
    }

    fn output_event_tokens(&self, name: &TokenName, job: &JobRecord) -> Vec<Token> {
        let properties = job
            .last_record()
            .map(|record| record.properties.clone())
            .unwrap_or_default();
        job.outputs
            .iter()
            .map(|output| {
                let event = EventRecord {
                    creator: self.name.clone(),
                    attributes: properties.clone(),
                };
                Token {
                    name: name
                        .clone()
                        .with_job(output)
                        .with_input(&job.name)
                        .with_event(&Uuid::new_v4().to_string())
                        .event_token_name()
                        .expect("name components are set"),
                    data: event.encode(),
                    ..Default::default()
                }
            })
            .collect()
    }

    /// Successor moves for the completion batch: any output job whose
    /// inputs are all satisfied once this batch lands goes from waiting to
    /// runnable.
    async fn successor_moves(
        &mut self,
        name: &TokenName,
        job: &JobRecord,
    ) -> Result<(Vec<Token>, Vec<Token>)> {
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for output in &job.outputs {
            let waiting_name = name
                .clone()
                .with_job_state(WAITING_STATE)
                .with_job(output)
                .job_token_name()
                .expect("name components are set");
            // The prefix query doubles as an exact fetch; check the name so
            // a sibling job extending it cannot slip in.
            let Some(waiting) = self
                .client
                .query_prefix(&waiting_name, 1)
                .await?
                .into_iter()
                .find(|t| t.name == waiting_name)
            else {
                continue;
            };
            let successor = JobRecord::decode(&waiting.data)?;
            let mut armed = true;
            for input in &successor.inputs {
                // The event posted by this very batch satisfies our own
                // input edge.
                if input == &job.name {
                    continue;
                }
                let prefix = name
                    .clone()
                    .with_job(output)
                    .with_input(input)
                    .input_prefix()
                    .expect("name components are set");
                if self.client.query_prefix(&prefix, 1).await?.is_empty() {
                    armed = false;
                    break;
                }
            }
            if armed {
                updates.push(Token {
                    name: name
                        .clone()
                        .with_job_state(RUNNABLE_STATE)
                        .with_job(output)
                        .job_token_name()
                        .expect("name components are set"),
                    priority: waiting.priority,
                    data: waiting.data.clone(),
                    ..Default::default()
                });
                deletes.push(waiting);
            }
        }
        Ok((updates, deletes))
    }

    /// Token inserting the instance ARCHIVE signal, unless already set.
    async fn archive_signal_token(&mut self, name: &TokenName) -> Result<Option<Token>> {
        let workflow = name.workflow.as_deref().expect("parsed job name");
        let instance = name.instance.as_deref().expect("parsed job name");
        let signals =
            Signaller::load(self.client.clone(), Some(workflow), Some(instance)).await?;
        if signals.is_set(SignalAction::Archive) {
            return Ok(None);
        }
        let signal_name = TokenName::new()
            .with_workflow(workflow)
            .with_instance(instance)
            .with_signal(SignalAction::Archive.as_str())
            .signal_token_name()
            .expect("signal name is complete");
        Ok(Some(Token {
            name: signal_name,
            data: SignalRecord::new(SignalAction::Archive).encode(),
            ..Default::default()
        }))
    }

    /// Post a successful completion as one atomic batch, rebuilding it a
    /// few times if another actor races us.  A conflict on our own token
    /// means the lease was lost and the result is discarded.
    async fn complete_success(
        &mut self,
        mut token: Token,
        job: JobRecord,
        consumed: Vec<Token>,
        name: &TokenName,
    ) -> Result<()> {
        let mut consumed = consumed;
        for attempt in 0..COMPLETION_ATTEMPTS {
            let mut updates = vec![self.waiting_token(name, &token, &job)];
            updates.extend(self.output_event_tokens(name, &job));
            let (armed, waiting_deletes) = self.successor_moves(name, &job).await?;
            updates.extend(armed);
            if job.outputs.is_empty() {
                // Terminal job: the instance is finished.
                if let Some(signal) = self.archive_signal_token(name).await? {
                    updates.push(signal);
                }
            }
            let mut deletes = vec![token.clone()];
            deletes.extend(consumed.iter().cloned());
            deletes.extend(waiting_deletes);

            match self.client.modify(updates, deletes).await {
                Ok(_) => {
                    debug!(self.log, "completed job"; "name" => &token.name);
                    return Ok(());
                }
                Err(MasterError::VersionConflict(_)) => {
                    // A conflict on a successor or event is recoverable; a
                    // conflict because our own token is no longer ours means
                    // the lease was lost.  The renewal task may also have
                    // bumped our version right before it was stopped.
                    let current = self.client.query_prefix(&token.name, 1).await?;
                    match current.into_iter().find(|t| t.name == token.name) {
                        Some(t) if t.owner == self.name && t.expiration_time > now_secs() => {
                            token = t;
                        }
                        _ => {
                            warn!(self.log, "lease lost, discarding result"; "name" => &token.name);
                            return Ok(());
                        }
                    }
                    consumed = self.refresh_consumed(consumed).await?;
                    warn!(self.log, "completion batch conflicted, rebuilding";
                        "name" => &token.name,
                        "attempt" => attempt
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(self.log, "giving up on completion, lease will expire"; "name" => &token.name);
        Ok(())
    }

    /// Re-read consumed event tokens to pick up fresh versions; events
    /// deleted in the meantime drop out of the batch.
    async fn refresh_consumed(&mut self, consumed: Vec<Token>) -> Result<Vec<Token>> {
        let mut refreshed = Vec::with_capacity(consumed.len());
        for event in consumed {
            if let Some(current) = self
                .client
                .query_prefix(&event.name, 1)
                .await?
                .into_iter()
                .find(|t| t.name == event.name)
            {
                refreshed.push(current);
            }
        }
        Ok(refreshed)
    }

    /// Record a terminal failure: the job token returns to the waiting
    /// branch without posting events, and the instance gets its ARCHIVE
    /// signal.
    async fn complete_failure(
        &mut self,
        token: Token,
        job: JobRecord,
        name: &TokenName,
    ) -> Result<()> {
        let mut updates = vec![self.waiting_token(name, &token, &job)];
        if let Some(signal) = self.archive_signal_token(name).await? {
            updates.push(signal);
        }
        match self.client.modify(updates, vec![token.clone()]).await {
            Ok(_) => Ok(()),
            Err(MasterError::VersionConflict(_)) => {
                warn!(self.log, "lease lost recording failure"; "name" => &token.name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a retryable failure: the token stays in the runnable branch.
    /// A retry delay is expressed as a short lease, which keeps the token
    /// unclaimable until the delay passes.
    async fn release_for_retry(&mut self, token: Token, job: JobRecord) -> Result<()> {
        let mut released = token.clone();
        released.data = job.encode();
        if job.retry_delay_secs > 0 {
            released.expiration_time = now_secs() + job.retry_delay_secs;
        } else {
            released.owner = String::new();
            released.expiration_time = 0;
        }
        match self.client.modify(vec![released], vec![]).await {
            Ok(_) => Ok(()),
            Err(MasterError::VersionConflict(_)) => {
                warn!(self.log, "lease lost releasing for retry"; "name" => &token.name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
