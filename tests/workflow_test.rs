//! Workflow runtime scenarios: parser-emitted instances executed by a real
//! worker against a real master.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{o, Drain, Logger};
use tokio::time::sleep;

use tokenmill::master::{now_secs, ARCHIVE_PREFIX};
use tokenmill::storage::EphemeralStore;
use tokenmill::workflow::executor::{ExecutionContext, ExecutionOutcome, ExecutorError};
use tokenmill::{
    start_grpc_server, GrpcServerHandle, JobDefinition, JobExecutor, JobRecord, MasterClient,
    OverrunPolicy, ScheduleRecord, Scheduler, SchedulerConfig, SignalAction, SignalRecord,
    Signaller, TokenStore, Worker, WorkerConfig, WorkflowDefinition,
};

fn create_logger() -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

async fn start_master(store: Box<dyn TokenStore>) -> (MasterClient, GrpcServerHandle) {
    let log = create_logger();
    let port = port_check::free_local_port().expect("should find a free port");
    let address = format!("127.0.0.1:{}", port);

    let master = tokenmill::master::spawn(store, log.clone());
    master.wait_serving().await.expect("master should recover");
    let server = start_grpc_server(address.clone(), master, log)
        .await
        .expect("server should start");

    for _ in 0..50 {
        if let Ok(client) = MasterClient::connect(&address).await {
            return (client, server);
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("could not connect to master at {}", address);
}

/// Executor that records executions and replays scripted exit codes
/// (default success).
struct ScriptedExecutor {
    executed: Mutex<Vec<String>>,
    exit_codes: Mutex<HashMap<String, VecDeque<i32>>>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            exit_codes: Mutex::new(HashMap::new()),
        }
    }

    fn script(&self, job: &str, codes: &[i32]) {
        self.exit_codes
            .lock()
            .unwrap()
            .insert(job.to_string(), codes.iter().copied().collect());
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionOutcome, ExecutorError> {
        self.executed.lock().unwrap().push(ctx.job.clone());
        let exit_code = self
            .exit_codes
            .lock()
            .unwrap()
            .get_mut(&ctx.job)
            .and_then(|codes| codes.pop_front())
            .unwrap_or(0);
        let mut properties = HashMap::new();
        properties.insert("ran".to_string(), ctx.job.clone());
        Ok(ExecutionOutcome {
            exit_code,
            properties,
        })
    }
}

fn chain_definition() -> WorkflowDefinition {
    WorkflowDefinition {
        workflow: "etl".to_string(),
        jobs: vec![
            JobDefinition {
                name: "extract".to_string(),
                command: "extract".to_string(),
                inputs: vec![],
                max_attempts: 1,
                retry_delay_secs: 0,
                priority: 0.0,
                disabled: false,
            },
            JobDefinition {
                name: "load".to_string(),
                command: "load".to_string(),
                inputs: vec!["extract".to_string()],
                max_attempts: 1,
                retry_delay_secs: 0,
                priority: 0.0,
                disabled: false,
            },
        ],
    }
}

async fn post_instance(client: &mut MasterClient, definition: &WorkflowDefinition) -> String {
    let instance = WorkflowDefinition::new_instance_id();
    let tokens = definition.instance_tokens(&instance).unwrap();
    client.modify(tokens, vec![]).await.unwrap();
    instance
}

fn test_worker(client: MasterClient, executor: Arc<dyn JobExecutor>) -> Worker {
    let config = WorkerConfig::new("unused".to_string())
        .with_lease_secs(60)
        .with_poll_secs(1);
    Worker::new(client, executor, config, create_logger())
}

#[tokio::test]
async fn test_chain_runs_to_completion_and_archives() {
    let store = Arc::new(EphemeralStore::new());
    let (mut client, _server) = start_master(Box::new(store.clone())).await;

    let definition = chain_definition();
    let instance = post_instance(&mut client, &definition).await;

    let executor = Arc::new(ScriptedExecutor::new());
    let mut worker = test_worker(client.clone(), executor.clone());
    worker.run_until_idle().await.unwrap();

    // Dependency order was respected.
    assert_eq!(executor.executed(), vec!["extract", "load"]);

    // The instance left the live namespace in one piece...
    assert!(client.query_prefix("/workflow/", 0).await.unwrap().is_empty());

    // ...and landed in the archive with its history recorded.
    let archived = store.read_archive(ARCHIVE_PREFIX).unwrap();
    let archived_load = archived
        .iter()
        .find(|t| t.name.ends_with("/job/waiting/load"))
        .expect("load job should be archived");
    let job = JobRecord::decode(&archived_load.data).unwrap();
    assert_eq!(job.history.len(), 1);
    assert_eq!(job.history[0].instance, instance);
    assert!(job.history[0].succeeded());
    // The triggering event from extract was absorbed into the history.
    assert_eq!(job.history[0].events.len(), 1);
    assert_eq!(job.history[0].events[0].attributes["ran"], "extract");

    // Consumed events were deleted, so they are not in the archive as live
    // event tokens for load.
    assert!(archived
        .iter()
        .all(|t| !t.name.contains("/input/load/")));
}

#[tokio::test]
async fn test_failed_job_retries_then_gives_up() {
    let store = Arc::new(EphemeralStore::new());
    let (mut client, _server) = start_master(Box::new(store.clone())).await;

    let mut definition = chain_definition();
    definition.jobs[0].max_attempts = 2;
    post_instance(&mut client, &definition).await;

    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("extract", &[1, 1]);
    let mut worker = test_worker(client.clone(), executor.clone());
    worker.run_until_idle().await.unwrap();

    // Both attempts ran, the successor never did.
    assert_eq!(executor.executed(), vec!["extract", "extract"]);

    // The failed instance was archived with both failures on record.
    let archived = store.read_archive(ARCHIVE_PREFIX).unwrap();
    let archived_extract = archived
        .iter()
        .find(|t| t.name.ends_with("/job/waiting/extract"))
        .expect("extract job should be archived");
    let job = JobRecord::decode(&archived_extract.data).unwrap();
    assert_eq!(job.history.len(), 2);
    assert!(job.history.iter().all(|r| !r.succeeded()));

    // The successor is still waiting, with no history.
    let archived_load = archived
        .iter()
        .find(|t| t.name.ends_with("/job/waiting/load"))
        .expect("load job should be archived");
    let load = JobRecord::decode(&archived_load.data).unwrap();
    assert!(load.history.is_empty());
}

#[tokio::test]
async fn test_disabled_job_skips_execution_but_arms_downstream() {
    let store = Arc::new(EphemeralStore::new());
    let (mut client, _server) = start_master(Box::new(store.clone())).await;

    let mut definition = chain_definition();
    definition.jobs[0].disabled = true;
    post_instance(&mut client, &definition).await;

    let executor = Arc::new(ScriptedExecutor::new());
    let mut worker = test_worker(client.clone(), executor.clone());
    worker.run_until_idle().await.unwrap();

    // The disabled job never executed; its successor did.
    assert_eq!(executor.executed(), vec!["load"]);

    // Disabled success consumes no events: the workflow-start event went
    // to the archive untouched.
    let archived = store.read_archive(ARCHIVE_PREFIX).unwrap();
    assert!(archived
        .iter()
        .any(|t| t.name.contains("/input/extract/__WORKFLOW_START__/")));
}

#[tokio::test]
async fn test_drain_stops_claiming() {
    let (mut client, _server) = start_master(Box::new(EphemeralStore::new())).await;

    post_instance(&mut client, &chain_definition()).await;

    let mut signals = Signaller::load(client.clone(), None, None).await.unwrap();
    signals
        .set(SignalRecord::new(SignalAction::Drain))
        .await
        .unwrap();

    let executor = Arc::new(ScriptedExecutor::new());
    let mut worker = test_worker(client.clone(), executor.clone());
    worker.run_until_idle().await.unwrap();

    assert!(executor.executed().is_empty());
    let runnable = client
        .query_prefix("/workflow/etl/", 0)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.name.contains("/job/runnable/"))
        .count();
    assert_eq!(runnable, 1);
}

#[tokio::test]
async fn test_exit_signal_respects_generation() {
    let (mut client, _server) = start_master(Box::new(EphemeralStore::new())).await;

    let mut signals = Signaller::load(client.clone(), None, None).await.unwrap();
    let mut exit = SignalRecord::new(SignalAction::Exit);
    exit.generation = Some(2);
    signals.set(exit).await.unwrap();

    // An old-generation worker exits even with work available.
    post_instance(&mut client, &chain_definition()).await;
    let executor = Arc::new(ScriptedExecutor::new());
    let config = WorkerConfig::new("unused".to_string())
        .with_lease_secs(60)
        .with_poll_secs(1)
        .with_generation(1);
    let mut old_worker = Worker::new(client.clone(), executor.clone(), config, create_logger());
    old_worker.run().await;
    assert!(executor.executed().is_empty());

    // A new-generation worker keeps working.
    let config = WorkerConfig::new("unused".to_string())
        .with_lease_secs(60)
        .with_poll_secs(1)
        .with_generation(2);
    let mut new_worker = Worker::new(client.clone(), executor.clone(), config, create_logger());
    new_worker.run_until_idle().await.unwrap();
    assert_eq!(executor.executed(), vec!["extract", "load"]);
}

#[tokio::test]
async fn test_aborted_instance_is_archived_without_execution() {
    let store = Arc::new(EphemeralStore::new());
    let (mut client, _server) = start_master(Box::new(store.clone())).await;

    post_instance(&mut client, &chain_definition()).await;
    let instances = client.group("/workflow/etl/", "/").await.unwrap();
    let instance = instances
        .keys()
        .find(|k| !k.starts_with("__"))
        .unwrap()
        .trim_end_matches('/')
        .to_string();

    let mut signals = Signaller::load(client.clone(), Some("etl"), Some(&instance))
        .await
        .unwrap();
    let mut abort = SignalRecord::new(SignalAction::Abort);
    abort.timestamp = Some(now_secs());
    signals.set(abort).await.unwrap();

    let executor = Arc::new(ScriptedExecutor::new());
    let mut worker = test_worker(client.clone(), executor.clone());
    worker.run_until_idle().await.unwrap();

    assert!(executor.executed().is_empty());
    assert!(client.query_prefix("/workflow/", 0).await.unwrap().is_empty());
    assert!(!store.read_archive(ARCHIVE_PREFIX).unwrap().is_empty());
}

#[tokio::test]
async fn test_scheduler_emits_instance_and_reschedules() {
    let (mut client, _server) = start_master(Box::new(EphemeralStore::new())).await;

    let config = SchedulerConfig::new("unused".to_string()).with_poll_secs(1);
    let mut scheduler = Scheduler::new(client.clone(), config, create_logger());
    scheduler.register(chain_definition());

    let schedule = ScheduleRecord {
        workflow: "etl".to_string(),
        next_run_time: now_secs() - 1,
        recurrence_secs: 3600,
        overrun_policy: OverrunPolicy::StartNew,
        max_running_instances: None,
    };
    scheduler.post_schedule(&schedule).await.unwrap();

    // The schedule is due, so one pass claims it and boots an instance.
    assert!(scheduler.run_once().await.unwrap());

    let runnable = client
        .query_prefix("/workflow/etl/", 0)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.name.contains("/job/runnable/"))
        .count();
    assert_eq!(runnable, 1);

    // The schedule token is leased until the next run time.
    let tokens = client.query_prefix("/schedule/", 0).await.unwrap();
    assert_eq!(tokens.len(), 1);
    let rescheduled = ScheduleRecord::decode(&tokens[0].data).unwrap();
    assert!(rescheduled.next_run_time > now_secs());
    assert_eq!(tokens[0].expiration_time, rescheduled.next_run_time);

    // Nothing else is due.
    assert!(!scheduler.run_once().await.unwrap());
}

#[tokio::test]
async fn test_skip_policy_skips_while_running() {
    let (mut client, _server) = start_master(Box::new(EphemeralStore::new())).await;

    let config = SchedulerConfig::new("unused".to_string()).with_poll_secs(1);
    let mut scheduler = Scheduler::new(client.clone(), config, create_logger());
    scheduler.register(chain_definition());

    let schedule = ScheduleRecord {
        workflow: "etl".to_string(),
        next_run_time: now_secs() - 10,
        recurrence_secs: 1,
        overrun_policy: OverrunPolicy::Skip,
        max_running_instances: None,
    };
    scheduler.post_schedule(&schedule).await.unwrap();

    // First pass starts an instance.
    assert!(scheduler.run_once().await.unwrap());
    let first = client.group("/workflow/etl/", "/").await.unwrap();

    // The instance is still running, so a due schedule skips instead of
    // starting another one.  Claim it again once the recurrence passes.
    sleep(Duration::from_secs(2)).await;
    scheduler.run_once().await.unwrap();
    let second = client.group("/workflow/etl/", "/").await.unwrap();
    assert_eq!(first, second);
}
