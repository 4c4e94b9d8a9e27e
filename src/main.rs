use std::sync::Arc;

use slog::{info, o, Drain, Logger};

use tokenmill::master::now_secs;
use tokenmill::{
    MasterClient, MasterConfig, OverrunPolicy, RocksStore, ScheduleRecord, Scheduler,
    SchedulerConfig, ShellExecutor, Worker, WorkerConfig, WorkflowDefinition,
};

const USAGE: &str = "usage:
  tokenmill master    [--listen ADDR] [--store DIR]
  tokenmill worker    --master ADDR [--generation N] [--lease-secs N]
  tokenmill scheduler --master ADDR [--workflow FILE]... [--every SECS]";

fn create_logger() -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

fn flag(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == name)
        .and_then(|pos| args.get(pos + 1))
        .cloned()
}

fn flag_values(args: &[String], name: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == name {
            if let Some(value) = iter.next() {
                values.push(value.clone());
            }
        }
    }
    values
}

async fn run_master(args: &[String], log: Logger) -> Result<(), Box<dyn std::error::Error>> {
    let config = MasterConfig::new(
        flag(args, "--listen").unwrap_or_else(|| "127.0.0.1:9690".to_string()),
        flag(args, "--store")
            .unwrap_or_else(|| "./tokenmill-data".to_string())
            .into(),
    );

    let store = RocksStore::open(&config.store_path)?;
    let master = tokenmill::master::spawn(Box::new(store), log.clone());
    master.wait_serving().await?;

    let server = tokenmill::start_grpc_server(config.listen_address, master, log.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!(log, "shutting down master");
    server.shutdown();
    Ok(())
}

async fn run_worker(args: &[String], log: Logger) -> Result<(), Box<dyn std::error::Error>> {
    let master_address = flag(args, "--master").ok_or("worker requires --master ADDR")?;
    let mut config = WorkerConfig::new(master_address.clone());
    if let Some(generation) = flag(args, "--generation") {
        config = config.with_generation(generation.parse()?);
    }
    if let Some(lease) = flag(args, "--lease-secs") {
        config = config.with_lease_secs(lease.parse()?);
    }

    let client = MasterClient::connect(&master_address).await?;
    let executor = Arc::new(ShellExecutor::new(log.clone()));
    let mut worker = Worker::new(client, executor, config, log);
    worker.run().await;
    Ok(())
}

async fn run_scheduler(args: &[String], log: Logger) -> Result<(), Box<dyn std::error::Error>> {
    let master_address = flag(args, "--master").ok_or("scheduler requires --master ADDR")?;
    let client = MasterClient::connect(&master_address).await?;
    let config = SchedulerConfig::new(master_address);
    let mut scheduler = Scheduler::new(client, config, log);

    let recurrence: Option<i64> = match flag(args, "--every") {
        Some(value) => Some(value.parse()?),
        None => None,
    };
    for path in flag_values(args, "--workflow") {
        let definition = WorkflowDefinition::from_json(&std::fs::read(&path)?)?;
        if let Some(recurrence_secs) = recurrence {
            scheduler
                .post_schedule(&ScheduleRecord {
                    workflow: definition.workflow.clone(),
                    next_run_time: now_secs(),
                    recurrence_secs,
                    overrun_policy: OverrunPolicy::Skip,
                    max_running_instances: None,
                })
                .await?;
        }
        scheduler.register(definition);
    }

    scheduler.run().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let log = create_logger();
    match args.first().map(String::as_str) {
        Some("master") => run_master(&args[1..], log).await,
        Some("worker") => run_worker(&args[1..], log).await,
        Some("scheduler") => run_scheduler(&args[1..], log).await,
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}
