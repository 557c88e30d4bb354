pub(crate) mod auth;
mod config;
pub(crate) mod delivery;
pub(crate) mod error;
pub(crate) mod http_server;
pub(crate) mod message_id;
pub(crate) mod mx;
pub(crate) mod queue;
pub(crate) mod rate_limiter;
pub(crate) mod retry;
pub(crate) mod smtp_client;
pub(crate) mod smtp_server;
pub(crate) mod store;
pub(crate) mod utils;

use auth::AuthTracker;
use config::Config;
use delivery::DeliveryWorker;
use env_logger::Env;
use error::Error;
use message_id::IdGenerator;
use queue::SubmissionQueue;
use rate_limiter::RateLimiter;
use retry::RetryScheduler;
use smtp_server::{run_smtp_server, SmtpContext};
use std::env;
use std::process;
use std::sync::Arc;
use store::Store;

#[tokio::main]
async fn main() {
    // default to info level
    let env = Env::new().filter_or("RUST_LOG", "info");
    env_logger::Builder::from_env(env).init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("Usage: {} <config_file> <mode>", args[0]);
        eprintln!("  mode: submit or provision");
        process::exit(1);
    }

    let config_path = &args[1];
    let mode = &args[2];

    if mode != "submit" && mode != "provision" {
        eprintln!("Error: mode must be 'submit' or 'provision'");
        process::exit(1);
    }

    let config = match Config::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to read config: {}", e);
            process::exit(1);
        }
    };

    let result = if mode == "provision" {
        run_provision(config).await
    } else {
        run_submit(config).await
    };

    if let Err(e) = result {
        eprintln!("Server error: {}", e);
        process::exit(1);
    }
}

/// Wires up and runs the submission server together with the delivery
/// worker and the retry promoter.
async fn run_submit(config: Config) -> Result<(), Error> {
    let conn = store::connect(&config).await?;
    let queue = SubmissionQueue::new(conn.clone());
    let retries = RetryScheduler::new(conn.clone(), queue.clone(), &config);

    // The worker pops with an unbounded block, so it gets its own store
    // connection.
    let worker_conn = store::connect(&config).await?;
    let worker = DeliveryWorker::new(
        config.clone(),
        Store::new(worker_conn.clone()),
        SubmissionQueue::new(worker_conn),
        retries.clone(),
    )?;
    tokio::spawn(worker.run());
    tokio::spawn(retries.run());

    let ids = match config.machine_id {
        Some(machine_id) => IdGenerator::new(machine_id),
        None => IdGenerator::from_process(),
    };

    let ctx = Arc::new(SmtpContext {
        store: Store::new(conn.clone()),
        auth: AuthTracker::new(conn.clone(), &config),
        rate_limiter: RateLimiter::new(conn, &config),
        queue,
        ids,
    });
    let addr = format!("0.0.0.0:{}", config.smtp_port);
    run_smtp_server(&addr, ctx).await
}

/// Runs the user provisioning endpoint.
async fn run_provision(config: Config) -> Result<(), Error> {
    let conn = store::connect(&config).await?;
    let addr = format!("0.0.0.0:{}", config.http_port);
    http_server::run_http_server(&addr, Store::new(conn)).await
}
