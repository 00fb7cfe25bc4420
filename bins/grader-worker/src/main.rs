mod aggregator;
mod blob;
mod command;
mod error;
mod evaluator;
mod judge;
mod pipeline;
mod plugin_config;
mod static_analysis;
mod test_runner;
mod workdir;

use anyhow::Context;
use blob::{BlobStore, HttpBlobStore, LocalBlobStore};
use command::LocalCommandExecutor;
use grader_common::redis::{self, QueueEntry};
use grader_common::{Config, GradingEvent, GradingStateStore, PluginKind, RedisCache};
use judge::GoJudgeClient;
use pipeline::{failed_outcome, Grader, GraderSettings};
use std::sync::Arc;
use test_runner::TestRunnerOrchestrator;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Grader worker booting...");

    let config = Config::from_env();
    let plugin = config.worker_plugin;

    let client = ::redis::Client::open(config.redis_url.as_str())
        .context("invalid REDIS_URL")?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client)
        .await
        .context("failed to connect to Redis")?;
    info!(redis_url = %config.redis_url, "Connected to Redis");

    tokio::fs::create_dir_all(&config.temp_root)
        .await
        .with_context(|| format!("failed to create temp root {}", config.temp_root.display()))?;

    let grader = build_grader(&config, redis_conn.clone())?;

    info!(
        plugin = %plugin,
        queue = %redis::queue_name(&plugin),
        judge = %config.judge_url,
        "Listening for grading requests"
    );

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    tokio::select! {
        _ = worker_loop(&mut redis_conn, &grader, &plugin) => {},
        _ = shutdown => {},
    }

    info!("Worker shutdown complete");
    Ok(())
}

fn build_grader(
    config: &Config,
    redis_conn: ::redis::aio::ConnectionManager,
) -> anyhow::Result<Grader> {
    let blobs: Arc<dyn BlobStore> = match &config.blob_store_url {
        Some(url) => Arc::new(HttpBlobStore::new(url)?),
        None => Arc::new(LocalBlobStore::new(config.blob_store_dir.clone())),
    };
    info!(backend = blobs.backend_tag(), "Blob store configured");

    let tool = Arc::new(LocalCommandExecutor::new(&config.static_analysis_command)?);
    let judge = Arc::new(GoJudgeClient::new(
        &config.judge_url,
        config.callback_base_url.clone(),
    )?);
    if config.callback_base_url.is_none() {
        warn!("PLUGIN_SERVICE_URL not set; judge progress callbacks disabled");
    }

    let state = GradingStateStore::new(Arc::new(RedisCache::new(redis_conn)));
    let test_runner = TestRunnerOrchestrator::new(judge, state, config.judge_store_dir.clone());

    Ok(Grader::new(blobs, tool, test_runner, GraderSettings::from(config)))
}

async fn worker_loop(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    grader: &Grader,
    plugin: &PluginKind,
) {
    loop {
        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_request(redis_conn, plugin, 5.0).await {
            Ok(Some(QueueEntry::Malformed { payload, error })) => {
                error!(queue = %redis::queue_name(plugin), %payload, %error, "Dropping malformed grading request");
            }
            Ok(Some(QueueEntry::Request(request))) => {
                info!(
                    attempt_id = %request.attempt_id,
                    criteria = request.criterion_data_list.len(),
                    "Received grading request"
                );

                let outcome = match grader.grade_submission(&request).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(attempt_id = %request.attempt_id, error = %e, "Failed to stage submission files");
                        failed_outcome(&request, &e)
                    }
                };

                if let Err(e) = redis::store_outcome(redis_conn, &outcome).await {
                    error!(attempt_id = %outcome.attempt_id, error = %e, "Failed to store outcome");
                }
                for criterion in &outcome.criteria {
                    let event = GradingEvent::from_outcome(&outcome.attempt_id, criterion);
                    if let Err(e) = redis::publish_event(redis_conn, &event).await {
                        warn!(criterion = criterion.criterion(), error = %e, "Failed to publish grading event");
                    }
                }
            }
            Ok(None) => {
                // Timeout - check for shutdown
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}
