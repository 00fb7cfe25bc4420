use crate::types::{GradingEvent, GradingRequest, PluginKind, SubmissionOutcome};
use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use sha2::{Digest, Sha256};

/// Redis key semantics shared by the API and the workers
/// Keys are deterministic so both sides always agree on them

pub const QUEUE_PREFIX: &str = "grader:queue";
pub const RESULT_PREFIX: &str = "grader:result";
pub const EVENTS_CHANNEL: &str = "grader:events";
pub const TEST_RUNNER_PREFIX: &str = "test-runner";

/// Queue a worker for `plugin` consumes
pub fn queue_name(plugin: &PluginKind) -> String {
    format!("{}:{}", QUEUE_PREFIX, plugin)
}

/// Stored submission outcome for an attempt
pub fn result_key(attempt_id: &str) -> String {
    format!("{}:{}", RESULT_PREFIX, attempt_id)
}

/// Cached Grading State hash of a test-runner run
pub fn state_key(run_id: &str) -> String {
    format!("{}:{}", TEST_RUNNER_PREFIX, run_id)
}

/// Judge result list of a test-runner run
pub fn results_key(run_id: &str) -> String {
    format!("{}:{}:results", TEST_RUNNER_PREFIX, run_id)
}

/// Run id of one test-runner criterion: `<attempt-slug>.<criterion-slug>-<digest>`
/// The digest covers the raw names, so criteria whose slugs coincide
/// ("Unit Tests", "unit_tests") still get their own judge storage and cache
/// keys. The id doubles as a judge-side directory name
pub fn run_id(attempt_id: &str, criterion_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(attempt_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(criterion_name.as_bytes());
    let digest = hasher.finalize();
    format!(
        "{}.{}-{}",
        slug(attempt_id),
        slug(criterion_name),
        hex::encode(&digest[..4])
    )
}

/// Lowercase, filesystem- and key-safe rendition of a free-form name
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

pub async fn push_request(
    conn: &mut ConnectionManager,
    request: &GradingRequest,
) -> ::redis::RedisResult<()> {
    let payload = serde_json::to_string(request).map_err(json_error)?;
    conn.rpush::<_, _, ()>(queue_name(&request.plugin), payload)
        .await
}

/// One popped queue entry
#[derive(Debug)]
pub enum QueueEntry {
    Request(GradingRequest),
    /// Already removed from the queue; the payload is kept for the log
    Malformed { payload: String, error: String },
}

pub fn decode_entry(payload: &str) -> QueueEntry {
    match serde_json::from_str(payload) {
        Ok(request) => QueueEntry::Request(request),
        Err(e) => QueueEntry::Malformed {
            payload: payload.to_string(),
            error: e.to_string(),
        },
    }
}

/// Blocking pop with timeout; `Ok(None)` when the timeout elapses
///
/// `Err` is a Redis failure only. Undecodable payloads come back as
/// [`QueueEntry::Malformed`].
pub async fn pop_request(
    conn: &mut ConnectionManager,
    plugin: &PluginKind,
    timeout_secs: f64,
) -> ::redis::RedisResult<Option<QueueEntry>> {
    let popped: Option<(String, String)> = ::redis::cmd("BLPOP")
        .arg(queue_name(plugin))
        .arg(timeout_secs)
        .query_async(conn)
        .await?;
    Ok(popped.map(|(_, payload)| decode_entry(&payload)))
}

pub async fn store_outcome(
    conn: &mut ConnectionManager,
    outcome: &SubmissionOutcome,
) -> ::redis::RedisResult<()> {
    let payload = serde_json::to_string(outcome).map_err(json_error)?;
    conn.set::<_, _, ()>(result_key(&outcome.attempt_id), payload)
        .await
}

pub async fn load_outcome(
    conn: &mut ConnectionManager,
    attempt_id: &str,
) -> ::redis::RedisResult<Option<SubmissionOutcome>> {
    let payload: Option<String> = conn.get(result_key(attempt_id)).await?;
    payload
        .map(|p| serde_json::from_str(&p).map_err(json_error))
        .transpose()
}

pub async fn publish_event(
    conn: &mut ConnectionManager,
    event: &GradingEvent,
) -> ::redis::RedisResult<()> {
    let payload = serde_json::to_string(event).map_err(json_error)?;
    conn.publish::<_, _, ()>(EVENTS_CHANNEL, payload).await
}

fn json_error(e: serde_json::Error) -> ::redis::RedisError {
    ::redis::RedisError::from((
        ::redis::ErrorKind::TypeError,
        "invalid JSON payload",
        e.to_string(),
    ))
}
