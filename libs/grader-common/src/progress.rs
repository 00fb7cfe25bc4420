//! Cached Grading State of test-runner runs
//!
//! One hash per run at `test-runner:<run id>` holding the resolved config,
//! the criterion data, the current stage, and processed/total test-case
//! counts, plus a `runId` lease written at UPLOAD. Judge results of the RUN
//! stage are appended to `test-runner:<run id>:results`.
//!
//! The lease settles concurrent regrades of the same attempt: the newest run
//! owns the record, and writes from an older run fail with
//! `CacheError::Superseded`.

use crate::cache::{CacheError, CacheStore};
use crate::redis::{results_key, state_key};
use crate::types::{CriterionData, GradingProgress, Stage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

const FIELD_CONFIG: &str = "config";
const FIELD_CRITERION: &str = "criterionData";
const FIELD_STATE: &str = "state";
const FIELD_PROCESSED: &str = "processed";
const FIELD_TOTAL: &str = "total";
const FIELD_LEASE: &str = "runId";

/// Ownership token of one orchestrator run over a state record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLease {
    pub run_id: String,
    lease_id: String,
}

impl RunLease {
    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }
}

#[derive(Clone)]
pub struct GradingStateStore {
    cache: Arc<dyn CacheStore>,
}

impl GradingStateStore {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Initialise the record for UPLOAD and clear results left by earlier runs
    pub async fn begin_run<C: Serialize>(
        &self,
        run_id: &str,
        config: &C,
        criterion: &CriterionData,
        total: u32,
    ) -> Result<RunLease, CacheError> {
        let key = state_key(run_id);
        let lease = RunLease {
            run_id: run_id.to_string(),
            lease_id: Uuid::new_v4().to_string(),
        };

        let config_json = encode(&key, FIELD_CONFIG, config)?;
        let criterion_json = encode(&key, FIELD_CRITERION, criterion)?;

        self.cache
            .hset(
                &key,
                &[
                    (FIELD_CONFIG, config_json),
                    (FIELD_CRITERION, criterion_json),
                    (FIELD_STATE, Stage::Upload.to_string()),
                    (FIELD_PROCESSED, "0".to_string()),
                    (FIELD_TOTAL, total.to_string()),
                    (FIELD_LEASE, lease.lease_id.clone()),
                ],
            )
            .await?;
        self.cache.del(&results_key(run_id)).await?;

        tracing::debug!(run_id, total, "Initialised grading state");
        Ok(lease)
    }

    /// Record that the run has moved on to `stage`
    pub async fn advance(&self, lease: &RunLease, stage: Stage) -> Result<(), CacheError> {
        self.check_lease(lease).await?;
        self.cache
            .hset(&state_key(&lease.run_id), &[(FIELD_STATE, stage.to_string())])
            .await
    }

    /// Persist RUN results and mark every reported test case as processed
    pub async fn complete_run(&self, lease: &RunLease, results: &[String]) -> Result<(), CacheError> {
        self.check_lease(lease).await?;
        self.cache.rpush(&results_key(&lease.run_id), results).await?;
        self.cache
            .hset(
                &state_key(&lease.run_id),
                &[
                    (FIELD_STATE, Stage::Run.to_string()),
                    (FIELD_PROCESSED, results.len().to_string()),
                ],
            )
            .await
    }

    /// Progress report from the judge's stage callback
    ///
    /// Writes absolute values, so a callback and the orchestrator reporting
    /// the same stage agree instead of double counting. Callbacks are
    /// best-effort: one carrying another run's lease fails with
    /// `Superseded`, and one for a stage behind the recorded state is
    /// ignored, so late deliveries never move a run backwards.
    pub async fn acknowledge(
        &self,
        run_id: &str,
        stage: Stage,
        reported: usize,
        lease_id: Option<&str>,
    ) -> Result<GradingProgress, CacheError> {
        if let Some(lease_id) = lease_id {
            self.check_lease(&RunLease {
                run_id: run_id.to_string(),
                lease_id: lease_id.to_string(),
            })
            .await?;
        }

        let mut progress = self.progress(run_id).await?;
        if stage < progress.state {
            tracing::debug!(run_id, %stage, current = %progress.state, "Ignoring late stage callback");
            return Ok(progress);
        }
        progress.state = stage;

        let mut fields = vec![(FIELD_STATE, stage.to_string())];
        if stage == Stage::Run {
            progress.processed = (reported as u32).min(progress.total);
            fields.push((FIELD_PROCESSED, progress.processed.to_string()));
        }
        self.cache.hset(&state_key(run_id), &fields).await?;

        Ok(progress)
    }

    pub async fn progress(&self, run_id: &str) -> Result<GradingProgress, CacheError> {
        let key = state_key(run_id);
        let values = self
            .cache
            .hmget(&key, &[FIELD_STATE, FIELD_PROCESSED, FIELD_TOTAL])
            .await?;

        let [state, processed, total] = require::<3>(&key, values)?;
        let state = Stage::from_str(&state).ok_or_else(|| CacheError::Corrupt {
            key: key.clone(),
            field: FIELD_STATE.to_string(),
            reason: format!("unknown stage '{}'", state),
        })?;

        Ok(GradingProgress {
            state,
            processed: parse_count(&key, FIELD_PROCESSED, &processed)?,
            total: parse_count(&key, FIELD_TOTAL, &total)?,
        })
    }

    /// Config and criterion data stored at UPLOAD
    pub async fn call_data<C: DeserializeOwned>(
        &self,
        run_id: &str,
    ) -> Result<(C, CriterionData), CacheError> {
        let key = state_key(run_id);
        let values = self.cache.hmget(&key, &[FIELD_CONFIG, FIELD_CRITERION]).await?;
        let [config, criterion] = require::<2>(&key, values)?;

        Ok((
            decode(&key, FIELD_CONFIG, &config)?,
            decode(&key, FIELD_CRITERION, &criterion)?,
        ))
    }

    pub async fn results(&self, run_id: &str) -> Result<Vec<String>, CacheError> {
        self.cache.lrange(&results_key(run_id)).await
    }

    async fn check_lease(&self, lease: &RunLease) -> Result<(), CacheError> {
        let key = state_key(&lease.run_id);
        let values = self.cache.hmget(&key, &[FIELD_LEASE]).await?;
        let [current] = require::<1>(&key, values)?;
        if current != lease.lease_id {
            tracing::warn!(run_id = %lease.run_id, "Grading run superseded by a newer run");
            return Err(CacheError::Superseded {
                run_id: lease.run_id.clone(),
            });
        }
        Ok(())
    }
}

fn require<const N: usize>(key: &str, values: Vec<Option<String>>) -> Result<[String; N], CacheError> {
    let present: Option<Vec<String>> = values.into_iter().collect();
    present
        .and_then(|v| <[String; N]>::try_from(v).ok())
        .ok_or_else(|| CacheError::Missing { key: key.to_string() })
}

fn parse_count(key: &str, field: &str, raw: &str) -> Result<u32, CacheError> {
    raw.parse().map_err(|e: std::num::ParseIntError| CacheError::Corrupt {
        key: key.to_string(),
        field: field.to_string(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(key: &str, field: &str, value: &T) -> Result<String, CacheError> {
    serde_json::to_string(value).map_err(|e| CacheError::Corrupt {
        key: key.to_string(),
        field: field.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, field: &str, raw: &str) -> Result<T, CacheError> {
    serde_json::from_str(raw).map_err(|e| CacheError::Corrupt {
        key: key.to_string(),
        field: field.to_string(),
        reason: e.to_string(),
    })
}
