//! ResultMerger: combine the authoritative batch result with streamed
//! telemetry.
//!
//! The batch result wins for every step it reports. Telemetry only fills in
//! what the batch left out: a step that completed on the push channel but is
//! absent from the batch is synthesized, and a batch entry without a
//! duration borrows one from the live timestamps.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::MergeFileConfig;
use crate::error::MergeTimeout;
use crate::model::{BatchResult, Session, StepProgress, StepResult, StepStatus, millis_from_value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSettings {
    /// Upper bound on waiting for trailing telemetry once the batch result is in
    pub grace_window: Duration,
}

impl MergeSettings {
    pub fn from_file(fc: &MergeFileConfig) -> Self {
        Self {
            grace_window: Duration::from_millis(fc.grace_window_ms),
        }
    }
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self::from_file(&MergeFileConfig::default())
    }
}

/// Where a merged step entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSource {
    Batch,
    Telemetry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledStep {
    pub source: StepSource,
    #[serde(flatten)]
    pub result: StepResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledResult {
    pub test_id: Option<String>,
    pub success: bool,
    pub total_duration_ms: u64,
    pub error: Option<String>,
    pub steps: BTreeMap<String, ReconciledStep>,
    /// False when the merge ran after the grace window expired with steps
    /// still open on the push channel.
    pub telemetry_complete: bool,
}

impl ReconciledResult {
    pub fn step(&self, name: &str) -> Option<&ReconciledStep> {
        self.steps.get(name)
    }
}

pub struct ResultMerger;

impl ResultMerger {
    /// Pure merge of a batch result and the live step view.
    pub fn merge(batch: &BatchResult, live: &BTreeMap<String, StepProgress>) -> ReconciledResult {
        let mut steps = BTreeMap::new();

        for (name, entry) in &batch.results {
            let mut result = entry.clone();
            if result.duration_ms.is_none() {
                result.duration_ms = live.get(name).and_then(StepProgress::duration_ms);
            }
            steps.insert(
                name.clone(),
                ReconciledStep {
                    source: StepSource::Batch,
                    result,
                },
            );
        }

        for (name, progress) in live {
            if steps.contains_key(name) || progress.status != StepStatus::Completed {
                continue;
            }
            debug!(step = %name, "synthesizing step result from telemetry");
            steps.insert(
                name.clone(),
                ReconciledStep {
                    source: StepSource::Telemetry,
                    result: synthesize(progress),
                },
            );
        }

        ReconciledResult {
            test_id: None,
            success: batch.success,
            total_duration_ms: batch.total_duration_ms.unwrap_or_default(),
            error: batch.error.clone(),
            steps,
            telemetry_complete: true,
        }
    }

    /// Wait up to `grace` for the live view to cover every step the batch
    /// result is missing, then merge. Expiry is logged and the merge proceeds
    /// with whatever telemetry arrived.
    pub async fn settle<V>(
        view: &mut watch::Receiver<V>,
        batch: &BatchResult,
        grace: Duration,
    ) -> ReconciledResult
    where
        V: LiveView,
    {
        let settled = tokio::time::timeout(grace, async {
            view.wait_for(|v| open_steps(batch, v.session(), v.steps()).is_empty())
                .await
                .is_ok()
        })
        .await;

        let telemetry_complete = match settled {
            Ok(true) => true,
            Ok(false) => {
                debug!("live view closed before telemetry settled");
                false
            }
            Err(_) => {
                let current = view.borrow();
                let timeout = MergeTimeout {
                    waited: grace,
                    open_steps: open_steps(batch, current.session(), current.steps()),
                };
                warn!(open_steps = ?timeout.open_steps, "{timeout}");
                false
            }
        };

        let current = view.borrow();
        let mut merged = Self::merge(batch, current.steps());
        merged.test_id = current.session().map(|s| s.test_id.clone());
        merged.telemetry_complete = telemetry_complete;
        merged
    }
}

/// Read access to a live session view, so the merger can wait on whatever
/// snapshot type the caller publishes.
pub trait LiveView {
    fn session(&self) -> Option<&Session>;
    fn steps(&self) -> &BTreeMap<String, StepProgress>;
}

/// Steps the batch result lacks whose telemetry has not reached a terminal
/// state. Requested steps count even if no event for them arrived yet.
fn open_steps(
    batch: &BatchResult,
    session: Option<&Session>,
    steps: &BTreeMap<String, StepProgress>,
) -> Vec<String> {
    let Some(session) = session else {
        return Vec::new();
    };
    let mut names: Vec<&String> = session.requested_steps.iter().collect();
    names.extend(steps.keys());
    names.sort();
    names.dedup();

    names
        .into_iter()
        .filter(|name| !batch.results.contains_key(*name))
        .filter(|name| !steps.get(*name).is_some_and(StepProgress::is_terminal))
        .cloned()
        .collect()
}

fn synthesize(progress: &StepProgress) -> StepResult {
    let details = progress.details.clone();
    let duration_ms = progress
        .duration_ms()
        .or_else(|| {
            details
                .as_ref()
                .and_then(|d| d.get("durationMs"))
                .and_then(millis_from_value)
        })
        .unwrap_or(0);

    let data = match details {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("details".to_string(), other);
            map
        }
    };

    StepResult {
        success: true,
        duration_ms: Some(duration_ms),
        error: None,
        data,
    }
}
