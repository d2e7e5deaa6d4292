use crate::config::AutonomyConfig;
use crate::dispatcher::Dispatcher;
use crate::events::SchedulerEvent;
use crate::oracle::{MockOracle, Oracle, OracleResponse};
use colony_core::{ColonyError, CompletionMap};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Rationale recorded when no oracle is configured.
pub const MISSING_ORACLE: &str = "missing oracle";

/// What one autonomy cycle did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// The gate was closed: disabled, already running, or busy.
    Skipped { reason: String },
    /// The oracle answered and its tasks were submitted.
    Completed {
        generated: usize,
        admitted: usize,
        dropped: usize,
        rationale: Option<String>,
    },
    /// The controller was disabled while the oracle call was in flight.
    Discarded,
    /// The oracle failed or timed out; nothing was submitted.
    OracleFailed { error: String },
}

struct Inner {
    config: AutonomyConfig,
    dispatcher: Dispatcher,
    oracle: Option<Arc<dyn Oracle>>,
    enabled: AtomicBool,
    in_flight: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    calls: CompletionMap<u64, OracleResponse>,
    seq: AtomicU64,
    last: Mutex<Option<CycleOutcome>>,
}

/// Clears the single-flight flag when a cycle ends, however it ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Periodically asks an [`Oracle`] for new tasks and feeds them to the dispatcher.
///
/// At most one cycle runs at a time. Unless `allow_when_busy` is set, a cycle
/// only runs when no agent is working and the queue is empty.
#[derive(Clone)]
pub struct AutonomyController {
    inner: Arc<Inner>,
}

impl AutonomyController {
    /// Build a controller. Without an explicit oracle, `mock_response` from the
    /// config is replayed if present.
    pub fn new(
        config: AutonomyConfig,
        dispatcher: Dispatcher,
        oracle: Option<Arc<dyn Oracle>>,
    ) -> Self {
        let config = config.normalized();
        let oracle = oracle.or_else(|| {
            config
                .mock_response
                .clone()
                .map(|reply| Arc::new(MockOracle::new(reply)) as Arc<dyn Oracle>)
        });
        Self {
            inner: Arc::new(Inner {
                config,
                dispatcher,
                oracle,
                enabled: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                timer: Mutex::new(None),
                calls: CompletionMap::new(),
                seq: AtomicU64::new(0),
                last: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &AutonomyConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn last_outcome(&self) -> Option<CycleOutcome> {
        self.inner.last.lock().clone()
    }

    /// Start the cycle timer. The first cycle fires immediately.
    pub fn enable(&self) {
        if self.inner.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let period = self.inner.config.interval();
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            loop {
                timer.tick().await;
                let cycle = this.clone();
                tokio::spawn(async move {
                    cycle.run_cycle().await;
                });
            }
        });
        if let Some(previous) = self.inner.timer.lock().replace(handle) {
            previous.abort();
        }
        info!(interval_ms = self.inner.config.interval_ms, "Autonomy enabled");
    }

    /// Stop the timer and quietly discard any in-flight oracle result.
    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        if let Some(handle) = self.inner.timer.lock().take() {
            handle.abort();
        }
        let discarded = self.inner.calls.cancel_all();
        info!(discarded, "Autonomy disabled");
    }

    /// Run one cycle now, subject to the same gates as timed cycles.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let outcome = self.cycle().await;
        debug!(outcome = ?outcome, "Autonomy cycle finished");
        *self.inner.last.lock() = Some(outcome.clone());
        outcome
    }

    async fn cycle(&self) -> CycleOutcome {
        let inner = &self.inner;
        if !self.is_enabled() {
            return skipped("disabled");
        }
        if inner
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return skipped("cycle already running");
        }
        let _guard = FlightGuard(&inner.in_flight);

        if !inner.config.allow_when_busy && inner.dispatcher.is_busy() {
            return skipped("agents busy");
        }

        let snapshot = inner.dispatcher.status_snapshot();
        let Some(oracle) = inner.oracle.clone() else {
            debug!(error = %ColonyError::OracleUnavailable, "Autonomy cycle has no oracle");
            inner.dispatcher.events().emit(SchedulerEvent::AutonomyCycle {
                created: 0,
                dropped: 0,
                rationale: Some(MISSING_ORACLE.to_string()),
            });
            return CycleOutcome::Completed {
                generated: 0,
                admitted: 0,
                dropped: 0,
                rationale: Some(MISSING_ORACLE.to_string()),
            };
        };

        let call_id = inner.seq.fetch_add(1, Ordering::SeqCst);
        let timeout_ms = inner.config.oracle_timeout_ms;
        let handle = inner
            .calls
            .register(call_id, inner.config.oracle_timeout(), move || {
                ColonyError::OracleTimeout {
                    call_id,
                    timeout_ms,
                }
            });
        {
            let calls = inner.calls.clone();
            let instructions = inner.config.instructions.clone();
            let max_tasks = inner.config.max_tasks;
            let temperature = inner.config.temperature;
            tokio::spawn(async move {
                let result = oracle
                    .generate(&snapshot, &instructions, max_tasks, temperature)
                    .await;
                calls.resolve(&call_id, result);
            });
        }

        let response = match handle.wait().await {
            Ok(response) => response,
            Err(ColonyError::Cancelled(_)) => return CycleOutcome::Discarded,
            Err(e) => {
                warn!(error = %e, "Oracle call failed");
                return CycleOutcome::OracleFailed {
                    error: e.to_string(),
                };
            }
        };
        if !self.is_enabled() {
            return CycleOutcome::Discarded;
        }

        self.admit(response)
    }

    fn admit(&self, response: OracleResponse) -> CycleOutcome {
        let inner = &self.inner;
        let generated = response.tasks.len() + response.malformed;
        let mut admitted = 0;
        let mut dropped = response.malformed;

        for (index, mut request) in response.tasks.into_iter().enumerate() {
            if index >= inner.config.max_tasks {
                dropped += 1;
                continue;
            }
            if request.sender.as_deref().map_or(true, |s| s.trim().is_empty()) {
                request.sender = Some(inner.config.sender.clone());
            }
            match inner.dispatcher.submit(request) {
                Ok(submission) => {
                    debug!(task_id = %submission.task_id(), "Autonomy task submitted");
                    admitted += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Autonomy task dropped");
                    dropped += 1;
                }
            }
        }

        info!(generated, admitted, dropped, "Autonomy cycle");
        inner.dispatcher.events().emit(SchedulerEvent::AutonomyCycle {
            created: admitted,
            dropped,
            rationale: response.rationale.clone(),
        });
        CycleOutcome::Completed {
            generated,
            admitted,
            dropped,
            rationale: response.rationale,
        }
    }
}

fn skipped(reason: &str) -> CycleOutcome {
    CycleOutcome::Skipped {
        reason: reason.to_string(),
    }
}
