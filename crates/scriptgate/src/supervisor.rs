//! Deadline-bound script execution.
//!
//! Each call to [`Supervisor::execute`] starts one worker on Tokio's blocking
//! pool and one watchdog task on the runtime's timer. The watchdog races the
//! session's `max_runtime` against the worker; if the deadline wins it trips the
//! execution's cancellation token. The engine polls that token between
//! operations and unwinds the evaluation, so a runaway script is stopped at a
//! safe point and never by tearing down its thread.
//!
//! A host function that blocks inside a capability cannot be interrupted this
//! way; the deadline takes effect once control returns to the engine.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use rhai::{Dynamic, EvalAltResult};
use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, sync::oneshot, task::{JoinError, JoinHandle}};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result, ScriptError, ScriptErrorInfo, format_error},
    session::Session,
};

/// Callback invoked on the worker thread when a script fails.
pub type ErrorCallback = Box<dyn FnOnce(&ScriptError) + Send + 'static>;

static NEXT_EXECUTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one execution. States only move forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Spawned but not yet picked up by a worker thread.
    Pending = 0,
    /// Resolving includes or evaluating.
    Running = 1,
    /// Evaluation returned a value.
    Completed = 2,
    /// Evaluation raised an error.
    Failed = 3,
    /// Stopped by the deadline or by [`ExecutionHandle::cancel`].
    ForciblyTerminated = 4,
}

impl ExecutionState {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::ForciblyTerminated
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::ForciblyTerminated,
        }
    }
}

/// Atomic holder for an [`ExecutionState`].
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ExecutionState::Pending as u8))
    }

    fn get(&self) -> ExecutionState {
        ExecutionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` unless the current state is terminal or not earlier.
    fn advance(&self, next: ExecutionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current_state = ExecutionState::from_u8(current);
                (!current_state.is_terminal() && current < next as u8).then_some(next as u8)
            })
            .is_ok()
    }
}

/// Why a forcibly terminated execution was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The run exceeded its wall-clock budget.
    Deadline {
        /// Budget that was exceeded.
        limit: Duration,
    },
    /// The host cancelled the run through its handle.
    Cancelled,
}

/// Terminal result of one execution.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// The script returned a value.
    Completed(Dynamic),
    /// The script failed; the error callback, if any, has been invoked.
    Failed(ScriptError),
    /// The script was stopped before it finished. Host state it touched may be
    /// partially updated.
    ForciblyTerminated(Termination),
}

impl ExecutionOutcome {
    /// State corresponding to this outcome.
    pub fn state(&self) -> ExecutionState {
        match self {
            Self::Completed(_) => ExecutionState::Completed,
            Self::Failed(_) => ExecutionState::Failed,
            Self::ForciblyTerminated(_) => ExecutionState::ForciblyTerminated,
        }
    }

    /// Returned value, if the script completed.
    pub fn value(&self) -> Option<&Dynamic> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Error, if the script failed.
    pub fn error(&self) -> Option<&ScriptError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Outcome together with what the script printed and how long it ran.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Execution identifier, unique within the process.
    pub id: u64,
    /// Terminal outcome.
    pub outcome: ExecutionOutcome,
    /// Lines passed to `print`.
    pub logs: Vec<String>,
    /// Wall-clock time from worker start to finish.
    pub elapsed: Duration,
}

impl ExecutionReport {
    /// Convert to a serializable summary.
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id,
            state: self.outcome.state(),
            value: self.outcome.value().map(|value| {
                rhai::serde::from_dynamic(value).unwrap_or(serde_json::Value::Null)
            }),
            logs: self.logs.clone(),
            error: self.outcome.error().map(format_error),
            termination: match &self.outcome {
                ExecutionOutcome::ForciblyTerminated(reason) => Some(*reason),
                _ => None,
            },
            elapsed_ms: self.elapsed.as_millis() as u64,
        }
    }

    fn panicked(id: u64, message: String) -> Self {
        Self {
            id,
            outcome: ExecutionOutcome::Failed(ScriptError::Panicked(message)),
            logs: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }
}

/// Serializable form of an [`ExecutionReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Execution identifier.
    pub id: u64,
    /// Terminal state.
    pub state: ExecutionState,
    /// JSON value returned by the script.
    pub value: Option<serde_json::Value>,
    /// Collected log lines from `print`.
    pub logs: Vec<String>,
    /// Error details when evaluation failed.
    pub error: Option<ScriptErrorInfo>,
    /// Reason for a forced termination.
    pub termination: Option<Termination>,
    /// Elapsed wall-clock milliseconds.
    pub elapsed_ms: u64,
}

/// Signals shared between a worker, its watchdog and its handle.
#[derive(Debug)]
struct Tripwire {
    stop: CancellationToken,
    deadline_hit: AtomicBool,
}

impl Tripwire {
    fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            deadline_hit: AtomicBool::new(false),
        }
    }

    fn trip_deadline(&self) {
        self.deadline_hit.store(true, Ordering::Release);
        self.stop.cancel();
    }
}

/// Handle to a running execution.
///
/// Dropping the handle does not stop the execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    id: u64,
    state: Arc<StateCell>,
    tripwire: Arc<Tripwire>,
    report: oneshot::Receiver<ExecutionReport>,
}

impl ExecutionHandle {
    /// Execution identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> ExecutionState {
        self.state.get()
    }

    /// Whether the execution reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Stop the execution at its next safe point.
    pub fn cancel(&self) {
        self.tripwire.stop.cancel();
    }

    /// Wait for the execution to end.
    pub async fn report(self) -> ExecutionReport {
        match self.report.await {
            Ok(report) => report,
            Err(_) => ExecutionReport::panicked(
                self.id,
                "supervisor stopped before reporting".to_string(),
            ),
        }
    }

    /// Wait for the execution to end and return only its outcome.
    pub async fn outcome(self) -> ExecutionOutcome {
        self.report().await.outcome
    }
}

/// Everything a worker needs, moved onto its thread.
struct Job {
    id: u64,
    session: Session,
    state: Arc<StateCell>,
    tripwire: Arc<Tripwire>,
    on_error: Option<ErrorCallback>,
    started: oneshot::Sender<()>,
}

/// Runs sessions on a Tokio runtime under their configured deadline.
#[derive(Debug, Clone)]
pub struct Supervisor {
    runtime: Handle,
}

impl Supervisor {
    /// Supervise executions on the given runtime.
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Supervise executions on the runtime the caller is running in.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| Error::NoRuntime)
    }

    /// Start executing `session` and return immediately.
    ///
    /// `on_error` is called at most once, on the worker thread, when the script
    /// fails or a host function panics. It is not called for forced
    /// terminations; those are reported through the handle.
    ///
    /// The deadline clock starts when a worker thread picks the job up, so
    /// time spent queued for the blocking pool does not count against
    /// `max_runtime`.
    pub fn execute(&self, session: &Session, on_error: Option<ErrorCallback>) -> ExecutionHandle {
        let id = NEXT_EXECUTION_ID.fetch_add(1, Ordering::Relaxed);
        let limit = session.config().max_runtime;
        let state = Arc::new(StateCell::new());
        let tripwire = Arc::new(Tripwire::new());
        let (report_tx, report_rx) = oneshot::channel();
        let (started_tx, started_rx) = oneshot::channel();

        let job = Job {
            id,
            session: session.clone(),
            state: state.clone(),
            tripwire: tripwire.clone(),
            on_error,
            started: started_tx,
        };
        let mut worker = self.runtime.spawn_blocking(move || run(job));

        let watchdog_state = state.clone();
        let watchdog_tripwire = tripwire.clone();
        self.runtime.spawn(async move {
            let joined = tokio::select! {
                biased;
                joined = &mut worker => joined,
                _ = started_rx => watch_deadline(id, limit, &watchdog_tripwire, worker).await,
            };
            let report = joined.unwrap_or_else(|err| {
                watchdog_state.advance(ExecutionState::Failed);
                ExecutionReport::panicked(id, panic_message(err))
            });
            let _ = report_tx.send(report);
        });

        ExecutionHandle {
            id,
            state,
            tripwire,
            report: report_rx,
        }
    }
}

/// Race a running worker against its budget, tripping the deadline if the
/// budget runs out first.
async fn watch_deadline(
    id: u64,
    limit: Duration,
    tripwire: &Tripwire,
    mut worker: JoinHandle<ExecutionReport>,
) -> std::result::Result<ExecutionReport, JoinError> {
    tokio::select! {
        biased;
        joined = &mut worker => {
            tracing::debug!(execution = id, "finished before deadline; timer disarmed");
            joined
        }
        () = tokio::time::sleep(limit) => {
            tracing::warn!(
                execution = id,
                limit_ms = limit.as_millis() as u64,
                "deadline reached; terminating script"
            );
            tripwire.trip_deadline();
            worker.await
        }
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => panic_text(payload.as_ref()),
        Err(err) => err.to_string(),
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

/// Worker body: resolve, evaluate and record a terminal state.
fn run(job: Job) -> ExecutionReport {
    let Job {
        id,
        session,
        state,
        tripwire,
        on_error,
        started: ready,
    } = job;
    let span = tracing::info_span!("execution", id);
    let _entered = span.enter();

    let started = Instant::now();
    state.advance(ExecutionState::Running);
    let _ = ready.send(());
    tracing::info!("script started");

    let logs = Arc::new(Mutex::new(Vec::new()));
    let result = panic::catch_unwind(AssertUnwindSafe(|| evaluate(&session, &tripwire, &logs)))
            .unwrap_or_else(|payload| {
            let message = panic_text(payload.as_ref());
            tracing::error!(%message, "host function panicked during evaluation");
            Err(ScriptError::Panicked(message))
        });

    let outcome = match result {
        Ok(value) => ExecutionOutcome::Completed(value),
        Err(err) if is_termination(&err) && tripwire.stop.is_cancelled() => {
            let reason = if tripwire.deadline_hit.load(Ordering::Acquire) {
                Termination::Deadline {
                    limit: session.config().max_runtime,
                }
            } else {
                Termination::Cancelled
            };
            tracing::warn!(?reason, "script forcibly terminated");
            ExecutionOutcome::ForciblyTerminated(reason)
        }
        Err(err) => {
            tracing::info!(error = %err, "script failed");
            if let Some(on_error) = on_error {
                on_error(&err);
            }
            ExecutionOutcome::Failed(err)
        }
    };
    state.advance(outcome.state());

    let elapsed = started.elapsed();
    tracing::info!(
        state = ?outcome.state(),
        elapsed_ms = elapsed.as_millis() as u64,
        "script finished"
    );
    let logs = logs.lock().unwrap_or_else(|e| e.into_inner()).clone();
    ExecutionReport {
        id,
        outcome,
        logs,
        elapsed,
    }
}

fn evaluate(
    session: &Session,
    tripwire: &Tripwire,
    logs: &Arc<Mutex<Vec<String>>>,
) -> std::result::Result<Dynamic, ScriptError> {
    let resolution = session.resolve();
    if session.config().strict_includes && !resolution.unresolved.is_empty() {
        return Err(ScriptError::UnresolvedInclude {
            references: resolution.unresolved,
        });
    }

    let mut engine = session.engine();

    let logs_c = logs.clone();
    engine.on_print(move |text| {
        tracing::info!(target: "scriptgate::script", "{text}");
        if let Ok(mut l) = logs_c.lock() {
            l.push(text.to_string());
        }
    });
    engine.on_debug(|text, source, pos| {
        tracing::debug!(target: "scriptgate::script", ?source, ?pos, "{text}");
    });

    let stop = tripwire.stop.clone();
    engine.on_progress(move |_| {
        if stop.is_cancelled() {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    let mut scope = session.scope();
    let ast = engine.compile_with_scope(&scope, &resolution.text)?;
    let value = engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast)?;
    Ok(value.flatten())
}

/// Progress-hook termination, possibly wrapped by the script functions it
/// unwound through.
fn is_termination(err: &ScriptError) -> bool {
    let ScriptError::Runtime(err) = err else {
        return false;
    };
    let mut current: &EvalAltResult = err;
    loop {
        match current {
            EvalAltResult::ErrorTerminated(..) => return true,
            EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => current = inner.as_ref(),
            _ => return false,
        }
    }
}
