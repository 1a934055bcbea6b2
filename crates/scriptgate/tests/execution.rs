//! End-to-end execution behaviour: includes, deadlines, failures and
//! cancellation.

use std::time::{Duration, Instant};

use scriptgate::{
    Error, ExecutionOutcome, ExecutionState, FnCapability, ScriptConfig, ScriptError, Session,
    Supervisor, Termination,
    testutils::{ErrorRecorder, memory_provider, run_to_report},
};

#[tokio::test]
async fn included_fragment_runs_before_the_script() {
    let session = Session::builder()
        .with_provider(memory_provider(r"lib/a", &[("lib/a", "print(0);")]))
        .build("#include lib/a\nprint(1);");

    assert_eq!(session.resolve().text, "print(0);\nprint(1);");

    let report = run_to_report(&session).await.unwrap();
    assert_eq!(report.outcome.state(), ExecutionState::Completed);
    assert_eq!(report.logs, vec!["0".to_string(), "1".to_string()]);
}

#[tokio::test]
async fn unresolved_include_is_omitted() {
    let session = Session::builder()
        .with_provider(memory_provider(r"lib/\w+", &[]))
        .build("#include missing\nlet x = 1;\nx");

    let report = run_to_report(&session).await.unwrap();
    let value = report.outcome.value().and_then(|v| v.as_int().ok());
    assert_eq!(value, Some(1));
}

#[tokio::test]
async fn strict_includes_fail_the_execution() {
    let recorder = ErrorRecorder::new();
    let session = Session::builder()
        .with_config(ScriptConfig::default().with_strict_includes(true))
        .build("#include missing\n1");

    let handle = Supervisor::current()
        .unwrap()
        .execute(&session, Some(recorder.callback()));
    let outcome = handle.outcome().await;

    match outcome {
        ExecutionOutcome::Failed(ScriptError::UnresolvedInclude { references }) => {
            assert_eq!(references, vec!["missing".to_string()]);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(recorder.calls(), 1);
}

#[tokio::test]
async fn first_registered_provider_wins() {
    let session = Session::builder()
        .with_provider(memory_provider(
            r"shared::\w+",
            &[("shared::x", r#"print("first");"#)],
        ))
        .with_provider(memory_provider(
            r"shared::\w+",
            &[("shared::x", r#"print("second");"#)],
        ))
        .build("#include shared::x");

    let report = run_to_report(&session).await.unwrap();
    assert_eq!(report.logs, vec!["first".to_string()]);
}

#[tokio::test]
async fn runaway_script_is_terminated_at_the_deadline() {
    let limit = Duration::from_millis(300);
    let recorder = ErrorRecorder::new();
    let session = Session::builder()
        .with_max_runtime(limit)
        .build("while true {}");

    let started = Instant::now();
    let handle = Supervisor::current()
        .unwrap()
        .execute(&session, Some(recorder.callback()));
    assert!(started.elapsed() < limit, "execute must not block the caller");
    assert!(!handle.is_finished());

    let report = handle.report().await;
    let waited = started.elapsed();

    assert!(matches!(
        report.outcome,
        ExecutionOutcome::ForciblyTerminated(Termination::Deadline { limit: l }) if l == limit
    ));
    assert!(waited >= limit);
    assert!(waited < Duration::from_secs(3), "overshoot too large: {waited:?}");
    assert_eq!(recorder.calls(), 0);
}

#[tokio::test]
async fn termination_unwinds_through_script_functions() {
    let session = Session::builder()
        .with_max_runtime(Duration::from_millis(200))
        .build("fn spin() { loop {} }\nspin()");

    let outcome = session.evaluate().unwrap().outcome().await;
    assert_eq!(outcome.state(), ExecutionState::ForciblyTerminated);
}

#[tokio::test]
async fn cancel_stops_the_worker() {
    let session = Session::builder()
        .with_max_runtime(Duration::from_secs(30))
        .build("let i = 0; loop { i += 1; }");

    let handle = session.evaluate().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let outcome = handle.outcome().await;
    assert!(matches!(
        outcome,
        ExecutionOutcome::ForciblyTerminated(Termination::Cancelled)
    ));
}

#[tokio::test]
async fn thrown_error_invokes_callback_once() {
    let recorder = ErrorRecorder::new();
    let session = Session::builder().build(r#"throw "boom";"#);

    let handle = Supervisor::current()
        .unwrap()
        .execute(&session, Some(recorder.callback()));
    let report = handle.report().await;

    assert_eq!(report.outcome.state(), ExecutionState::Failed);
    assert_eq!(recorder.calls(), 1);
    let errors = recorder.errors();
    assert!(matches!(errors[0], ScriptError::Runtime(_)));
    assert!(errors[0].to_string().contains("boom"));

    let summary = report.summary();
    assert_eq!(summary.error.unwrap().error_type, "runtime");
}

#[tokio::test]
async fn panicking_host_function_invokes_callback_once() {
    let recorder = ErrorRecorder::new();
    let session = Session::builder()
        .capability(FnCapability::new("explosives", |engine| {
            engine.register_fn("explode", || -> i64 { panic!("host failure") });
        }))
        .build("explode()");

    let handle = Supervisor::current()
        .unwrap()
        .execute(&session, Some(recorder.callback()));
    let report = handle.report().await;

    match &report.outcome {
        ExecutionOutcome::Failed(ScriptError::Panicked(message)) => {
            assert_eq!(message, "host failure");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(recorder.calls(), 1);
    assert!(matches!(recorder.errors()[0], ScriptError::Panicked(_)));
}

#[tokio::test]
async fn failure_without_callback_is_still_reported() {
    let session = Session::builder().build("let x = (); x.field");
    let outcome = session.evaluate().unwrap().outcome().await;
    assert!(matches!(outcome, ExecutionOutcome::Failed(ScriptError::Runtime(_))));
}

#[tokio::test]
async fn evaluate_with_passes_the_error() {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let session = Session::builder().build("1 +");
    let handle = session
        .evaluate_with(move |err| {
            let _ = tx.send(err.clone());
        })
        .unwrap();

    let err = rx.await.unwrap();
    assert!(matches!(err, ScriptError::Parse(_)));
    assert_eq!(handle.outcome().await.state(), ExecutionState::Failed);
}

#[tokio::test]
async fn executions_do_not_share_bindings() {
    let session = Session::builder()
        .with_variable("n", 1_i64)
        .build("n += 1;\nn");

    let first = session.evaluate().unwrap();
    let second = session.evaluate().unwrap();
    assert_ne!(first.id(), second.id());

    for handle in [first, second] {
        let value = handle.outcome().await.value().and_then(|v| v.as_int().ok());
        assert_eq!(value, Some(2));
    }
}

#[tokio::test]
async fn hidden_bindings_are_invisible() {
    let session = Session::builder()
        .with_variable("token", "s3cret".to_string())
        .hide("token")
        .build("token");

    let outcome = session.evaluate().unwrap().outcome().await;
    assert!(matches!(outcome, ExecutionOutcome::Failed(ScriptError::Parse(_))));
}

#[test]
fn evaluate_outside_a_runtime_is_an_error() {
    let session = Session::builder().build("1");
    assert!(matches!(session.evaluate(), Err(Error::NoRuntime)));
}

#[test]
fn queued_execution_gets_its_full_budget() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let supervisor = Supervisor::new(runtime.handle().clone());

    let slow = Session::builder()
        .capability(FnCapability::new("pause", |engine| {
            engine.register_fn("pause", |ms: i64| {
                std::thread::sleep(Duration::from_millis(ms as u64));
            });
        }))
        .with_max_runtime(Duration::from_secs(5))
        .build("pause(500); 1");
    let quick = Session::builder()
        .with_max_runtime(Duration::from_millis(200))
        .build("let total = 0; for i in 0..100 { total += i; } total");

    let (slow, quick) = runtime.block_on(async {
        let slow = supervisor.execute(&slow, None);
        let quick = supervisor.execute(&quick, None);
        (slow.outcome().await, quick.outcome().await)
    });

    assert_eq!(slow.value().and_then(|v| v.as_int().ok()), Some(1));
    match quick {
        ExecutionOutcome::Completed(value) => assert_eq!(value.as_int().unwrap(), 4950),
        other => panic!("queued run was not given its budget: {other:?}"),
    }
}
