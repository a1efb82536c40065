mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{Recorder, init_tracing};
use dagflow::{
    Emitter, ExecError, Fallback, Flow, FlowEmitter, FlowInfo, GraphError, Predicate,
    SchedulerConfig, TaskDescriptor, Values,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
struct UserId(u64);

#[derive(Debug, Clone, PartialEq)]
struct User {
    name: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Greeting(String);

#[derive(Debug, Clone, PartialEq)]
struct Audit(usize);

fn load_user() -> TaskDescriptor {
    TaskDescriptor::builder(|_ctx, input| async move {
        let id = input.require::<UserId>()?;
        Ok(Values::new().with(User {
            name: format!("user-{}", id.0),
        }))
    })
    .name("load_user")
    .input::<UserId>()
    .output::<User>()
    .fallible()
    .build()
}

fn greet() -> TaskDescriptor {
    TaskDescriptor::builder(|_ctx, input| async move {
        let user = input.require::<User>()?;
        Ok(Values::new().with(Greeting(format!("hello {}", user.name))))
    })
    .name("greet")
    .input::<User>()
    .output::<Greeting>()
    .build()
}

#[tokio::test]
async fn values_flow_between_tasks() {
    init_tracing();
    let flow = Flow::builder("greeting")
        .param(UserId(7))
        .result::<Greeting>()
        .task(greet())
        .task(load_user())
        .build()
        .unwrap();

    let values = flow.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(values.get::<Greeting>(), Some(&Greeting("hello user-7".into())));
    assert_eq!(values.len(), 1);
}

#[tokio::test]
async fn fallback_value_replaces_a_failing_task_every_time() {
    init_tracing();
    let flow = Flow::builder("serial")
        .result::<String>()
        .task(
            TaskDescriptor::builder(|_ctx, _input| async { anyhow::bail!("x") })
                .name("serial")
                .output::<String>()
                .fallible()
                .fallback(Fallback::values(Values::new().with("bar".to_string())))
                .build(),
        )
        .build()
        .unwrap();

    for _ in 0..3 {
        let values = flow.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(values.cloned::<String>().as_deref(), Some("bar"));
    }
}

#[tokio::test]
async fn task_error_fails_the_flow_and_skips_dependents() {
    init_tracing();
    let recorder = Recorder::default();
    let flow = Flow::builder("broken")
        .param(UserId(1))
        .result::<Greeting>()
        .task(
            TaskDescriptor::builder(|_ctx, _input| async { anyhow::bail!("user store down") })
                .name("load_user")
                .input::<UserId>()
                .output::<User>()
                .fallible()
                .build(),
        )
        .task(greet())
        .emitter(Arc::new(recorder.clone()))
        .build()
        .unwrap();

    let err = flow.run(&CancellationToken::new()).await.unwrap_err();
    match &err {
        ExecError::Task(task) => {
            assert_eq!(task.task(), "load_user");
            assert_eq!(task.inner().to_string(), "user store down");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(
        recorder.task_events("load_user"),
        vec!["task_start", "task_error", "task_done"]
    );
    assert_eq!(recorder.task_events("greet"), vec!["task_skipped_err"]);
    let events = recorder.events();
    assert_eq!(events.first().map(String::as_str), Some("flow_start"));
    assert_eq!(events.last().map(String::as_str), Some("flow_done"));
    assert!(events.contains(&"flow_error".to_string()));
}

#[tokio::test]
async fn panic_becomes_a_panic_error() {
    init_tracing();
    async fn explode(_ctx: CancellationToken, _input: Values) -> anyhow::Result<Values> {
        panic!("great sadness")
    }
    let recorder = Recorder::default();
    let flow = Flow::builder("panics")
        .result::<User>()
        .task(TaskDescriptor::builder(explode).name("explode").output::<User>().build())
        .emitter(Arc::new(recorder.clone()))
        .build()
        .unwrap();

    let err = flow.run(&CancellationToken::new()).await.unwrap_err();
    let panic = err.as_panic().expect("panic error");
    assert_eq!(panic.message(), "great sadness");
    assert_eq!(
        recorder.task_events("explode"),
        vec!["task_start", "task_panic", "task_done"]
    );
}

#[tokio::test]
async fn declined_predicate_leaves_the_result_absent() {
    init_tracing();
    let recorder = Recorder::default();
    let flow = Flow::builder("gated")
        .param(UserId(3))
        .param(false)
        .result::<User>()
        .task(
            TaskDescriptor::builder(|_ctx, _input| async {
                Ok(Values::new().with(User { name: "never".into() }))
            })
            .name("gated")
            .input::<UserId>()
            .output::<User>()
            .predicate(Predicate::new(|input| input.cloned::<bool>().unwrap_or(false)).input::<bool>())
            .build(),
        )
        .emitter(Arc::new(recorder.clone()))
        .build()
        .unwrap();

    let values = flow.run(&CancellationToken::new()).await.unwrap();
    assert!(values.get::<User>().is_none());
    assert_eq!(recorder.task_events("gated"), vec!["task_skipped"]);
    assert!(recorder.events().contains(&"flow_success".to_string()));
}

#[tokio::test]
async fn invoked_task_runs_for_its_side_effect() {
    init_tracing();
    let audits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&audits);
    let flow = Flow::builder("audit")
        .param(UserId(9))
        .task(load_user())
        .task(
            TaskDescriptor::builder(move |_ctx, input| {
                let counter = Arc::clone(&counter);
                async move {
                    input.require::<User>()?;
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(Values::new().with(Audit(n)))
                }
            })
            .name("audit")
            .input::<User>()
            .output::<Audit>()
            .invoke(true)
            .build(),
        )
        .build()
        .unwrap();

    let values = flow.run(&CancellationToken::new()).await.unwrap();
    assert!(values.is_empty());
    assert_eq!(audits.load(Ordering::SeqCst), 1);
}

#[test]
fn every_graph_problem_is_reported_at_once() {
    #[derive(Debug)]
    struct Ping;
    #[derive(Debug)]
    struct Pong;

    let err = Flow::builder("invalid")
        .param(UserId(1))
        .param(42u32)
        .result::<Greeting>()
        .task(load_user())
        .task(load_user())
        .task(
            TaskDescriptor::builder(|_ctx, _input| async { Ok(Values::new()) })
                .name("ping")
                .input::<Pong>()
                .output::<Ping>()
                .build(),
        )
        .task(
            TaskDescriptor::builder(|_ctx, _input| async { Ok(Values::new()) })
                .name("pong")
                .input::<Ping>()
                .output::<Pong>()
                .build(),
        )
        .build()
        .unwrap_err();

    assert!(err.any(GraphError::is_duplicate_provider), "{err}");
    assert!(err.any(GraphError::is_missing_provider), "{err}");
    assert!(err.any(GraphError::is_cycle), "{err}");
    assert!(
        err.iter().any(|e| matches!(e, GraphError::UnusedInput { .. })),
        "{err}"
    );
    assert!(err.to_string().contains("graph errors:"));
}

#[tokio::test]
async fn cancelled_context_stops_the_flow() {
    init_tracing();
    let flow = Flow::builder("cancelled")
        .param(UserId(1))
        .result::<Greeting>()
        .task(load_user())
        .task(greet())
        .build()
        .unwrap();

    let ctx = CancellationToken::new();
    ctx.cancel();
    let err = flow.run(&ctx).await.unwrap_err();
    assert!(err.is_cancelled(), "{err}");
}

#[tokio::test]
async fn panicking_emitter_does_not_affect_the_flow() {
    init_tracing();
    struct Faulty;

    impl Emitter for Faulty {
        fn flow_init(&self, _info: &FlowInfo) -> Arc<dyn FlowEmitter> {
            Arc::new(Faulty)
        }
    }

    impl FlowEmitter for Faulty {
        fn flow_start(&self) {
            panic!("emitter bug");
        }
        fn flow_success(&self) {
            panic!("emitter bug");
        }
    }

    let flow = Flow::builder("faulty-emitter")
        .param(UserId(2))
        .result::<User>()
        .task(load_user())
        .emitter(Arc::new(Faulty))
        .build()
        .unwrap();

    let values = flow.run(&CancellationToken::new()).await.unwrap();
    assert!(values.get::<User>().is_some());
}

#[tokio::test]
async fn scheduler_state_reaches_the_emitter() {
    init_tracing();
    let recorder = Recorder::default();
    let flow = Flow::builder("slow")
        .result::<User>()
        .config(
            SchedulerConfig::default()
                .with_concurrency(2)
                .with_state_flush_frequency(Duration::from_millis(5)),
        )
        .task(
            TaskDescriptor::builder(|_ctx, _input| async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok(Values::new().with(User { name: "slow".into() }))
            })
            .output::<User>()
            .build(),
        )
        .emitter(Arc::new(recorder.clone()))
        .build()
        .unwrap();

    flow.run(&CancellationToken::new()).await.unwrap();
    let states = recorder.states();
    assert!(!states.is_empty());
    assert!(states.iter().all(|s| s.concurrency == 2));
}

#[test]
fn graph_renders_as_a_tree() {
    let flow = Flow::builder("tree")
        .param(UserId(1))
        .result::<Greeting>()
        .task(load_user())
        .task(greet())
        .build()
        .unwrap();

    assert_eq!(flow.graph().to_string(), "load_user\n  └─> greet\n");
}
