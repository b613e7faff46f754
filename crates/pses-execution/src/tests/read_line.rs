use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::{Harness, eventually, join};
use crate::{
    ExecutionError, ExecutionOptions, PsCommand, PsValue, ScriptEngine, ServiceConfig,
    sim::{JournalKind, SimulatedEngineConfig},
};

/// The engine journals the read only once the prompt is registered and reading.
async fn prompt_reading(harness: &Harness) {
    eventually("prompt to start reading", || {
        harness
            .engine
            .journal()
            .iter()
            .any(|entry| entry.kind == JournalKind::ReadLine)
    })
    .await;
}

fn spawn_reader(
    harness: &Harness,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<Result<String, ExecutionError>> {
    let service = harness.service.clone();
    tokio::spawn(async move { service.invoke_read_line(&cancel).await })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_line_returns_what_was_typed() {
    let harness = Harness::start();
    harness.engine.send_input("echo typed");

    let line = harness
        .service
        .invoke_read_line(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(line, "echo typed");
    assert!(!harness.service.is_read_line_busy());
    assert!(harness.service.prompt_nest().base_frame().is_handle_available());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commands_run_on_the_prompt_thread_while_it_reads() {
    let harness = Harness::start();
    let reader = spawn_reader(&harness, CancellationToken::new());
    prompt_reading(&harness).await;

    // The idle frame sits on top of the prompt's frame.
    assert_eq!(harness.run("get-depth").await, vec![PsValue::Int(1)]);
    assert!(harness.service.is_read_line_busy(), "the prompt keeps reading");

    harness.engine.send_input("next");
    assert_eq!(join(reader).await.unwrap(), "next");

    let journal = harness.engine.journal();
    let read_thread = journal
        .iter()
        .find(|entry| entry.kind == JournalKind::ReadLine)
        .map(|entry| entry.thread)
        .unwrap();
    let invoke_thread = journal
        .iter()
        .find(|entry| entry.kind == JournalKind::InvokeStarted("get-depth".into()))
        .map(|entry| entry.thread)
        .unwrap();
    assert_eq!(read_thread, invoke_thread);
    assert_eq!(harness.service.prompt_nest().depth(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_commands_from_many_callers_all_complete() {
    let harness = Harness::start();
    let reader = spawn_reader(&harness, CancellationToken::new());
    prompt_reading(&harness).await;

    let tasks: Vec<_> = (0..5).map(|i| harness.spawn(&format!("echo {i}"))).collect();
    for (i, task) in tasks.into_iter().enumerate() {
        let expected = i64::try_from(i).unwrap();
        assert_eq!(join(task).await.unwrap(), vec![PsValue::Int(expected)]);
    }

    harness.engine.send_input("done");
    assert_eq!(join(reader).await.unwrap(), "done");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupting_command_cancels_the_prompt() {
    let harness = Harness::start();
    let reader = spawn_reader(&harness, CancellationToken::new());
    prompt_reading(&harness).await;

    let options = ExecutionOptions::builder()
        .interrupt_command_prompt(true)
        .build();
    let output = harness
        .service
        .execute_command::<PsValue>(PsCommand::from_script("get-depth"), options)
        .await
        .unwrap();

    assert_eq!(output, vec![PsValue::Int(0)]);
    assert!(matches!(join(reader).await, Err(ExecutionError::Cancelled)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_the_caller_token_ends_the_read() {
    let harness = Harness::start();
    let cancel = CancellationToken::new();
    let reader = spawn_reader(&harness, cancel.clone());
    prompt_reading(&harness).await;

    cancel.cancel();
    assert!(matches!(join(reader).await, Err(ExecutionError::Cancelled)));
    assert!(!harness.service.is_read_line_busy());
    assert!(harness.service.prompt_nest().base_frame().is_handle_available());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn without_idle_invocation_commands_wait_for_the_prompt() {
    let harness = Harness::with(
        SimulatedEngineConfig::default(),
        ServiceConfig::builder().enable_idle_invocation(false).build(),
    );
    let reader = spawn_reader(&harness, CancellationToken::new());
    prompt_reading(&harness).await;

    let task = harness.spawn("get-depth");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished(), "command waits for the prompt's handle");

    harness.engine.send_input("typed");
    assert_eq!(join(reader).await.unwrap(), "typed");
    assert_eq!(join(task).await.unwrap(), vec![PsValue::Int(0)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_idle_subscription_is_restored() {
    let harness = Harness::start();
    harness.engine.drop_idle_subscription();
    assert!(!harness.engine.is_idle_subscribed());

    let reader = spawn_reader(&harness, CancellationToken::new());
    prompt_reading(&harness).await;

    assert_eq!(harness.run("echo back").await, vec![PsValue::from("back")]);
    assert!(harness.engine.is_idle_subscribed());

    harness.engine.send_input("done");
    join(reader).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_cancels_a_waiting_prompt() {
    let harness = Harness::start();
    let reader = spawn_reader(&harness, CancellationToken::new());
    prompt_reading(&harness).await;

    harness.service.abort_execution();
    assert!(matches!(join(reader).await, Err(ExecutionError::Cancelled)));
}
