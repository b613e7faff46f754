use pretty_assertions::assert_eq;

use super::Harness;
use crate::{
    ContextEvent, ExecutionError, ServiceConfig,
    engine::{RunspaceContext, RunspaceDetails, RunspaceLocation},
    events::{RunspaceChange, RunspaceChangeReason},
    sim::SimulatedEngineConfig,
};

async fn next_runspace_change(harness: &mut Harness) -> RunspaceChange {
    let ContextEvent::RunspaceChanged(change) = harness
        .next_event(|event| matches!(event, ContextEvent::RunspaceChanged(_)))
        .await
    else {
        unreachable!()
    };
    change
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn entering_and_leaving_a_session_moves_the_prompt() {
    let mut harness = Harness::start();
    let local = harness.service.current_runspace();

    harness.run("enter-pssession server01").await;
    let pushed = next_runspace_change(&mut harness).await;
    assert_eq!(pushed.reason, RunspaceChangeReason::PushedSession);
    assert_eq!(pushed.previous, local);
    assert_eq!(
        pushed.current.location,
        RunspaceLocation::Remote {
            computer_name: "server01".to_string()
        }
    );
    assert!(harness.service.prompt_nest().is_remote());
    assert_eq!(harness.service.prompt_nest().depth(), 1);

    // Runs against the remote frame's handle.
    assert_eq!(harness.run("get-depth").await, vec![crate::PsValue::Int(1)]);

    harness.run("exit-pssession").await;
    let popped = next_runspace_change(&mut harness).await;
    assert_eq!(popped.reason, RunspaceChangeReason::PoppedSession);
    assert_eq!(popped.current, local);
    assert!(!harness.service.prompt_nest().is_remote());
    assert_eq!(harness.service.current_runspace(), local);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_transport_unwinds_every_remote_frame() {
    let mut harness = Harness::start();
    harness.run("enter-pssession server01").await;
    harness.run("enter-pssession server02").await;
    assert_eq!(harness.service.prompt_nest().depth(), 2);

    harness.run("drop-session").await;
    let mut reasons = Vec::new();
    for _ in 0..4 {
        reasons.push(next_runspace_change(&mut harness).await.reason);
    }
    assert_eq!(
        reasons,
        vec![
            RunspaceChangeReason::PushedSession,
            RunspaceChangeReason::PushedSession,
            RunspaceChangeReason::SessionClosed,
            RunspaceChangeReason::SessionClosed,
        ]
    );
    assert_eq!(harness.service.prompt_nest().depth(), 0);
    assert!(!harness.service.current_runspace().is_remote());
}

#[tokio::test]
async fn manual_push_and_pop_follow_the_runspace_kind() {
    let mut harness = Harness::start();
    let attached = RunspaceDetails {
        context: RunspaceContext::EnteredProcess,
        ..RunspaceDetails::local()
    };

    harness.service.push_runspace(attached.clone());
    assert_eq!(
        next_runspace_change(&mut harness).await.reason,
        RunspaceChangeReason::EnteredProcess
    );
    assert!(harness.service.prompt_nest().is_remote());

    assert_eq!(harness.service.pop_runspace().unwrap(), attached);
    assert_eq!(
        next_runspace_change(&mut harness).await.reason,
        RunspaceChangeReason::ExitedProcess
    );

    assert!(matches!(
        harness.service.pop_runspace(),
        Err(ExecutionError::InvariantViolation(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tracking_can_be_turned_off() {
    let harness = Harness::with(
        SimulatedEngineConfig::default(),
        ServiceConfig::builder().track_runspace_changes(false).build(),
    );
    harness.run("enter-pssession server01").await;

    assert_eq!(harness.service.prompt_nest().depth(), 0);
    assert!(!harness.service.current_runspace().is_remote());
}
