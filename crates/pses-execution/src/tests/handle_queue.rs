use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Harness, TIMEOUT, eventually, join};
use crate::{
    ExecutionError, ExecutionOptions, PsCommand, PsValue, RunspaceHandle,
    prompt_nest::PromptNestFrameType, sim::JournalKind,
};

fn spawn_waiter(harness: &Harness) -> tokio::task::JoinHandle<Result<RunspaceHandle, ExecutionError>> {
    let service = harness.service.clone();
    tokio::spawn(async move { service.get_runspace_handle(&CancellationToken::new()).await })
}

/// A second caller must not get a handle while `held` is out.
async fn assert_exclusive(harness: &Harness, held: &RunspaceHandle) {
    let second = tokio::time::timeout(
        Duration::from_millis(50),
        harness.service.get_runspace_handle(&CancellationToken::new()),
    )
    .await;
    assert!(second.is_err(), "a second handle was issued while {held:?} is held");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_caller_holds_the_handle() {
    let harness = Harness::start();
    let holders = Arc::new(AtomicUsize::new(0));
    let max_holders = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let service = harness.service.clone();
            let holders = Arc::clone(&holders);
            let max_holders = Arc::clone(&max_holders);
            tokio::spawn(async move {
                let handle = service
                    .get_runspace_handle(&CancellationToken::new())
                    .await
                    .unwrap();
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_holders.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
                drop(handle);
            })
        })
        .collect();

    for task in tasks {
        join(task).await;
    }
    assert_eq!(max_holders.load(Ordering::SeqCst), 1);
    assert!(harness.service.prompt_nest().base_frame().is_handle_available());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiters_are_served_in_arrival_order() {
    let harness = Harness::start();
    let base = harness.service.prompt_nest().base_frame();
    let held = harness
        .service
        .get_runspace_handle(&CancellationToken::new())
        .await
        .unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for index in 0..4 {
        let service = harness.service.clone();
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let handle = service
                .get_runspace_handle(&CancellationToken::new())
                .await
                .unwrap();
            order.lock().push(index);
            drop(handle);
        }));
        eventually("waiter to register", || base.pending_handle_requests() == index + 1).await;
    }

    drop(held);
    for task in tasks {
        join(task).await;
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_waiter_does_not_disturb_the_queue() {
    let harness = Harness::start();
    let base = harness.service.prompt_nest().base_frame();
    let held = harness
        .service
        .get_runspace_handle(&CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let waiter = tokio::spawn({
        let service = harness.service.clone();
        let cancel = cancel.clone();
        async move { service.get_runspace_handle(&cancel).await.map(drop) }
    });
    eventually("waiter to register", || base.pending_handle_requests() == 1).await;

    cancel.cancel();
    assert!(matches!(join(waiter).await, Err(ExecutionError::Cancelled)));
    assert_eq!(base.pending_handle_requests(), 0);

    drop(held);
    assert!(base.is_handle_available());
    let again = harness
        .service
        .get_runspace_handle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.frame().depth, 0);
}

#[tokio::test]
async fn nested_frame_leaves_the_outer_queue_untouched() {
    let harness = Harness::start();
    let nest = harness.service.prompt_nest();
    let base = nest.base_frame();

    let outer = harness
        .service
        .get_runspace_handle(&CancellationToken::new())
        .await
        .unwrap();
    drop(outer);
    assert!(base.is_handle_available());

    let nested = nest.push(PromptNestFrameType::NESTED_PROMPT);
    let inner = harness
        .service
        .get_runspace_handle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(inner.frame().id, nested.id());
    assert!(base.is_handle_available(), "outer handle is not consumed at depth 1");
    drop(inner);
    nest.pop_frame(&nested).unwrap();

    assert!(base.is_handle_available());
    assert_eq!(base.pending_handle_requests(), 0);
    let after = harness
        .service
        .get_runspace_handle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(after.frame().id, base.id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiter_on_a_popped_frame_moves_to_the_new_top() {
    let harness = Harness::start();
    let nest = harness.service.prompt_nest();
    let base = nest.base_frame();

    let (release, released) = crossbeam::channel::bounded::<()>(1);
    let pusher = std::thread::spawn({
        let service = harness.service.clone();
        move || {
            service
                .prompt_nest()
                .run_in_pushed_frame(PromptNestFrameType::NORMAL, |handle| {
                    let _ = released.recv_timeout(TIMEOUT);
                    handle.frame().id
                })
                .unwrap()
        }
    });
    eventually("frame to be pushed", || nest.depth() == 1).await;
    let pushed = nest.current_frame();

    let waiter = spawn_waiter(&harness);
    eventually("waiter to register", || pushed.pending_handle_requests() == 1).await;
    release.send(()).unwrap();
    assert_eq!(tokio::task::spawn_blocking(move || pusher.join().unwrap()).await.unwrap(), pushed.id());

    let handle = join(waiter).await.unwrap();
    assert!(pushed.is_popped());
    assert_eq!(handle.frame().id, base.id());
    assert!(!handle.is_frame_popped());
    assert_exclusive(&harness, &handle).await;

    drop(handle);
    assert!(base.is_handle_available());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiter_during_an_idle_invocation_waits_for_the_prompt_frame() {
    let harness = Harness::start();
    let nest = harness.service.prompt_nest();
    let base = nest.base_frame();

    let reader = tokio::spawn({
        let service = harness.service.clone();
        async move { service.invoke_read_line(&CancellationToken::new()).await }
    });
    eventually("prompt to start reading", || {
        harness
            .engine
            .journal()
            .iter()
            .any(|entry| entry.kind == JournalKind::ReadLine)
    })
    .await;

    let idle = harness.spawn("sleep 500");
    eventually("idle frame to be pushed", || nest.depth() == 1).await;
    let idle_frame = nest.current_frame();

    let waiter = spawn_waiter(&harness);
    eventually("waiter to register", || idle_frame.pending_handle_requests() == 1).await;
    join(idle).await.unwrap();

    // The prompt still holds the base frame, so the waiter moves there and keeps waiting.
    assert!(idle_frame.is_popped());
    eventually("waiter to move to the prompt frame", || base.pending_handle_requests() == 1).await;
    assert!(!waiter.is_finished());

    harness.engine.send_input("done");
    assert_eq!(join(reader).await.unwrap(), "done");

    let handle = join(waiter).await.unwrap();
    assert_eq!(handle.frame().id, base.id());
    assert_exclusive(&harness, &handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiter_during_a_nested_prompt_request_gets_the_nested_frame() {
    let harness = Harness::start();
    let nest = harness.service.prompt_nest();
    let task = harness.spawn("nested | echo done");
    eventually("nested prompt to open", || harness.service.is_nested_prompt()).await;
    let nested_frame = nest.current_frame();

    let busy = harness.spawn("sleep 500");
    eventually("request frame to be pushed", || nest.depth() == 2).await;
    let request_frame = nest.current_frame();

    let waiter = spawn_waiter(&harness);
    eventually("waiter to register", || request_frame.pending_handle_requests() == 1).await;
    join(busy).await.unwrap();

    let handle = join(waiter).await.unwrap();
    assert!(request_frame.is_popped());
    assert_eq!(handle.frame().id, nested_frame.id());
    assert_eq!(nest.current_frame().id(), nested_frame.id());
    assert_exclusive(&harness, &handle).await;
    drop(handle);

    assert!(harness.service.exit_nested_prompt());
    assert_eq!(join(task).await.unwrap(), vec![PsValue::from("done")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commands_racing_loop_entry_and_exit_never_run_beside_it() {
    let harness = Harness::start();
    let stop = CancellationToken::new();

    let callers: Vec<_> = (0..3)
        .map(|_| {
            let service = harness.service.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut depths = Vec::new();
                while !stop.is_cancelled() {
                    let depth = service
                        .execute_command::<i64>(PsCommand::from_script("get-depth"), ExecutionOptions::default())
                        .await
                        .unwrap();
                    depths.extend(depth);
                }
                depths
            })
        })
        .collect();

    for _ in 0..20 {
        let task = harness.spawn("nested");
        eventually("nested prompt to open", || harness.service.is_nested_prompt()).await;
        assert!(harness.service.exit_nested_prompt());
        join(task).await.unwrap();
    }
    stop.cancel();

    for caller in callers {
        let depths = join(caller).await;
        // Base frame when run directly, the request frame above the nested prompt when
        // posted into it. Never the nested prompt's own frame.
        assert!(depths.iter().all(|depth| *depth == 0 || *depth == 2), "{depths:?}");
    }
    assert_eq!(harness.engine.max_concurrent_top_level(), 1);
}
