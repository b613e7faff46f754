mod handle_queue;
mod read_line;
mod runspace_tracking;

use std::{sync::Arc, time::Duration};

use futures::{StreamExt, channel::mpsc};
use tracing_subscriber::EnvFilter;

use crate::{
    ContextEvent, ExecutionOptions, ExecutionService, PsCommand, PsValue, ServiceConfig,
    sim::{RecordingHostOutput, SimulatedEngine, SimulatedEngineConfig},
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Harness {
    engine: Arc<SimulatedEngine>,
    output: Arc<RecordingHostOutput>,
    service: ExecutionService,
    events: mpsc::UnboundedReceiver<ContextEvent>,
}

impl Harness {
    fn start() -> Self {
        Self::with(SimulatedEngineConfig::default(), ServiceConfig::default())
    }

    fn with(engine_config: SimulatedEngineConfig, config: ServiceConfig) -> Self {
        init_tracing();
        let engine = SimulatedEngine::new(engine_config);
        let output = Arc::new(RecordingHostOutput::new());
        let service = ExecutionService::start(engine.clone(), config, output.clone())
            .expect("service starts");
        let events = service.subscribe();
        Self {
            engine,
            output,
            service,
            events,
        }
    }

    async fn run(&self, script: &str) -> Vec<PsValue> {
        tokio::time::timeout(
            TIMEOUT,
            self.service
                .execute_command(PsCommand::from_script(script), ExecutionOptions::default()),
        )
        .await
        .expect("command finished in time")
        .expect("command succeeded")
    }

    /// Spawns `script` on the runtime and returns its join handle.
    fn spawn(
        &self,
        script: &str,
    ) -> tokio::task::JoinHandle<Result<Vec<PsValue>, crate::ExecutionError>> {
        let service = self.service.clone();
        let command = PsCommand::from_script(script);
        tokio::spawn(async move {
            service
                .execute_command(command, ExecutionOptions::default())
                .await
        })
    }

    async fn next_event(&mut self, matches: impl Fn(&ContextEvent) -> bool) -> ContextEvent {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let event = self.events.next().await.expect("event stream open");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event arrived in time")
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn join<T>(task: tokio::task::JoinHandle<T>) -> T {
    tokio::time::timeout(TIMEOUT, task)
        .await
        .expect("task finished in time")
        .expect("task did not panic")
}
