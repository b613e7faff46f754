use typed_builder::TypedBuilder;

/// Configuration for the `ExecutionService`.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ServiceConfig {
    /// Reconcile the prompt nest with the engine's runspace after every direct execution.
    #[builder(default = true)]
    pub track_runspace_changes: bool,

    /// Allow commands from other threads to run between keystrokes while the prompt
    /// is reading input. When disabled they wait for the prompt to finish.
    #[builder(default = true)]
    pub enable_idle_invocation: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
