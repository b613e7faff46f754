mod error;
mod traits;
mod types;

pub use error::*;
pub use traits::{EngineHost, ScriptEngine};
pub use types::*;
