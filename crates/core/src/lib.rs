pub mod config;
pub mod error;

pub use config::{load_dotenv, RejectionKind, RunnerProperties, StartupMode};
pub use error::*;
