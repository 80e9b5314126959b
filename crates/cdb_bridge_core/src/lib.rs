//! CDB Bridge Core
//!
//! A reusable async library for driving the Windows console debugger (`cdb.exe`)
//! over its stdin/stdout. The debugger has no machine-readable framing, so a
//! command is considered complete once its prompt shows up at the end of the
//! accumulated output.
//!
//! The [`process`] module owns spawning, handshake and termination of the
//! debugger process. The [`engine`] module sits on top of it and runs one
//! command at a time against a single live session.

pub mod args;
pub mod config;
pub mod engine;
pub mod error;
pub mod process;
pub mod prompt;
pub mod types;

// Re-export commonly used types
pub use args::StartupArgs;
pub use config::CdbConfig;
pub use engine::{EngineHandle, SessionEngine};
pub use error::{CdbError, LaunchAttempt, LaunchFailure};
pub use types::{CommandOutput, ExecuteRequest, SessionState};

/// Result type alias using CdbError
pub type Result<T> = std::result::Result<T, CdbError>;
