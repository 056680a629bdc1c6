//! Agent turn engine for a terminal coding assistant.
//!
//! The engine drives a streaming request/response exchange with a
//! tool-enabled model, classifies each proposed command under a three-level
//! approval policy, executes approved commands under a sandbox abstraction
//! with strict cancellation, applies textual patches, and keeps the
//! tool-call contract satisfiable across user interruptions.
//!
//! The terminal UI, configuration files, and persistence all live outside
//! this crate; they talk to the engine through [`agent::SessionHooks`].

pub mod agent;
mod bash;
mod client;
mod client_common;
pub mod error;
pub mod exec;
mod flags;
pub mod is_safe_command;
pub mod landlock;
pub mod safety;
#[cfg(target_os = "macos")]
pub mod seatbelt;
mod spawn;
pub mod util;

pub use agent::AgentConfig;
pub use agent::AgentLoop;
pub use agent::SessionHooks;
pub use client::ModelClient;
pub use client_common::Prompt;
pub use client_common::ResponseEvent;
pub use client_common::ResponseStream;
pub use error::QuillErr;
pub use error::Result;

use tracing_subscriber::EnvFilter;

/// Install a diagnostic `tracing` subscriber when the `DEBUG` environment
/// variable is set. Library embedders that bring their own subscriber should
/// skip this.
pub fn init_diagnostics() {
    if std::env::var_os("DEBUG").is_none() {
        return;
    }
    let filter = EnvFilter::try_from_env("DEBUG").unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
