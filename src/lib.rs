#![deny(clippy::mod_module_files)]

//! Uploads git metadata for CI visibility.
//!
//! The client asks the backend which recent commits it already has, packs
//! the rest of the history with `git pack-objects`, and uploads the
//! packfiles. A run happens on a background thread and never reports
//! failure to its caller; the next invocation simply tries again.

pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod git;
pub mod orchestrator;
pub mod runner;
pub mod transport;

pub use config::{Credentials, RequestMode, Settings};
pub use error::Error;
pub use executor::{RequestExecutor, RetryPolicy};
pub use git::{GitCli, GitSource, PackfileBundle};
pub use orchestrator::{AbortReason, RunOutcome, Stage, UploadOrchestrator};
pub use runner::BackgroundRunner;
pub use transport::{FixedResponseTransport, HttpResponse, HttpTransport, Transport};
