//! Test components. Each is created with its module's `new` / `new_or_fail`
//! and is backed by an in-process fake or a cluster deployment depending on
//! the context's environment.

pub mod apps;
pub mod pilot;
pub mod policybackend;

pub use apps::{App, AppCallOptions, AppEndpoint, AppProtocol, Apps, AppsConfig, AppsError};
pub use pilot::{Pilot, PilotConfig};
pub use policybackend::{PolicyBackend, PolicyBackendError};
