//! Mesh Test Framework
//!
//! Test resources for control-plane integration tests. The same test body
//! runs against in-process fakes or a Kubernetes deployment; the environment
//! is chosen once per run and every component follows it.
//!
//! # Environments
//!
//! - `native` (default): Pilot, Apps and PolicyBackend run inside the test binary
//! - `kube`: components are reached through port-forwards and cluster DNS
//!
//! # Usage
//!
//! ```rust,ignore
//! use mesh_test::components::{apps, pilot};
//! use mesh_test::resource::Context;
//!
//! let ctx = Context::from_env()?;
//! let mut pilot = pilot::new_or_fail(&ctx, Default::default()).await;
//! let apps = apps::new_or_fail(&ctx, Default::default()).await;
//!
//! let a = apps.get_app_or_fail("a");
//! pilot
//!     .start_discovery(apps::construct_discovery_request(a, xds_proto::type_url::LISTENER))
//!     .await?;
//! pilot
//!     .watch_discovery(Duration::from_secs(10), |resp| Ok(!resp.resources.is_empty()))
//!     .await?;
//! ```
//!
//! ```bash
//! # In-process fakes
//! cargo test -p mesh-test
//!
//! # Against a cluster (port-forwards for pilot 15010 and policy backend 1071)
//! MESH_TEST_ENV=kube cargo test -p mesh-test --features kube
//! ```

pub mod cluster;
pub mod components;
pub mod config;
pub mod discovery;
pub mod environment;
pub mod features;
pub mod observability;
pub mod resource;
pub mod retry;

pub use environment::{Environment, EnvironmentSwitch};
pub use resource::{Context, Resource, ResourceError, ResourceId};
