//! Infrastructure layer
//!
//! This module contains external integrations and adapters.

mod config;
pub mod container;
mod logging;
mod signing_keys;
mod snapd;

pub use config::{Config, DEFAULT_IMAGE_TEMPLATE, DEFAULT_MANAGED_PROJECT_PATH};
pub use container::{ContainerEnvironment, ContainerProvider, ContainerRuntime};
pub use logging::init_logging;
pub use signing_keys::{LAUNCHPAD_API_BASE_URL, LaunchpadKeySource};
pub use snapd::{SNAPD_SOCKET, SnapdRevisionQuery, parse_revision};
