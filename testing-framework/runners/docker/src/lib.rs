//! Docker-backed container engine for the interchain test harness, speaking
//! to the daemon API through bollard, and the per-test setup and teardown
//! guard.

mod client;
mod engine;
mod setup;

pub use client::DockerEngine;
pub use setup::{DockerCleanupGuard, DockerSetup};
