//! In-memory fakes of the container engine, a chain and a relayer, for
//! exercising the harness without a container runtime.

mod chain;
mod engine;
mod relayer;

pub use chain::{FakeChain, Journal};
pub use engine::FakeEngine;
pub use relayer::FakeRelayer;
