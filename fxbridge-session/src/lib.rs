//! Account session lifecycle: registry, per-account reactors, risk managers
//! and the metrics sampler.

mod controller;
mod registry;
pub mod risk;
mod sampler;

pub use controller::{spawn_session, start_session, SessionSettings};
pub use registry::{AccountRegistry, SessionHandle};
pub use sampler::spawn_sampler;
