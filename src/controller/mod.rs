pub mod actions;
pub mod apply;
pub mod client;
pub mod context;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod state_machine;
pub mod status;
pub mod store;

pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use status::{StatusManager, spec_changed};
