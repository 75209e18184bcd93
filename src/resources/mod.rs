pub mod common;
pub mod dataprotection;
pub mod secret;

pub use common::{FIELD_MANAGER, component_labels, owner_reference};
