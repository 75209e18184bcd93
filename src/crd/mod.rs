mod cluster;
mod component;
mod dataprotection;
mod definition;

pub use cluster::*;
pub use component::*;
pub use dataprotection::*;
pub use definition::*;
