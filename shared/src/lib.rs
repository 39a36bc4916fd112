pub mod liveness;
pub mod protocol;
pub mod registry;
pub mod types;
