//! Common test utilities and fixtures.

pub mod fixtures;
pub mod gateway;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use gateway::*;
