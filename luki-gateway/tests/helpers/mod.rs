//! Shared test helpers for gateway integration tests.

#![allow(unused_imports)]

pub mod gateway;
pub mod mock_downstream;

pub use gateway::*;
pub use mock_downstream::*;
