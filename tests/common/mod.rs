// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Common test utilities and fixtures shared across all test targets
//!
//! This module provides reusable builders, an in-memory [`ClusterReader`]
//! and a recording lifecycle action runner.
//!
//! # Usage
//!
//! Include this module in your test file:
//! ```rust,ignore
//! #[path = "../common/mod.rs"]
//! mod common;
//! use common::*;
//! ```
//!
//! [`ClusterReader`]: dbcluster_operator::controller::client::ClusterReader


#[allow(unused_imports)]
pub use fixtures::*;
