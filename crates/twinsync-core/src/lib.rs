//! Core types and reconciliation logic for the twinsync service.
//!
//! This crate is deliberately free of HTTP and transport dependencies.
//! All other crates depend on it; it depends on nothing proprietary.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod client;
pub mod error;
pub mod event;
pub mod facts;
pub mod reconcile;
pub mod twin;

pub use error::{Error, Result};
