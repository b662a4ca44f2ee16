//! Rabia consensus crate.
//!
//! This crate provides the Rabia randomized-agreement engine used by
//! mica_store. The API surface is intentionally small: higher layers supply
//! a `StateMachine` and a `Transport`, then feed client batches and peer
//! messages into the `Engine` tasks.

pub mod rabia;
