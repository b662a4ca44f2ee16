//! MicaStore node library.
//!
//! A MicaStore server orders client key/value batches across a fixed
//! cluster with the Rabia engine from `mica_rabia` and applies them to a
//! pluggable storage backend. This library exposes the node's building
//! blocks (transport mesh, client proxy, storage backends, wire codec) plus
//! `node::run_node` so integration tests can embed full nodes in-process;
//! the `mica-store` binary is a thin wrapper around it.

pub mod client;
pub mod node;
pub mod proxy;
pub mod store;
pub mod transport;
pub mod wire;
