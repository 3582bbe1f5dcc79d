//! Core service layer of the pixeldiff server.
//!
//! This crate contains the read-through diff cache and everything it is
//! composed from: the [`DiffMapper`](mapper::DiffMapper) policy that defines
//! diff ids, paths and the diff algorithm, the image loader that fetches
//! reference images from a remote bucket onto local disk, the metric store
//! that persists computed diff metrics across restarts, and the
//! [`DiffStore`](diffstore::DiffStore) orchestrator tying them together.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod diffstore;
pub mod loader;
pub mod mapper;
pub mod store;
pub mod utils;
