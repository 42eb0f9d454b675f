//! Core of the mirrorgate edge file server.
//!
//! The [`caching`] module keeps served files in memory, [`redirect`] distributes requests across
//! mirrors, and [`serving`] ties both together. [`service::EdgeService`] is the context that owns
//! all of them for the lifetime of a server.

#[macro_use]
pub mod metrics;

pub mod access_log;
pub mod caching;
pub mod config;
pub mod redirect;
pub mod service;
pub mod serving;
