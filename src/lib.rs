//! `hvsched` — two-tier VM placement and capacity manager (spec §1).
//!
//! The library crate holds the whole scheduling core: topology discovery,
//! the subset pool and its oversubscription accounting, the elastic
//! predictor, the per-resource managers, the local agent's control loop
//! and REST surface, and the global dispatcher. The three binaries under
//! `src/bin/` are thin wrappers around this crate.

pub mod agent;
pub mod config;
pub mod connector;
pub mod dataendpoint;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod manager;
pub mod oversubscription;
pub mod predictor;
pub mod subset;
pub mod topology;
