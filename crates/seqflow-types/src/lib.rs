//! Shared domain types for seqflow.
//!
//! This crate contains the types threaded through every pipeline layer:
//! per-sample `DataRecord`s, dispatchable `WorkItem`s, chunk manifests,
//! resource declarations, system configuration and the stage error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, thiserror, secrecy.

pub mod config;
pub mod error;
pub mod job;
pub mod manifest;
pub mod record;
pub mod resources;
