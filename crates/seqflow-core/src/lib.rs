//! Execution engine and port trait definitions for seqflow.
//!
//! This crate defines the "ports" (broker, engine launcher, checkpoint store,
//! format tools, grid slot query) that the infrastructure layer implements,
//! plus everything that can be expressed without touching processes or
//! configuration files: backends, resource allocation, split/combine
//! planning, batch grouping and the pipeline runner.

pub mod backend;
pub mod checkpoint;
pub mod group;
pub mod resources;
pub mod retry;
pub mod runner;
pub mod split;
pub mod stage;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;
