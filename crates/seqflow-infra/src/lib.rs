//! Infrastructure layer for seqflow.
//!
//! Contains implementations of the ports defined in `seqflow-core`:
//! transactional file output, the filesystem checkpoint store, external tool
//! adapters, grid slot queries, the in-process broker and engine launcher,
//! plus configuration loading and host resource detection.

pub mod broker;
pub mod checkpoint;
pub mod config;
pub mod engines;
pub mod grid;
pub mod host;
pub mod process;
pub mod tools;
pub mod transaction;
