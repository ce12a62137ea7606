//! Streaming ingestion and comparison of healthcare price-transparency
//! Machine Readable Files (MRF) by CPT code.
//!
//! The crate is organized leaf-first, mirroring the data flow: a
//! [`reader`] presents one or more file parts as a single byte stream, an
//! [`extractor`] pulls `in_network[*]` items out of that stream one at a
//! time, [`model`] holds the resulting rate records and the sole filter
//! primitive, [`aggregate`] reduces a code's rates under a chosen compare
//! rule, and [`comparator`] / [`session`] compare two sources in batch or
//! incrementally. [`store`] holds loaded sources in memory; [`core`]
//! exposes the whole thing as the nine operations a transport layer
//! drives.
//!
//! This crate has no binary target and no HTTP/CLI surface of its own —
//! those are external collaborators that invoke [`core::Core`].

pub mod aggregate;
pub mod comparator;
pub mod config;
pub mod core;
pub mod error;
pub mod extractor;
pub mod fetch;
pub mod loaders;
pub mod model;
pub mod reader;
pub mod session;
pub mod store;

pub use aggregate::CompareRule;
pub use comparator::ComparisonReport;
pub use config::Config;
pub use core::{Core, FetchOutcome, LoadOutcome, LoadReport, SourceFormat};
pub use error::{CoreError, CoreResult};
pub use session::IncrementalSnapshot;
