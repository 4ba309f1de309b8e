//! Harvester Client - Source clients and payload parsers
//!
//! This crate provides the upstream side of a harvesting stream:
//!
//! - [`http`] - HTTP source client with response classification
//! - [`file`] - Source client reading captured payloads from disk
//! - [`session`] - Session cookie handle shared by the requests of a source
//! - [`parser`] - Rule-driven JSON entity parser
//! - [`registry`] - Clients and parsers built from `sources.toml`

pub mod file;
pub mod http;
pub mod parser;
pub mod registry;
pub mod session;

pub use file::FileSourceClient;
pub use http::{HttpSourceClient, ResponseRules, classify_response};
pub use parser::JsonEntityParser;
pub use registry::{RegisteredSource, SourceClientEnum, SourceRegistry};
pub use session::SessionHandle;
