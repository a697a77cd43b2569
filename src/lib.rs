//! Vision Embedding Server Library
//!
//! Multi-vector (late-interaction) embedding server speaking line-delimited
//! JSON-RPC over stdin/stdout, with PDF page/text extraction as a
//! preprocessing step for the retrieval pipeline that consumes it.

pub mod backend;
pub mod config;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod protocol;

// Re-exports
pub use backend::{DeviceContext, EmbeddingBackend, EmbeddingBatch};
pub use config::ServerConfig;
pub use error::ServerError;
pub use extract::DocumentExtractor;
pub use protocol::{Dispatcher, ProtocolLoop, Request, Response};
