//! Retrieval-augmented chat assistant for questions about CISNR.
//!
//! A question is embedded, matched against a Qdrant collection, folded into a
//! grounded prompt and answered by a hosted LLM, with the matching document
//! sources returned alongside the answer.

pub mod config;
pub mod error;
pub mod indexer;
pub mod models;
pub mod rag;
pub mod server;

pub use config::Settings;
pub use error::{ChatError, Result};
pub use models::{Answer, RetrievedChunk};
pub use rag::ChatEngine;
