//! ```text
//! link registered / retrain ──► training::TrainingOrchestrator
//!                                   │
//!                    extract::fetch_page ──► sections::split_markdown
//!                                   │
//!                    provider::ModelClient::embed (bounded fan-out)
//!                                   │
//!                    stores::VectorBackend::upsert_chunks
//!
//! user message ──► chat::ChatService
//!                    ├─ provider::ModelClient::moderate / embed
//!                    ├─ stores::VectorBackend::search
//!                    └─ provider::ModelClient::complete[_stream]
//!                                   │
//!                    answer + cited source URLs ──► server (axum)
//! ```
//!
//! Ingestion and chat share the vector store and the provider client but
//! run on independent triggers: ingestion is webhook-driven and records
//! its outcome on the source link, chat is request/response.

pub mod chat;
pub mod config;
pub mod extract;
pub mod message;
pub mod provider;
pub mod sections;
pub mod server;
pub mod stores;
pub mod training;
pub mod types;

pub use types::PipelineError;
