//! OpenAI-compatible HTTP API.
//!
//! Accepts chat completion and transcription requests and hands them to the
//! dispatcher, which forwards them upstream through pool proxies.

mod auth;
mod handlers;
mod server;
pub mod types;

pub use auth::{RequestId, REQUEST_ID_HEADER};
pub use handlers::ATTEMPTS_HEADER;
pub use server::{create_router, run_server, spawn_refreshers, AppState};
pub use types::{AudioUpload, ChatCompletionRequest, Message, ModelList};
