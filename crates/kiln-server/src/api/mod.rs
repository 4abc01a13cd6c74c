//! API routes and handlers

pub mod admin;
pub mod extract;
pub mod internal;
pub mod ollama;
pub mod openai;
mod router;
pub mod streaming;
pub mod types;

pub use router::create_router;
