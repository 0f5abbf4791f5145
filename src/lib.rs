//! Financial Assistant
//!
//! A personal-finance chat assistant:
//! - Forwards natural-language messages to an LLM agent
//! - The agent calls tools to record and query ledger transactions
//! - Amounts are stored as integer cents; conversions are exact
//! - Natural-language queries compile to structured, parameterized reads
//! - Token validation is delegated to a managed identity provider
//!
//! FLOW:
//! MESSAGE → MODEL TURN → TOOL CALLS → TOOL REPLIES → FINAL ANSWER

pub mod agent;
pub mod api;
pub mod auth;
pub mod config;
pub mod currency;
pub mod error;
pub mod gemini;
pub mod interpreter;
pub mod models;
pub mod store;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use interpreter::{QueryInterpreter, QueryStrategy};
