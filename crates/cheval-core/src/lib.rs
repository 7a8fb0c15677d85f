//! Core types shared across the Cheval gateway.
//!
//! This crate defines the canonical request/result shapes that every
//! provider adapter translates to and from, the error taxonomy carried
//! across the dispatch pipeline, and the redaction primitives that keep
//! secrets out of logs and error output.

pub mod error;
pub mod redaction;
pub mod types;

pub use error::{ChevalError, ChevalResult, ErrorKind};
pub use types::{
    AgentBinding, CompletionRequest, CompletionResult, Message, MessageRole, Requirement,
    ResolvedModel, ToolCall, ToolFunction, Usage, UsageSource, NATIVE_ALIAS, NATIVE_MODEL,
    NATIVE_PROVIDER,
};
