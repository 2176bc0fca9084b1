//! Engine Error Taxonomy
//!
//! Typed errors surfaced to RPC callers. Every variant maps onto a
//! JSON-RPC 2.0 error code; validation failures are raised before any
//! mutation so partial state is never observable.

use thiserror::Error;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Error)]
pub enum SbpError {
    /// Type mismatch, out-of-range value, malformed predicate tree
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Malformed JSON-RPC envelope
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Unexpected engine fault; logged, the evaluation loop continues
    #[error("internal error: {0}")]
    Internal(String),
}

impl SbpError {
    /// Wire code for the JSON-RPC error envelope
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }
}
