use std::collections::HashMap;

use crate::store::StoreError;

/// Engine error taxonomy. Callers map these onto their own protocol
/// (HTTP status codes, CLI exit codes); the engine never does.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A resource handed in by the caller carries a different tenant key
    /// than the scope it was used with.
    #[error("Access denied")]
    AccessDenied,

    /// Missing rows and rows owned by another tenant are reported the
    /// same way, so existence never leaks across tenants.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field_errors: Option<HashMap<String, String>>,
    },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation { message: message.into(), field_errors: None }
    }

    pub fn field_validation(
        message: impl Into<String>,
        field: impl Into<String>,
        problem: impl Into<String>,
    ) -> Self {
        let mut field_errors = HashMap::new();
        field_errors.insert(field.into(), problem.into());
        EngineError::Validation { message: message.into(), field_errors: Some(field_errors) }
    }
}
