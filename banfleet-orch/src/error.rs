//! Error taxonomy for the orchestrator.
//!
//! Storage layers return typed sentinels; the logic layer wraps them
//! into an [`AppError`]; the service layer maps that onto a gRPC
//! status.

use banfleet_kv::KvError;
use thiserror::Error;
use tonic::{Code, Status};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-supplied data violates preconditions.
    Input,
    /// A downstream dependency failed, probably transiently.
    Service,
    /// mTLS chain missing or invalid.
    Permission,
    NotFound,
    AlreadyExists,
}

#[derive(Debug, Error)]
#[error("[{kind:?}] {message}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    pub fn input(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Input, message: message.into() }
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Service, message: message.into() }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Permission, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::NotFound, message: message.into() }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::AlreadyExists, message: message.into() }
    }

    pub fn status(&self) -> Status {
        let code = match self.kind {
            ErrorKind::Input => Code::InvalidArgument,
            ErrorKind::Service => Code::Unavailable,
            ErrorKind::Permission => Code::PermissionDenied,
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::AlreadyExists => Code::AlreadyExists,
        };
        Status::new(code, self.message.clone())
    }
}

impl From<AppError> for Status {
    fn from(err: AppError) -> Self {
        err.status()
    }
}

impl From<KvError> for AppError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::KeyNotFound => AppError::not_found("key not found"),
            KvError::KeyExists => AppError::already_exists("key already exists"),
            KvError::InvalidPageSize => AppError::input("page size must be greater than 0"),
            other => AppError::service(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_grpc_codes() {
        assert_eq!(AppError::input("x").status().code(), Code::InvalidArgument);
        assert_eq!(AppError::service("x").status().code(), Code::Unavailable);
        assert_eq!(AppError::permission("x").status().code(), Code::PermissionDenied);
        assert_eq!(AppError::not_found("x").status().code(), Code::NotFound);
        assert_eq!(AppError::already_exists("x").status().code(), Code::AlreadyExists);
    }

    #[test]
    fn kv_sentinels_become_typed_app_errors() {
        assert_eq!(AppError::from(KvError::KeyNotFound).kind, ErrorKind::NotFound);
        assert_eq!(AppError::from(KvError::KeyExists).kind, ErrorKind::AlreadyExists);
        assert_eq!(AppError::from(KvError::InvalidPageSize).kind, ErrorKind::Input);
    }
}
