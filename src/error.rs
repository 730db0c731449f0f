/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file error.rs
 * @brief FauxGate error handling and protocol error codes
 */

use bson::{doc, Document};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FauxGateError {
    #[error("{0}")]
    CommandNotFound(String),

    #[error("{0}")]
    TypeMismatch(String),

    #[error("{0}")]
    BadValue(String),

    #[error("{0}")]
    InvalidNamespace(String),

    #[error("{0}")]
    CursorNotFound(String),

    #[error("{0}")]
    CursorInUse(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    BackendUnavailable(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Interrupted(String),

    /// An error document produced by the backend itself, passed through verbatim.
    #[error("{message}")]
    Backend {
        code: i32,
        code_name: String,
        message: String,
    },

    #[error("Wire protocol error: {0}")]
    WireProtocol(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("BSON error: {0}")]
    Bson(#[from] bson::de::Error),

    #[error("BSON serialization error: {0}")]
    BsonSerialize(#[from] bson::ser::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FauxGateError>;

fn code_name_of(code: i32) -> Option<&'static str> {
    let name = match code {
        1 => "InternalError",
        2 => "BadValue",
        4 => "NoSuchKey",
        9 => "FailedToParse",
        11 => "UserNotFound",
        13 => "Unauthorized",
        14 => "TypeMismatch",
        18 => "AuthenticationFailed",
        20 => "IllegalOperation",
        26 => "NamespaceNotFound",
        27 => "IndexNotFound",
        43 => "CursorNotFound",
        48 => "NamespaceExists",
        50 => "MaxTimeMSExpired",
        52 => "DollarPrefixedFieldName",
        59 => "CommandNotFound",
        66 => "ImmutableField",
        67 => "CannotCreateIndex",
        68 => "IndexAlreadyExists",
        72 => "InvalidOptions",
        73 => "InvalidNamespace",
        85 => "IndexOptionsConflict",
        86 => "IndexKeySpecsConflict",
        112 => "WriteConflict",
        115 => "CommandNotSupported",
        146 => "ExceededMemoryLimit",
        166 => "CommandNotSupportedOnView",
        10334 => "BSONObjectTooLarge",
        11000 => "DuplicateKey",
        11600 => "InterruptedAtShutdown",
        11601 => "Interrupted",
        _ => return None,
    };
    Some(name)
}

impl FauxGateError {
    pub fn command_not_found(name: &str) -> Self {
        Self::CommandNotFound(format!("no such command: '{}'", name))
    }

    pub fn cursor_not_found(id: i64) -> Self {
        Self::CursorNotFound(format!("cursor id {} not found", id))
    }

    pub fn cursor_in_use(id: i64) -> Self {
        Self::CursorInUse(format!("cursor id {} is already in use", id))
    }

    /// A store error carrying a protocol code, named the way the native
    /// server names it.
    pub fn backend(code: i32, message: impl Into<String>) -> Self {
        let code_name = match code_name_of(code) {
            Some(name) => name.to_string(),
            None => format!("Location{}", code),
        };
        Self::Backend {
            code,
            code_name,
            message: message.into(),
        }
    }

    pub fn time_limit_exceeded() -> Self {
        Self::Timeout("operation exceeded time limit".to_string())
    }

    /// Numeric protocol code; zero for errors that never reach the client.
    pub fn code(&self) -> i32 {
        match self {
            Self::CommandNotFound(_) => 59,
            Self::TypeMismatch(_) => 14,
            Self::BadValue(_) => 2,
            Self::InvalidNamespace(_) => 73,
            Self::CursorNotFound(_) => 43,
            Self::CursorInUse(_) => 292,
            Self::Unauthorized(_) => 13,
            Self::BackendUnavailable(_) => 6,
            Self::Timeout(_) => 50,
            Self::Interrupted(_) => 11601,
            Self::Backend { code, .. } => *code,
            Self::WireProtocol(_) | Self::Network(_) => 0,
            Self::Bson(_) | Self::BsonSerialize(_) | Self::Config(_) | Self::Internal(_) => 1,
        }
    }

    pub fn code_name(&self) -> &str {
        match self {
            Self::CommandNotFound(_) => "CommandNotFound",
            Self::TypeMismatch(_) => "TypeMismatch",
            Self::BadValue(_) => "BadValue",
            Self::InvalidNamespace(_) => "InvalidNamespace",
            Self::CursorNotFound(_) => "CursorNotFound",
            Self::CursorInUse(_) => "CursorInUse",
            Self::Unauthorized(_) => "Unauthorized",
            Self::BackendUnavailable(_) => "HostUnreachable",
            Self::Timeout(_) => "MaxTimeMSExpired",
            Self::Interrupted(_) => "Interrupted",
            Self::Backend { code_name, .. } => code_name,
            Self::WireProtocol(_) | Self::Network(_) => "ConnectionFailure",
            Self::Bson(_) | Self::BsonSerialize(_) | Self::Config(_) | Self::Internal(_) => {
                "InternalError"
            }
        }
    }

    /// Errors after which the client connection cannot be used any more.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::WireProtocol(_) | Self::Network(_))
    }

    /// Errors a read-only command may be retried once on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Timeout(_))
    }

    pub fn to_document(&self) -> Document {
        doc! {
            "ok": 0.0,
            "errmsg": self.to_string(),
            "code": self.code(),
            "codeName": self.code_name(),
        }
    }

    /// Rebuilds an error from an `ok: 0` reply document.
    pub fn from_error_document(reply: &Document) -> Self {
        let code = match reply.get("code") {
            Some(bson::Bson::Int32(v)) => *v,
            Some(bson::Bson::Int64(v)) => i32::try_from(*v).unwrap_or(1),
            Some(bson::Bson::Double(v)) => *v as i32,
            _ => 1,
        };
        let code_name = reply
            .get_str("codeName")
            .unwrap_or("InternalError")
            .to_string();
        let message = reply
            .get_str("errmsg")
            .unwrap_or("unknown backend error")
            .to_string();

        Self::Backend {
            code,
            code_name,
            message,
        }
    }
}
