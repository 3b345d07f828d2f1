// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

use cardagent_assuan::{AssuanError, codes};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScdError {
    #[error("Card daemon support is disabled")]
    NotSupported,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("No card daemon available: {0}")]
    NoScdaemon(String),

    #[error("Parameter error: {0}")]
    Parameter(String),

    #[error("Conflicting status lines: {0}")]
    Conflict(String),

    #[error("Unknown inquiry: {0}")]
    UnknownInquiry(String),

    #[error("Too large: {0}")]
    TooLarge(String),

    #[error("Protocol error: {0}")]
    Assuan(#[from] AssuanError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("No data")]
    NoData,

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("PIN entry failed: {0}")]
    PinEntry(String),
}

impl ScdError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    pub fn no_scdaemon(message: impl Into<String>) -> Self {
        Self::NoScdaemon(message.into())
    }

    pub fn parameter(message: impl Into<String>) -> Self {
        Self::Parameter(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The daemon answered the command with `ERR`.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Assuan(AssuanError::Server { .. }))
    }

    /// Error code for relaying this failure to an upstream caller.
    pub fn code(&self) -> u32 {
        match self {
            Self::Assuan(e) => e.code(),
            Self::NotSupported => codes::NOT_SUPPORTED,
            Self::PinEntry(_) => codes::CANCELED,
            _ => codes::GENERAL,
        }
    }
}

/// Helper trait for adding context to IO errors
pub trait IoContext<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ScdError::io(f(), e))
    }
}

pub type Result<T> = std::result::Result<T, ScdError>;
