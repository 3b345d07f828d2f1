// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssuanError {
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection closed by peer")]
    Eof,

    #[error("Line too long: {length} exceeds maximum {max}")]
    LineTooLong { length: usize, max: usize },

    #[error("Invalid protocol line: {0}")]
    InvalidLine(String),

    #[error("Server error {code}: {description}")]
    Server { code: u32, description: String },

    #[error("Inquiry cancelled")]
    Cancelled,

    #[error("Too much data: more than {max} bytes")]
    TooMuchData { max: usize },

    #[error("Unexpected response: {0}")]
    Unexpected(String),
}

impl AssuanError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Error code to use when relaying this failure as an `ERR` line.
    pub fn code(&self) -> u32 {
        match self {
            Self::Server { code, .. } => *code,
            Self::Cancelled => codes::CANCELED,
            Self::TooMuchData { .. } => codes::TOO_MUCH_DATA,
            Self::LineTooLong { .. } => codes::LINE_TOO_LONG,
            Self::InvalidLine(_) | Self::Unexpected(_) => codes::INV_RESPONSE,
            Self::Io { .. } | Self::Eof => codes::GENERAL,
        }
    }
}

/// Numeric error codes used on `ERR` lines written by this side.
///
/// The values follow the libgpg-error numbering with the Assuan source
/// attached, which is what the card daemon and its clients expect.
pub mod codes {
    const SOURCE_ASSUAN: u32 = 15 << 24;

    pub const GENERAL: u32 = SOURCE_ASSUAN | 1;
    pub const NOT_SUPPORTED: u32 = SOURCE_ASSUAN | 60;
    pub const CANCELED: u32 = SOURCE_ASSUAN | 99;
    pub const INV_RESPONSE: u32 = SOURCE_ASSUAN | 260;
    pub const TOO_MUCH_DATA: u32 = SOURCE_ASSUAN | 273;
    pub const LINE_TOO_LONG: u32 = SOURCE_ASSUAN | 263;
}

/// Helper trait for adding context to IO errors
pub trait IoErrorContext<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> IoErrorContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AssuanError::io(f(), e))
    }
}

pub type Result<T> = std::result::Result<T, AssuanError>;
