// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Line-oriented request/response protocol spoken by the card daemon.
//!
//! [`Connection`] is the client role used towards the daemon,
//! [`Responder`] the server role used towards an upstream caller when an
//! exchange is relayed verbatim.

pub mod client;
pub mod error;
pub mod line;
pub mod server;

pub use client::{BoxedConnection, Connection};
pub use error::{AssuanError, IoErrorContext, Result, codes};
pub use line::{LINE_LENGTH, Line, MAX_LINE_PAYLOAD};
pub use server::Responder;
