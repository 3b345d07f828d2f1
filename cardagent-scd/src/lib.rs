// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Hands smart card operations to a card daemon.
//!
//! A [`Registry`] owns the daemon: it starts it on demand, hands every
//! caller's [`Session`] a connection and cleans up when the daemon exits.
//! The card operations themselves are methods on [`Session`].

pub mod card;
pub mod config;
pub mod error;
pub mod inquiry;
pub mod pincache;
pub mod registry;
pub mod sexp;
pub mod supervisor;
pub mod transaction;
pub mod types;

pub use card::{DecryptOutput, SignRequest};
pub use config::Config;
pub use error::{Result, ScdError};
pub use inquiry::{PinPrompt, Upstream};
pub use pincache::{CacheMode, MemoryPinCache, PinCache};
pub use registry::{Registry, RegistrySnapshot, Session, SessionId, SessionSnapshot};
pub use supervisor::{Launcher, ProcessLauncher};
pub use types::{CardKeyInfo, DigestAlgo, LearnResult, LearnSink};

#[cfg(test)]
mod tests;
