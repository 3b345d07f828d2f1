// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! PIN cache collaborator and the `PINCACHE_PUT` status directive.
//!
//! The daemon may announce a PIN it verified by emitting
//! `S PINCACHE_PUT <key> <hex-cryptogram>` in the middle of any command.
//! The cryptogram is the PIN wrapped with AES-128 key wrap (RFC 3394)
//! under a fixed key. The wrapping only keeps the PIN out of casual log
//! output on a local channel; it is not a secret.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use aes::Aes128;
use aes_kw::Kek;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, error, trace};
use zeroize::Zeroizing;

/// Key shared with the daemon for the cache wrap protocol.
pub const PINCACHE_WRAP_KEY: &[u8; 16] = b"1234567890123456";

/// Minimum cryptogram length in bytes: one 64 bit integrity block plus a
/// 128 bit payload.
const MIN_CRYPTOGRAM_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheMode {
    Normal,
    User,
    Ssh,
    Pin,
    Data,
}

/// Secure cache receiving PINs announced by the daemon.
pub trait PinCache: Send + Sync {
    /// Store `value` under `key`, or flush the entries under `key` when
    /// `value` is `None`. A `ttl` of `None` selects the cache default.
    fn put(&self, key: &str, mode: CacheMode, value: Option<SecretString>, ttl: Option<Duration>);

    /// Drop every PIN-class entry.
    fn flush_pins(&self);
}

struct CacheEntry {
    value: SecretString,
    expires: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process cache keeping values in `secrecy` containers.
///
/// Flushing a PIN key removes every PIN entry whose key starts with it, so
/// a reader-level key clears all slots of that reader.
pub struct MemoryPinCache {
    entries: Mutex<HashMap<(CacheMode, String), CacheEntry>>,
    default_ttl: Option<Duration>,
}

impl Default for MemoryPinCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MemoryPinCache {
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn get(&self, key: &str, mode: CacheMode) -> Option<SecretString> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&(mode, key.to_string()))
            .filter(|entry| !entry.is_expired())
            .map(|entry| SecretString::from(entry.value.expose_secret().to_owned()))
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|entry| !entry.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PinCache for MemoryPinCache {
    fn put(&self, key: &str, mode: CacheMode, value: Option<SecretString>, ttl: Option<Duration>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(value) => {
                trace!(key = %key, ?mode, "caching value");
                let expires = ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl);
                entries.insert((mode, key.to_string()), CacheEntry { value, expires });
            }
            None if mode == CacheMode::Pin => {
                entries.retain(|(m, k), _| !(*m == CacheMode::Pin && k.starts_with(key)));
            }
            None => {
                entries.remove(&(mode, key.to_string()));
            }
        }
    }

    fn flush_pins(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|(mode, _), _| *mode != CacheMode::Pin);
    }
}

/// Apply the arguments of a `PINCACHE_PUT` status line to `cache`.
///
/// Malformed directives are logged and ignored; they never fail the
/// command they arrived with.
pub fn handle_pincache_put(cache: &dyn PinCache, args: &str) {
    let args = args.trim_start_matches([' ', '\t']);
    let (key, rest) = args.split_once([' ', '\t']).unwrap_or((args, ""));
    if key.len() < 3 {
        // at least two slashes and a slot number
        error!("PINCACHE_PUT: ignoring invalid key");
        return;
    }

    let rest = rest.trim_start_matches([' ', '\t']);
    let hex_wrapped = rest.split([' ', '\t']).next().unwrap_or_default();
    if hex_wrapped.is_empty() {
        debug!("PINCACHE_PUT: flushing cache '{key}'");
        cache.put(key, CacheMode::Pin, None, None);
        return;
    }

    if hex_wrapped.len() < 2 * MIN_CRYPTOGRAM_LEN {
        error!("PINCACHE_PUT: ignoring request with too short cryptogram");
        return;
    }
    let even = hex_wrapped.len() & !1;
    let wrapped = match hex::decode(&hex_wrapped[..even]) {
        Ok(wrapped) => Zeroizing::new(wrapped),
        Err(e) => {
            error!("PINCACHE_PUT: invalid hex cryptogram: {e}");
            return;
        }
    };

    let pin = match unwrap_pin(&wrapped) {
        Ok(pin) => pin,
        Err(e) => {
            error!("PINCACHE_PUT: error decrypting the cryptogram: {e}");
            return;
        }
    };

    debug!("PINCACHE_PUT: caching '{key}'");
    cache.put(key, CacheMode::Pin, Some(pin), None);
}

/// Unwrap a cryptogram into the PIN it carries.
///
/// The plaintext is a NUL padded string; everything from the first NUL on
/// is dropped.
pub fn unwrap_pin(wrapped: &[u8]) -> Result<SecretString, String> {
    let kek = Kek::<Aes128>::try_from(&PINCACHE_WRAP_KEY[..])
        .map_err(|e| format!("invalid wrap key: {e:?}"))?;
    let plain = Zeroizing::new(
        kek.unwrap_vec(wrapped)
            .map_err(|e| format!("key unwrap failed: {e:?}"))?,
    );
    debug_assert_eq!(plain.len(), wrapped.len() - 8);

    let end = plain.iter().position(|&b| b == 0).unwrap_or(plain.len());
    let pin = std::str::from_utf8(&plain[..end]).map_err(|_| "PIN is not valid UTF-8".to_string())?;
    Ok(SecretString::from(pin.to_owned()))
}
