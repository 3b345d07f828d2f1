// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Card operations run on a [`Session`].
//!
//! Each operation acquires the session's connection, runs one or more
//! transactions on it and releases the session again, handing back the
//! transaction's outcome. Output buffers are only returned on success. An
//! operation dropped part way gives up its connection.

use cardagent_assuan::{LINE_LENGTH, MAX_LINE_PAYLOAD};
use futures::future::{self, BoxFuture};
use percent_encoding::percent_decode_str;
use tokio::sync::Mutex;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Result, ScdError};
use crate::inquiry::{Forward, NeedPin, PinPrompt, Upstream, WriteKeyInquiry};
use crate::registry::Session;
use crate::sexp::canon_len;
use crate::transaction::{StatusSink, Transaction};
use crate::types::{CardKeyInfo, DigestAlgo, LearnSink};

/// Bytes of ciphertext uploaded per `SETDATA` line.
const SETDATA_CHUNK: usize = (LINE_LENGTH - 50) / 2;

/// Length of a hex encoded keygrip.
const KEYGRIP_HEX_LEN: usize = 40;

/// Parameters of a signing request.
#[derive(Debug, Clone, Copy)]
pub struct SignRequest<'a> {
    pub keyid: &'a str,
    /// Selects the `--hash` option; `None` sends no option
    pub digest: Option<DigestAlgo>,
    pub data: &'a [u8],
    /// Use the card's authentication key (`PKAUTH`) instead of `PKSIGN`
    pub auth: bool,
    /// Shown with PIN prompts
    pub desc: Option<&'a str>,
}

impl<'a> SignRequest<'a> {
    pub fn new(keyid: &'a str, data: &'a [u8]) -> Self {
        Self {
            keyid,
            digest: None,
            data,
            auth: false,
            desc: None,
        }
    }
}

/// Result of `PKDECRYPT`.
pub struct DecryptOutput {
    pub plaintext: Zeroizing<Vec<u8>>,
    /// Padding scheme reported by the card, -1 when none was reported
    pub padding: i32,
}

fn ready<T: Send + 'static>(value: T) -> BoxFuture<'static, T> {
    Box::pin(future::ready(value))
}

/// Length of the run of hex digits at the start of `s`.
fn hex_run(s: &str) -> usize {
    s.bytes().take_while(u8::is_ascii_hexdigit).count()
}

/// Integer at the start of `s` the way C's `atoi` reads it.
fn leading_int(s: &str) -> i32 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let value = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i32, |acc, d| acc.wrapping_mul(10).wrapping_add(i32::from(d - b'0')));
    if negative { value.wrapping_neg() } else { value }
}

#[derive(Default)]
struct SerialnoParser {
    serialno: Option<String>,
}

impl SerialnoParser {
    fn parse(&mut self, keyword: &str, args: &str) -> Result<()> {
        if keyword != "SERIALNO" {
            return Ok(());
        }
        if self.serialno.is_some() {
            return Err(ScdError::Conflict("SERIALNO reported twice".to_string()));
        }
        let n = hex_run(args);
        let terminated = matches!(args.as_bytes().get(n), None | Some(b' ' | b'\t'));
        if n == 0 || n % 2 != 0 || !terminated {
            return Err(ScdError::parameter(format!("malformed serial number '{args}'")));
        }
        self.serialno = Some(args[..n].to_string());
        Ok(())
    }
}

impl StatusSink for SerialnoParser {
    fn status<'a>(&'a mut self, keyword: &'a str, args: &'a str) -> BoxFuture<'a, Result<()>> {
        ready(self.parse(keyword, args))
    }
}

struct LearnForwarder<'a> {
    sink: &'a mut dyn LearnSink,
}

impl StatusSink for LearnForwarder<'_> {
    fn status<'a>(&'a mut self, keyword: &'a str, args: &'a str) -> BoxFuture<'a, Result<()>> {
        match keyword {
            "CERTINFO" => self.sink.cert_info(args),
            "KEYPAIRINFO" => self.sink.keypair_info(args),
            _ if !args.is_empty() => self.sink.info(keyword, args),
            _ => {}
        }
        ready(Ok(()))
    }
}

struct PaddingParser {
    padding: i32,
}

impl StatusSink for PaddingParser {
    fn status<'a>(&'a mut self, keyword: &'a str, args: &'a str) -> BoxFuture<'a, Result<()>> {
        if keyword == "PADDING" {
            self.padding = leading_int(args);
        }
        ready(Ok(()))
    }
}

struct AttributeParser<'n> {
    name: &'n str,
    value: Option<String>,
}

impl StatusSink for AttributeParser<'_> {
    fn status<'a>(&'a mut self, keyword: &'a str, args: &'a str) -> BoxFuture<'a, Result<()>> {
        if keyword == self.name && self.value.is_none() {
            let plus_decoded = args.replace('+', " ");
            self.value = Some(percent_decode_str(&plus_decoded).decode_utf8_lossy().into_owned());
        }
        ready(Ok(()))
    }
}

#[derive(Default)]
struct CardListParser {
    serials: Vec<String>,
}

impl StatusSink for CardListParser {
    fn status<'a>(&'a mut self, keyword: &'a str, args: &'a str) -> BoxFuture<'a, Result<()>> {
        if keyword != "SERIALNO" {
            return ready(Ok(()));
        }
        let n = hex_run(args);
        if n == 0 || n % 2 != 0 || n != args.len() {
            return ready(Err(ScdError::parameter(format!("malformed card list entry '{args}'"))));
        }
        self.serials.push(args.to_string());
        ready(Ok(()))
    }
}

/// Parse the arguments of a `KEYINFO` status line:
/// `<keygrip> T <serialno> <idstr>`.
pub fn parse_keyinfo(args: &str) -> Result<CardKeyInfo> {
    let malformed = || ScdError::parameter(format!("malformed KEYINFO '{args}'"));

    if hex_run(args) != KEYGRIP_HEX_LEN {
        return Err(malformed());
    }
    let (keygrip, rest) = args.split_at(KEYGRIP_HEX_LEN);
    let rest = rest.trim_start_matches(' ');
    let rest = rest.strip_prefix('T').ok_or_else(malformed)?;
    let rest = rest.trim_start_matches(' ');
    let n = hex_run(rest);
    if n == 0 {
        return Err(malformed());
    }
    let (serialno, rest) = rest.split_at(n);
    let idstr = rest.trim_start_matches(' ');
    if idstr.is_empty() {
        return Err(malformed());
    }
    Ok(CardKeyInfo {
        keygrip: keygrip.to_string(),
        serialno: serialno.to_string(),
        idstr: idstr.to_string(),
    })
}

#[derive(Default)]
struct KeyInfoParser {
    keys: Vec<CardKeyInfo>,
}

impl StatusSink for KeyInfoParser {
    fn status<'a>(&'a mut self, keyword: &'a str, args: &'a str) -> BoxFuture<'a, Result<()>> {
        if keyword == "KEYINFO" {
            match parse_keyinfo(args) {
                Ok(info) => self.keys.push(info),
                Err(e) => return ready(Err(e)),
            }
        }
        ready(Ok(()))
    }
}

/// `SETDATA` lines uploading `data` in chunks that fit the line limit.
fn setdata_lines(data: &[u8]) -> Vec<String> {
    data.chunks(SETDATA_CHUNK)
        .enumerate()
        .map(|(i, chunk)| {
            let hex = hex::encode_upper(chunk);
            if i == 0 {
                format!("SETDATA {hex}")
            } else {
                format!("SETDATA --append {hex}")
            }
        })
        .collect()
}

impl Session {
    /// Serial number of the card, optionally requiring the card with serial
    /// number `demand`.
    pub async fn serialno(&self, demand: Option<&str>) -> Result<String> {
        let command = match demand {
            Some(demand) => format!("SERIALNO --demand={demand}"),
            None => "SERIALNO".to_string(),
        };
        let cache = self.registry().cache();
        let lease = self.acquire().await?;
        let result: Result<String> = async {
            let mut parser = SerialnoParser::default();
            let mut conn = lease.conn().lock().await;
            Transaction::new(command)
                .on_status(&mut parser)
                .run(&mut conn, cache)
                .await?;
            parser.serialno.ok_or(ScdError::NoData)
        }
        .await;
        lease.release(result).await
    }

    /// Have the daemon report everything it knows about the card.
    pub async fn learn(&self, sink: &mut dyn LearnSink) -> Result<()> {
        let cache = self.registry().cache();
        let lease = self.acquire().await?;
        let result: Result<()> = async {
            let mut forwarder = LearnForwarder { sink };
            let mut conn = lease.conn().lock().await;
            Transaction::new("LEARN --force")
                .on_status(&mut forwarder)
                .run(&mut conn, cache)
                .await
        }
        .await;
        lease.release(result).await
    }

    /// Sign `request.data` with the key `request.keyid`.
    pub async fn pksign(&self, request: SignRequest<'_>, prompt: &dyn PinPrompt) -> Result<Vec<u8>> {
        let cache = self.registry().cache();
        let lease = self.acquire().await?;
        let result: Result<Vec<u8>> = async {
            if request.data.len() * 2 + 50 > LINE_LENGTH {
                return Err(ScdError::TooLarge(format!(
                    "{} bytes do not fit into a SETDATA line",
                    request.data.len()
                )));
            }
            let mut conn = lease.conn().lock().await;
            Transaction::new(format!("SETDATA {}", hex::encode_upper(request.data)))
                .run(&mut conn, cache)
                .await?;

            let command = if request.auth {
                format!("PKAUTH {}", request.keyid)
            } else {
                match request.digest {
                    Some(digest) => format!("PKSIGN {} {}", digest.option(), request.keyid),
                    None => format!("PKSIGN {}", request.keyid),
                }
            };
            let mut signature = Vec::new();
            let mut inquiry = NeedPin::new(prompt, request.desc);
            Transaction::new(command)
                .on_data(&mut signature)
                .on_inquiry(&mut inquiry)
                .run(&mut conn, cache)
                .await?;
            Ok(signature)
        }
        .await;
        lease.release(result).await
    }

    /// Decrypt `ciphertext` with the key `keyid`.
    pub async fn pkdecrypt(
        &self,
        keyid: &str,
        ciphertext: &[u8],
        desc: Option<&str>,
        prompt: &dyn PinPrompt,
    ) -> Result<DecryptOutput> {
        let cache = self.registry().cache();
        let lease = self.acquire().await?;
        let result: Result<DecryptOutput> = async {
            let mut conn = lease.conn().lock().await;
            for line in setdata_lines(ciphertext) {
                Transaction::new(line).run(&mut conn, cache).await?;
            }

            let mut plaintext = Zeroizing::new(Vec::new());
            let mut padding = PaddingParser { padding: -1 };
            let mut inquiry = NeedPin::new(prompt, desc);
            Transaction::new(format!("PKDECRYPT {keyid}"))
                .on_data(&mut plaintext)
                .on_status(&mut padding)
                .on_inquiry(&mut inquiry)
                .run(&mut conn, cache)
                .await?;
            Ok(DecryptOutput {
                plaintext,
                padding: padding.padding,
            })
        }
        .await;
        lease.release(result).await
    }

    pub async fn readcert(&self, id: &str) -> Result<Vec<u8>> {
        self.read_object(format!("READCERT {id}")).await
    }

    /// Read the public key `id` as a canonical S-expression.
    pub async fn readkey(&self, id: &str) -> Result<Vec<u8>> {
        let key = self.read_object(format!("READKEY {id}")).await?;
        if canon_len(&key).is_none() {
            debug!("READKEY {id}: returned data is not a canonical S-expression");
            return Err(ScdError::InvalidValue(
                "key is not a canonical S-expression".to_string(),
            ));
        }
        Ok(key)
    }

    async fn read_object(&self, command: String) -> Result<Vec<u8>> {
        let cache = self.registry().cache();
        let lease = self.acquire().await?;
        let result: Result<Vec<u8>> = async {
            let mut data = Vec::new();
            let mut conn = lease.conn().lock().await;
            Transaction::new(command)
                .on_data(&mut data)
                .run(&mut conn, cache)
                .await?;
            Ok(data)
        }
        .await;
        lease.release(result).await
    }

    /// Store `keydata` on the card under `keyref`.
    pub async fn writekey(
        &self,
        keyref: &str,
        force: bool,
        keydata: &[u8],
        prompt: &dyn PinPrompt,
    ) -> Result<()> {
        let command = if force {
            format!("WRITEKEY --force {keyref}")
        } else {
            format!("WRITEKEY {keyref}")
        };
        let cache = self.registry().cache();
        let lease = self.acquire().await?;
        let result: Result<()> = async {
            let mut inquiry = WriteKeyInquiry::new(keydata, NeedPin::new(prompt, None));
            let mut conn = lease.conn().lock().await;
            Transaction::new(command)
                .on_inquiry(&mut inquiry)
                .run(&mut conn, cache)
                .await
        }
        .await;
        lease.release(result).await
    }

    /// Value of the card attribute `name`.
    pub async fn getattr(&self, name: &str) -> Result<String> {
        if name.is_empty() {
            return Err(ScdError::InvalidValue("empty attribute name".to_string()));
        }
        let command = format!("GETATTR {name}");
        if command.len() > MAX_LINE_PAYLOAD {
            return Err(ScdError::TooLarge(format!("attribute name '{name}'")));
        }

        let cache = self.registry().cache();
        let lease = self.acquire().await?;
        let result: Result<String> = async {
            let mut parser = AttributeParser { name, value: None };
            let mut conn = lease.conn().lock().await;
            Transaction::new(command)
                .on_status(&mut parser)
                .run(&mut conn, cache)
                .await?;
            parser.value.ok_or(ScdError::NoData)
        }
        .await;
        lease.release(result).await
    }

    /// Serial numbers of all cards the daemon sees.
    pub async fn cardlist(&self) -> Result<Vec<String>> {
        let cache = self.registry().cache();
        let lease = self.acquire().await?;
        let result: Result<Vec<String>> = async {
            let mut parser = CardListParser::default();
            let mut conn = lease.conn().lock().await;
            Transaction::new("GETINFO card_list")
                .on_status(&mut parser)
                .run(&mut conn, cache)
                .await?;
            Ok(parser.serials)
        }
        .await;
        lease.release(result).await
    }

    /// Keys available on cards, or only the key with `keygrip`.
    pub async fn keyinfo(&self, keygrip: Option<&str>) -> Result<Vec<CardKeyInfo>> {
        let command = format!("KEYINFO {}", keygrip.unwrap_or("--list"));
        let cache = self.registry().cache();
        let lease = self.acquire().await?;
        let result: Result<Vec<CardKeyInfo>> = async {
            let mut parser = KeyInfoParser::default();
            let mut conn = lease.conn().lock().await;
            Transaction::new(command)
                .on_status(&mut parser)
                .run(&mut conn, cache)
                .await?;
            Ok(parser.keys)
        }
        .await;
        lease.release(result).await
    }

    /// Send `line` to the daemon verbatim and relay the whole exchange to
    /// `upstream`. PIN inquiries are answered through `prompt`.
    pub async fn scd(
        &self,
        line: &str,
        prompt: &dyn PinPrompt,
        upstream: &mut dyn Upstream,
    ) -> Result<()> {
        let cache = self.registry().cache();
        let lease = self.acquire().await?;
        let result: Result<()> = async {
            let relay = Mutex::new(upstream);
            let mut status = Forward::new(&relay);
            let mut data = Forward::new(&relay);
            let mut inquiry = NeedPin::new(prompt, None).with_passthrough(&relay);
            let mut conn = lease.conn().lock().await;
            Transaction::new(line)
                .on_data(&mut data)
                .on_status(&mut status)
                .on_inquiry(&mut inquiry)
                .convey_comments()
                .run(&mut conn, cache)
                .await
        }
        .await;
        lease.release(result).await
    }
}
