// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Inquiry policies: answer locally through a PIN prompt, upload
//! caller-supplied key material, or relay to an upstream caller.

use cardagent_assuan::Responder;
use futures::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::error;
use zeroize::Zeroizing;

use crate::error::{Result, ScdError};
use crate::transaction::{DataSink, InquiryHandler, InquiryReply, StatusSink};

/// Buffer size the daemon allots for a PIN, including the terminator.
pub const MAX_PIN_LEN: usize = 90;

/// Upper bound for inquiry answers relayed from an upstream caller.
pub const MAX_PASSTHROUGH_INQUIRY: usize = 8096;

/// Asks the user for PINs and shows pinpad notices.
pub trait PinPrompt: Send + Sync {
    /// Ask for a PIN of at most `max_len` bytes. `info` is the daemon's
    /// prompt text, `desc` the description supplied with the command.
    fn get_pin<'a>(
        &'a self,
        desc: Option<&'a str>,
        info: &'a str,
        max_len: usize,
    ) -> BoxFuture<'a, Result<SecretString>>;

    /// The PIN is being entered on the reader's pinpad.
    fn show_pinpad<'a>(&'a self, desc: Option<&'a str>, info: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Pinpad entry has finished.
    fn dismiss_pinpad(&self) -> BoxFuture<'_, Result<()>>;
}

/// The caller a raw command is relayed to.
pub trait Upstream: Send {
    fn status<'a>(&'a mut self, keyword: &'a str, args: &'a str) -> BoxFuture<'a, Result<()>>;

    fn comment<'a>(&'a mut self, text: &'a str) -> BoxFuture<'a, Result<()>>;

    fn data<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Forward an inquiry and collect at most `max_len` bytes of answer.
    fn inquire<'a>(
        &'a mut self,
        line: &'a str,
        max_len: usize,
    ) -> BoxFuture<'a, Result<Zeroizing<Vec<u8>>>>;

    fn set_confidential(&mut self, confidential: bool);

    fn is_confidential(&self) -> bool;
}

impl<R, W> Upstream for Responder<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn status<'a>(&'a mut self, keyword: &'a str, args: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.write_status(keyword, args).await.map_err(ScdError::from) })
    }

    fn comment<'a>(&'a mut self, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.write_comment(text).await.map_err(ScdError::from) })
    }

    fn data<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.send_data(chunk).await.map_err(ScdError::from) })
    }

    fn inquire<'a>(
        &'a mut self,
        line: &'a str,
        max_len: usize,
    ) -> BoxFuture<'a, Result<Zeroizing<Vec<u8>>>> {
        Box::pin(async move {
            Responder::inquire(self, line, max_len)
                .await
                .map(Zeroizing::new)
                .map_err(ScdError::from)
        })
    }

    fn set_confidential(&mut self, confidential: bool) {
        Responder::set_confidential(self, confidential);
    }

    fn is_confidential(&self) -> bool {
        Responder::is_confidential(self)
    }
}

/// General inquiry dispatcher used by every card operation.
pub struct NeedPin<'a, 'u> {
    prompt: &'a dyn PinPrompt,
    desc: Option<&'a str>,
    passthrough: Option<&'a Mutex<&'u mut dyn Upstream>>,
}

impl<'a, 'u> NeedPin<'a, 'u> {
    pub fn new(prompt: &'a dyn PinPrompt, desc: Option<&'a str>) -> Self {
        Self {
            prompt,
            desc,
            passthrough: None,
        }
    }

    /// Relay unrecognised inquiries to `upstream`.
    pub fn with_passthrough(mut self, upstream: &'a Mutex<&'u mut dyn Upstream>) -> Self {
        self.passthrough = Some(upstream);
        self
    }

    async fn dispatch(&self, keyword: &str, args: &str) -> Result<InquiryReply> {
        match keyword {
            "NEEDPIN" => {
                let pin = self.prompt.get_pin(self.desc, args, MAX_PIN_LEN).await?;
                let pin = pin.expose_secret().as_bytes();
                if pin.len() >= MAX_PIN_LEN {
                    return Err(ScdError::TooLarge(format!(
                        "PIN longer than {} bytes",
                        MAX_PIN_LEN - 1
                    )));
                }
                Ok(InquiryReply::secret(Zeroizing::new(pin.to_vec())))
            }
            "POPUPPINPADPROMPT" => {
                self.prompt.show_pinpad(self.desc, args).await?;
                Ok(InquiryReply::empty())
            }
            "DISMISSPINPADPROMPT" => {
                self.prompt.dismiss_pinpad().await?;
                Ok(InquiryReply::empty())
            }
            // Answered empty; the cache is filled through PINCACHE_PUT only.
            "PINCACHE_GET" => Ok(InquiryReply::empty()),
            _ => match self.passthrough {
                Some(upstream) => self.relay(upstream, keyword, args).await,
                None => {
                    error!("unsupported inquiry '{keyword}'");
                    Err(ScdError::UnknownInquiry(keyword.to_string()))
                }
            },
        }
    }

    async fn relay(
        &self,
        upstream: &Mutex<&'u mut dyn Upstream>,
        keyword: &str,
        args: &str,
    ) -> Result<InquiryReply> {
        let line = if args.is_empty() {
            keyword.to_string()
        } else {
            format!("{keyword} {args}")
        };
        let sensitive = keyword == "KEYDATA";

        let mut upstream = upstream.lock().await;
        let toggle = sensitive && !upstream.is_confidential();
        if toggle {
            upstream.set_confidential(true);
        }
        let answer = upstream.inquire(&line, MAX_PASSTHROUGH_INQUIRY).await;
        if toggle {
            upstream.set_confidential(false);
        }

        match answer {
            Ok(data) if sensitive => Ok(InquiryReply::secret(data)),
            Ok(data) => Ok(InquiryReply {
                data,
                confidential: false,
            }),
            Err(e) => {
                error!("error forwarding inquiry '{line}': {e}");
                Err(e)
            }
        }
    }
}

impl InquiryHandler for NeedPin<'_, '_> {
    fn inquire<'a>(
        &'a mut self,
        keyword: &'a str,
        args: &'a str,
    ) -> BoxFuture<'a, Result<InquiryReply>> {
        Box::pin(self.dispatch(keyword, args))
    }
}

/// Answers `KEYDATA` with key material held by the caller and defers
/// every other inquiry to [`NeedPin`].
pub struct WriteKeyInquiry<'a, 'u> {
    keydata: &'a [u8],
    fallback: NeedPin<'a, 'u>,
}

impl<'a, 'u> WriteKeyInquiry<'a, 'u> {
    pub fn new(keydata: &'a [u8], fallback: NeedPin<'a, 'u>) -> Self {
        Self { keydata, fallback }
    }
}

impl InquiryHandler for WriteKeyInquiry<'_, '_> {
    fn inquire<'a>(
        &'a mut self,
        keyword: &'a str,
        args: &'a str,
    ) -> BoxFuture<'a, Result<InquiryReply>> {
        if keyword == "KEYDATA" {
            let reply = InquiryReply::secret(Zeroizing::new(self.keydata.to_vec()));
            Box::pin(async move { Ok(reply) })
        } else {
            Box::pin(self.fallback.dispatch(keyword, args))
        }
    }
}

/// Forwards status, comment and data lines of a relayed command upstream.
pub struct Forward<'a, 'u> {
    upstream: &'a Mutex<&'u mut dyn Upstream>,
}

impl<'a, 'u> Forward<'a, 'u> {
    pub fn new(upstream: &'a Mutex<&'u mut dyn Upstream>) -> Self {
        Self { upstream }
    }
}

impl StatusSink for Forward<'_, '_> {
    fn status<'a>(&'a mut self, keyword: &'a str, args: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.upstream.lock().await.status(keyword, args).await })
    }

    fn comment<'a>(&'a mut self, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.upstream.lock().await.comment(text).await })
    }
}

impl DataSink for Forward<'_, '_> {
    fn data<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.upstream.lock().await.data(chunk).await })
    }
}
