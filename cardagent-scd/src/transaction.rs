// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! A single command exchange with the daemon.
//!
//! [`Transaction`] writes one command line and then drives the exchange
//! until the daemon's final `OK` or `ERR`, routing data lines, status lines
//! and inquiries to whichever sinks the caller attached. `PINCACHE_PUT`
//! status lines are always consumed here and never reach a sink.

use cardagent_assuan::{AssuanError, BoxedConnection, Line};
use futures::future::BoxFuture;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{Result, ScdError};
use crate::pincache::{PinCache, handle_pincache_put};

/// Receives the response payload of a command.
pub trait DataSink: Send {
    fn data<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, Result<()>>;
}

/// Receives status lines, and comment lines when the transaction conveys
/// them.
pub trait StatusSink: Send {
    fn status<'a>(&'a mut self, keyword: &'a str, args: &'a str) -> BoxFuture<'a, Result<()>>;

    fn comment<'a>(&'a mut self, _text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Answers inquiries the daemon raises while a command runs.
pub trait InquiryHandler: Send {
    fn inquire<'a>(&'a mut self, keyword: &'a str, args: &'a str)
    -> BoxFuture<'a, Result<InquiryReply>>;
}

/// Data returned to the daemon for an inquiry.
pub struct InquiryReply {
    pub data: Zeroizing<Vec<u8>>,
    /// Keep the data out of protocol traces
    pub confidential: bool,
}

impl InquiryReply {
    /// Answer with `END` only.
    pub fn empty() -> Self {
        Self {
            data: Zeroizing::new(Vec::new()),
            confidential: false,
        }
    }

    pub fn plain(data: Vec<u8>) -> Self {
        Self {
            data: Zeroizing::new(data),
            confidential: false,
        }
    }

    pub fn secret(data: Zeroizing<Vec<u8>>) -> Self {
        Self {
            data,
            confidential: true,
        }
    }
}

impl DataSink for Vec<u8> {
    fn data<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        self.extend_from_slice(chunk);
        Box::pin(async { Ok(()) })
    }
}

impl DataSink for Zeroizing<Vec<u8>> {
    fn data<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        self.extend_from_slice(chunk);
        Box::pin(async { Ok(()) })
    }
}

/// Builder for one command exchange.
pub struct Transaction<'a> {
    command: String,
    data: Option<&'a mut dyn DataSink>,
    status: Option<&'a mut dyn StatusSink>,
    inquiry: Option<&'a mut dyn InquiryHandler>,
    comments: bool,
}

impl<'a> Transaction<'a> {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            data: None,
            status: None,
            inquiry: None,
            comments: false,
        }
    }

    pub fn on_data(mut self, sink: &'a mut dyn DataSink) -> Self {
        self.data = Some(sink);
        self
    }

    pub fn on_status(mut self, sink: &'a mut dyn StatusSink) -> Self {
        self.status = Some(sink);
        self
    }

    pub fn on_inquiry(mut self, handler: &'a mut dyn InquiryHandler) -> Self {
        self.inquiry = Some(handler);
        self
    }

    /// Hand comment lines to the status sink.
    pub fn convey_comments(mut self) -> Self {
        self.comments = true;
        self
    }

    /// Run the exchange to completion.
    ///
    /// When a sink or inquiry handler fails, the rest of the exchange is
    /// still read so the connection stays usable, and the first failure
    /// is returned.
    pub async fn run(self, conn: &mut BoxedConnection, cache: &dyn PinCache) -> Result<()> {
        let Transaction {
            command,
            mut data,
            mut status,
            mut inquiry,
            comments,
        } = self;

        conn.write_line(&command).await?;

        let mut failure: Option<ScdError> = None;
        loop {
            match conn.read_response().await? {
                Line::Ok(_) => {
                    return match failure {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
                Line::Err { code, description } => {
                    let server = ScdError::Assuan(AssuanError::Server { code, description });
                    return Err(failure.unwrap_or(server));
                }
                Line::Status { keyword, args } if keyword == "PINCACHE_PUT" => {
                    handle_pincache_put(cache, &args);
                }
                Line::Status { keyword, args } => {
                    if failure.is_none()
                        && let Some(sink) = status.as_deref_mut()
                        && let Err(e) = sink.status(&keyword, &args).await
                    {
                        failure = Some(e);
                    }
                }
                Line::Comment(text) => {
                    if comments
                        && failure.is_none()
                        && let Some(sink) = status.as_deref_mut()
                        && let Err(e) = sink.comment(&text).await
                    {
                        failure = Some(e);
                    }
                }
                Line::Data(chunk) => {
                    if failure.is_some() {
                        continue;
                    }
                    match data.as_deref_mut() {
                        Some(sink) => {
                            if let Err(e) = sink.data(&chunk).await {
                                failure = Some(e);
                            }
                        }
                        None => {
                            warn!("{command}: data line without a data sink");
                            failure = Some(ScdError::Assuan(AssuanError::Unexpected(
                                "data line without a data sink".to_string(),
                            )));
                        }
                    }
                }
                Line::Inquire { keyword, args } => {
                    if failure.is_some() {
                        conn.send_cancel().await?;
                        continue;
                    }
                    let Some(handler) = inquiry.as_deref_mut() else {
                        debug!("{command}: no handler for inquiry {keyword}");
                        conn.send_end().await?;
                        failure = Some(ScdError::UnknownInquiry(keyword));
                        continue;
                    };
                    match handler.inquire(&keyword, &args).await {
                        Ok(reply) => {
                            if reply.confidential {
                                conn.begin_confidential();
                            }
                            let sent = conn.send_data(&reply.data).await;
                            conn.end_confidential();
                            sent?;
                            conn.send_end().await?;
                        }
                        Err(e) => {
                            debug!("{command}: inquiry {keyword} failed: {e}");
                            conn.send_cancel().await?;
                            failure = Some(e);
                        }
                    }
                }
                other @ (Line::End | Line::Cancel) => {
                    return Err(ScdError::Assuan(AssuanError::Unexpected(format!(
                        "{} line from daemon",
                        other.kind()
                    ))));
                }
            }
        }
    }
}
