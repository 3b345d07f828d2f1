// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Server side of the protocol, used when relaying a daemon exchange to an
//! upstream caller.

use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, trace};

use crate::error::{AssuanError, Result};
use crate::line::{Line, encode_data_lines, read_line, write_line};

/// Answers an upstream caller over a pair of streams.
pub struct Responder<R, W> {
    reader: R,
    writer: W,
    confidential: bool,
}

impl<R, W> Responder<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            confidential: false,
        }
    }

    async fn write(&mut self, line: &str) -> Result<()> {
        trace!("=> {line}");
        write_line(&mut self.writer, line).await
    }

    pub async fn write_status(&mut self, keyword: &str, args: &str) -> Result<()> {
        if args.is_empty() {
            self.write(&format!("S {keyword}")).await
        } else {
            self.write(&format!("S {keyword} {args}")).await
        }
    }

    pub async fn write_comment(&mut self, text: &str) -> Result<()> {
        self.write(&format!("# {text}")).await
    }

    pub async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        for line in encode_data_lines(data) {
            write_line(&mut self.writer, &line).await?;
        }
        Ok(())
    }

    pub async fn write_ok(&mut self, text: Option<&str>) -> Result<()> {
        match text {
            Some(text) => self.write(&format!("OK {text}")).await,
            None => self.write("OK").await,
        }
    }

    pub async fn write_err(&mut self, code: u32, description: &str) -> Result<()> {
        self.write(&format!("ERR {code} {description}")).await
    }

    /// Ask the upstream caller for data.
    ///
    /// Collects `D` lines until `END`. More than `max_len` bytes fail with
    /// [`AssuanError::TooMuchData`] once the caller has finished sending.
    pub async fn inquire(&mut self, line: &str, max_len: usize) -> Result<Vec<u8>> {
        self.write(&format!("INQUIRE {line}")).await?;

        let mut data = Vec::new();
        let mut overflow = false;
        loop {
            let raw = read_line(&mut self.reader)
                .await?
                .ok_or(AssuanError::Eof)?;
            match Line::parse(&raw)? {
                Line::Data(chunk) => {
                    if self.confidential {
                        trace!("<= [confidential data hidden]");
                    } else {
                        trace!("<= D [{} bytes]", chunk.len());
                    }
                    if overflow || data.len() + chunk.len() > max_len {
                        overflow = true;
                    } else {
                        data.extend_from_slice(&chunk);
                    }
                }
                Line::End => break,
                Line::Cancel => {
                    debug!("inquiry cancelled by caller");
                    return Err(AssuanError::Cancelled);
                }
                Line::Comment(_) => continue,
                other => {
                    return Err(AssuanError::Unexpected(format!(
                        "{} line during inquiry",
                        other.kind()
                    )));
                }
            }
        }

        if overflow {
            return Err(AssuanError::TooMuchData { max: max_len });
        }
        Ok(data)
    }

    pub fn set_confidential(&mut self, confidential: bool) {
        self.confidential = confidential;
    }

    pub fn is_confidential(&self) -> bool {
        self.confidential
    }
}
