// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Line framing for the card daemon protocol.
//!
//! Every protocol message is a single LF-terminated line of at most
//! [`LINE_LENGTH`] bytes. Binary payloads travel in `D` lines with `%`,
//! control characters and non-ASCII bytes percent-escaped.

use percent_encoding::{AsciiSet, CONTROLS, percent_decode, percent_encode};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AssuanError, IoErrorContext, Result};

/// Maximum length of a protocol line including the terminating LF.
pub const LINE_LENGTH: usize = 1002;

/// Maximum number of characters before the line terminator.
pub const MAX_LINE_PAYLOAD: usize = LINE_LENGTH - 2;

const DATA_ESCAPE: &AsciiSet = &CONTROLS.add(b'%');

/// One parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Ok(String),
    Err { code: u32, description: String },
    Status { keyword: String, args: String },
    Data(Vec<u8>),
    Inquire { keyword: String, args: String },
    Comment(String),
    End,
    Cancel,
}

impl Line {
    /// Parse a line with the terminator already removed.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if let Some(data) = strip_verb(raw, b"D") {
            return Ok(Line::Data(decode_data(data)));
        }

        let text = String::from_utf8_lossy(raw);
        if let Some(rest) = text.strip_prefix('#') {
            return Ok(Line::Comment(rest.trim_start().to_string()));
        }

        let (verb, rest) = match text.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim_start()),
            None => (text.as_ref(), ""),
        };
        match verb {
            "OK" => Ok(Line::Ok(rest.to_string())),
            "ERR" => {
                let (code, description) = rest.split_once(' ').unwrap_or((rest, ""));
                let code = code
                    .parse()
                    .map_err(|_| AssuanError::InvalidLine(text.to_string()))?;
                Ok(Line::Err {
                    code,
                    description: description.trim_start().to_string(),
                })
            }
            "S" if !rest.is_empty() => {
                let (keyword, args) = split_keyword(rest);
                Ok(Line::Status { keyword, args })
            }
            "INQUIRE" if !rest.is_empty() => {
                let (keyword, args) = split_keyword(rest);
                Ok(Line::Inquire { keyword, args })
            }
            "END" if rest.is_empty() => Ok(Line::End),
            "CAN" if rest.is_empty() => Ok(Line::Cancel),
            _ => Err(AssuanError::InvalidLine(text.to_string())),
        }
    }

    /// Short tag for logging without exposing payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Line::Ok(_) => "OK",
            Line::Err { .. } => "ERR",
            Line::Status { .. } => "S",
            Line::Data(_) => "D",
            Line::Inquire { .. } => "INQUIRE",
            Line::Comment(_) => "#",
            Line::End => "END",
            Line::Cancel => "CAN",
        }
    }
}

fn strip_verb<'a>(raw: &'a [u8], verb: &[u8]) -> Option<&'a [u8]> {
    let rest = raw.strip_prefix(verb)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix(b" ")
    }
}

/// Split `KEYWORD args...` at the first space, skipping blanks before the args.
pub fn split_keyword(rest: &str) -> (String, String) {
    match rest.split_once(' ') {
        Some((keyword, args)) => (keyword.to_string(), args.trim_start_matches(' ').to_string()),
        None => (rest.to_string(), String::new()),
    }
}

pub fn decode_data(escaped: &[u8]) -> Vec<u8> {
    percent_decode(escaped).collect()
}

fn escaped_len(byte: u8) -> usize {
    if byte == b'%' || byte.is_ascii_control() || !byte.is_ascii() {
        3
    } else {
        1
    }
}

/// Encode `data` as a sequence of `D` lines, each fitting the line limit.
pub fn encode_data_lines(data: &[u8]) -> Vec<String> {
    let budget = MAX_LINE_PAYLOAD - 2;
    let mut lines = Vec::new();
    let mut start = 0;
    while start < data.len() {
        let mut end = start;
        let mut used = 0;
        while end < data.len() && used + escaped_len(data[end]) <= budget {
            used += escaped_len(data[end]);
            end += 1;
        }
        lines.push(format!("D {}", percent_encode(&data[start..end], DATA_ESCAPE)));
        start = end;
    }
    lines
}

/// Read one line, without its terminator.
///
/// Returns `Ok(None)` on a clean end of stream.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    (&mut *reader)
        .take(LINE_LENGTH as u64)
        .read_until(b'\n', &mut buf)
        .await
        .io_context(|| "Failed to read protocol line".to_string())?;

    if buf.is_empty() {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() >= LINE_LENGTH {
            return Err(AssuanError::LineTooLong {
                length: buf.len(),
                max: LINE_LENGTH,
            });
        }
        return Err(AssuanError::Eof);
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if buf.len() > MAX_LINE_PAYLOAD {
        return Err(AssuanError::LineTooLong {
            length: buf.len(),
            max: MAX_LINE_PAYLOAD,
        });
    }
    Ok(Some(buf))
}

/// Write one line and flush it.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if line.contains(['\n', '\r']) {
        return Err(AssuanError::InvalidLine(line.escape_debug().to_string()));
    }
    if line.len() > MAX_LINE_PAYLOAD {
        return Err(AssuanError::LineTooLong {
            length: line.len(),
            max: MAX_LINE_PAYLOAD,
        });
    }

    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    writer
        .write_all(&buf)
        .await
        .io_context(|| "Failed to write protocol line".to_string())?;
    writer
        .flush()
        .await
        .io_context(|| "Failed to flush protocol line".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::ok_bare("OK", Line::Ok(String::new()))]
    #[case::ok_text("OK Pleased to meet you", Line::Ok("Pleased to meet you".into()))]
    #[case::err("ERR 100663404 Card error", Line::Err { code: 100663404, description: "Card error".into() })]
    #[case::err_no_text("ERR 42", Line::Err { code: 42, description: String::new() })]
    #[case::status("S SERIALNO D2760001240102000005000012340000", Line::Status { keyword: "SERIALNO".into(), args: "D2760001240102000005000012340000".into() })]
    #[case::status_no_args("S PROGRESS", Line::Status { keyword: "PROGRESS".into(), args: String::new() })]
    #[case::status_spaces("S KEYPAIRINFO   ABC OPENPGP.1", Line::Status { keyword: "KEYPAIRINFO".into(), args: "ABC OPENPGP.1".into() })]
    #[case::inquire("INQUIRE NEEDPIN ||Please enter the PIN", Line::Inquire { keyword: "NEEDPIN".into(), args: "||Please enter the PIN".into() })]
    #[case::comment("# debug output", Line::Comment("debug output".into()))]
    #[case::end("END", Line::End)]
    #[case::cancel("CAN", Line::Cancel)]
    #[case::data_empty("D", Line::Data(Vec::new()))]
    #[case::data_escaped("D a%25b%0Ac", Line::Data(b"a%b\nc".to_vec()))]
    fn parses_lines(#[case] raw: &str, #[case] expected: Line) {
        assert_eq!(Line::parse(raw.as_bytes()).unwrap(), expected);
    }

    #[rstest]
    #[case::unknown_verb("HELLO world")]
    #[case::status_without_keyword("S")]
    #[case::bad_err_code("ERR abc text")]
    #[case::end_with_args("END now")]
    #[case::glued_verb("OKAY")]
    fn rejects_invalid_lines(#[case] raw: &str) {
        assert!(matches!(
            Line::parse(raw.as_bytes()),
            Err(AssuanError::InvalidLine(_))
        ));
    }

    #[test]
    fn data_lines_escape_specials() {
        let lines = encode_data_lines(b"50% off\r\n\xff");
        assert_eq!(lines, vec!["D 50%25 off%0D%0A%FF".to_string()]);
    }

    #[test]
    fn data_lines_respect_line_limit() {
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let lines = encode_data_lines(&data);
        assert!(lines.len() > 1);
        let mut decoded = Vec::new();
        for line in &lines {
            assert!(line.len() <= MAX_LINE_PAYLOAD);
            match Line::parse(line.as_bytes()).unwrap() {
                Line::Data(chunk) => decoded.extend(chunk),
                other => panic!("unexpected line {other:?}"),
            }
        }
        assert_eq!(decoded, data);
    }

    #[test]
    fn no_data_lines_for_empty_input() {
        assert!(encode_data_lines(b"").is_empty());
    }

    #[tokio::test]
    async fn read_line_strips_terminators() {
        let mut input: &[u8] = b"OK hello\r\nS PROGRESS\n";
        assert_eq!(read_line(&mut input).await.unwrap().unwrap(), b"OK hello");
        assert_eq!(read_line(&mut input).await.unwrap().unwrap(), b"S PROGRESS");
        assert!(read_line(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_line_rejects_overlong_input() {
        let long = format!("D {}\n", "x".repeat(LINE_LENGTH));
        let mut input = long.as_bytes();
        assert!(matches!(
            read_line(&mut input).await,
            Err(AssuanError::LineTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn read_line_matches_write_limit() {
        let fits = format!("{}\n", "x".repeat(MAX_LINE_PAYLOAD));
        let mut input = fits.as_bytes();
        assert_eq!(
            read_line(&mut input).await.unwrap().unwrap().len(),
            MAX_LINE_PAYLOAD
        );

        let one_over = format!("{}\n", "x".repeat(MAX_LINE_PAYLOAD + 1));
        let mut input = one_over.as_bytes();
        assert!(matches!(
            read_line(&mut input).await,
            Err(AssuanError::LineTooLong { length: 1001, .. })
        ));
    }

    #[tokio::test]
    async fn read_line_reports_truncated_line() {
        let mut input: &[u8] = b"OK no newline";
        assert!(matches!(read_line(&mut input).await, Err(AssuanError::Eof)));
    }

    #[tokio::test]
    async fn write_line_enforces_limit() {
        let mut out = Vec::new();
        let fits = "x".repeat(MAX_LINE_PAYLOAD);
        write_line(&mut out, &fits).await.unwrap();
        assert_eq!(out.len(), MAX_LINE_PAYLOAD + 1);

        let too_long = "x".repeat(MAX_LINE_PAYLOAD + 1);
        assert!(matches!(
            write_line(&mut out, &too_long).await,
            Err(AssuanError::LineTooLong { .. })
        ));
        assert!(matches!(
            write_line(&mut out, "OK\nERR").await,
            Err(AssuanError::InvalidLine(_))
        ));
    }
}
