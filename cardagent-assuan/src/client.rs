// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Client side of the protocol: the role this process plays towards the
//! card daemon.

use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::trace;

use crate::error::{AssuanError, Result};
use crate::line::{Line, encode_data_lines, read_line, write_line};

/// A connection to a protocol server.
pub struct Connection<R, W> {
    reader: R,
    writer: W,
    pid: Option<u32>,
    confidential: bool,
}

/// Connection with the transport erased, as handed out by launchers.
pub type BoxedConnection = Connection<
    Box<dyn AsyncBufRead + Send + Unpin>,
    Box<dyn AsyncWrite + Send + Unpin>,
>;

impl BoxedConnection {
    pub fn boxed<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(Box::new(reader), Box::new(writer))
    }
}

impl<R, W> Connection<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            pid: None,
            confidential: false,
        }
    }

    /// Remember the process id of the server behind this connection.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Consume the server greeting.
    pub async fn handshake(&mut self) -> Result<()> {
        loop {
            match self.read_response().await? {
                Line::Ok(_) => return Ok(()),
                Line::Err { code, description } => {
                    return Err(AssuanError::Server { code, description });
                }
                Line::Comment(_) => continue,
                other => {
                    return Err(AssuanError::Unexpected(format!(
                        "{} line instead of greeting",
                        other.kind()
                    )));
                }
            }
        }
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        trace!("-> {line}");
        write_line(&mut self.writer, line).await
    }

    /// Read the next line from the server.
    pub async fn read_response(&mut self) -> Result<Line> {
        let raw = read_line(&mut self.reader).await?.ok_or(AssuanError::Eof)?;
        let line = Line::parse(&raw)?;
        match &line {
            Line::Data(data) => trace!("<- D [{} bytes]", data.len()),
            _ => trace!("<- {}", String::from_utf8_lossy(&raw)),
        }
        Ok(line)
    }

    /// Send `data` as `D` lines. Nothing is sent for empty data.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        for line in encode_data_lines(data) {
            if self.confidential {
                trace!("-> [confidential data hidden]");
            } else {
                trace!("-> {line}");
            }
            write_line(&mut self.writer, &line).await?;
        }
        Ok(())
    }

    pub async fn send_end(&mut self) -> Result<()> {
        self.write_line("END").await
    }

    pub async fn send_cancel(&mut self) -> Result<()> {
        self.write_line("CAN").await
    }

    /// Stop logging outgoing data until [`Self::end_confidential`].
    pub fn begin_confidential(&mut self) {
        self.confidential = true;
    }

    pub fn end_confidential(&mut self) {
        self.confidential = false;
    }

    pub fn is_confidential(&self) -> bool {
        self.confidential
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex, split};

    fn pair() -> (
        BoxedConnection,
        BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (client, server) = duplex(4096);
        let (cr, cw) = split(client);
        let (sr, sw) = split(server);
        (
            BoxedConnection::boxed(BufReader::new(cr), cw),
            BufReader::new(sr),
            sw,
        )
    }

    #[tokio::test]
    async fn handshake_skips_comments() {
        let (mut conn, _sr, mut sw) = pair();
        sw.write_all(b"# starting\nOK Pleased to meet you\n")
            .await
            .unwrap();
        conn.handshake().await.unwrap();
    }

    #[tokio::test]
    async fn handshake_surfaces_server_error() {
        let (mut conn, _sr, mut sw) = pair();
        sw.write_all(b"ERR 1 not today\n").await.unwrap();
        match conn.handshake().await {
            Err(AssuanError::Server { code, description }) => {
                assert_eq!(code, 1);
                assert_eq!(description, "not today");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_is_reported() {
        let (mut conn, sr, sw) = pair();
        drop(sr);
        drop(sw);
        assert!(matches!(conn.read_response().await, Err(AssuanError::Eof)));
    }

    #[tokio::test]
    async fn sends_data_and_end() {
        let (mut conn, sr, _sw) = pair();
        conn.begin_confidential();
        conn.send_data(b"1234").await.unwrap();
        conn.end_confidential();
        conn.send_end().await.unwrap();
        assert!(!conn.is_confidential());

        let mut lines = sr.lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "D 1234");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "END");
    }

    #[tokio::test]
    async fn command_exchange_against_mock() {
        let reader = tokio_test::io::Builder::new()
            .read(b"OK Pleased to meet you\n")
            .read(b"S SERIALNO D2760001240102\nOK\n")
            .build();
        let writer = tokio_test::io::Builder::new()
            .write(b"SERIALNO\n")
            .build();
        let mut conn = Connection::new(BufReader::new(reader), writer);

        conn.handshake().await.unwrap();
        conn.write_line("SERIALNO").await.unwrap();
        assert_eq!(
            conn.read_response().await.unwrap(),
            Line::Status {
                keyword: "SERIALNO".to_string(),
                args: "D2760001240102".to_string()
            }
        );
        assert_eq!(conn.read_response().await.unwrap(), Line::Ok(String::new()));
    }

    #[test]
    fn pid_is_recorded() {
        let (conn, _sr, _sw) = pair();
        assert_eq!(conn.pid(), None);
        assert_eq!(conn.with_pid(42).pid(), Some(42));
    }
}
