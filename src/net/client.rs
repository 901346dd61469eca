//! Client side of the control protocol.
//!
//! Used by the `ctl` subcommand and by tests. The protocol is plain lines,
//! so the client is little more than a buffered reader and a writer with a
//! drain helper for "read whatever the server has to say right now".

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Sends one command line.
    pub async fn send(&mut self, line: &str) -> io::Result<()> {
        let mut line = line.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await
    }

    /// Next broadcast line, or `None` once the server closed the session.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end().to_string()))
    }

    /// Reads lines until the server has been silent for `idle`, or the
    /// session ends. Returns everything received.
    pub async fn drain_for(&mut self, idle: Duration) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            match tokio::time::timeout(idle, self.next_line()).await {
                Ok(Ok(Some(line))) => lines.push(line),
                Ok(Ok(None)) => break,
                Ok(Err(err)) => return Err(err),
                Err(_) => break,
            }
        }
        Ok(lines)
    }
}
