//! The framed line protocol shared by the director and the controller: a
//! single bidirectional byte stream carrying CRLF-terminated UTF-8 command
//! lines, plus a chunked binary sub-protocol for file transfer.
//!
//! Modeled as a duck-typed capability set (`Proto`) rather than tying every
//! caller to `TcpStream` directly, so the session state machine and its
//! tests can run the identical logic over an in-memory pipe.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Messages are capped well above any real command line; this is a sanity
/// bound, not a protocol negotiation.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// File-transfer keepalive: idle 2s, probe interval 2s, 10 missed probes,
/// so a hung peer is detected within roughly 22s.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(2);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);
const KEEPALIVE_RETRIES: u32 = 10;

/// The capability set a director/controller connection needs: line-oriented
/// command exchange and chunked file transfer. TCP sockets and in-memory
/// pipes both implement it so tests never need a real listener.
#[async_trait]
pub trait Proto: Send {
    async fn send_line(&mut self, line: &str) -> Result<()>;
    async fn recv_line(&mut self) -> Result<String>;
    async fn send_file(&mut self, data: &[u8]) -> Result<()>;
    async fn recv_file(&mut self, dest: &Path) -> Result<()>;
    fn enable_keepalive(&self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Real TCP implementation, used on both the director and controller side of
/// a live connection.
pub struct TcpProto {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    // Kept only so `enable_keepalive` can clone off a `socket2::Socket`
    // sharing the same fd; socket options are fd-level so the clone can be
    // dropped immediately after configuring them.
    std_stream: std::net::TcpStream,
}

impl TcpProto {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let std_stream = stream.into_std().context("converting TcpStream to std for keepalive setup")?;
        let tokio_stream = TcpStream::from_std(std_stream.try_clone()?)?;
        let (read_half, write_half) = tokio_stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            std_stream,
        })
    }
}

#[async_trait]
impl Proto for TcpProto {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        if line.len() > MAX_LINE_LEN {
            bail!("refusing to send oversized line ({} bytes)", line.len());
        }
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv_line(&mut self) -> Result<String> {
        let mut raw = Vec::new();
        let n = self.reader.read_until(b'\n', &mut raw).await?;
        if n == 0 {
            bail!("peer closed the connection");
        }
        while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
            raw.pop();
        }
        if raw.len() > MAX_LINE_LEN {
            bail!("received oversized line ({} bytes)", raw.len());
        }
        String::from_utf8(raw).context("received non-UTF-8 line")
    }

    async fn send_file(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(1024 * 1024) {
            self.writer
                .write_all(format!("{}\r\n", chunk.len()).as_bytes())
                .await?;
            self.writer.write_all(chunk).await?;
        }
        self.writer.write_all(b"0\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv_file(&mut self, dest: &Path) -> Result<()> {
        let tmp = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&tmp).await?;
        loop {
            let header = self.recv_line().await?;
            let count: i64 = header
                .trim()
                .parse()
                .with_context(|| format!("malformed file-transfer frame header {header:?}"))?;
            if count < 0 {
                bail!("rejecting negative frame length {count}");
            }
            if count == 0 {
                break;
            }
            let mut remaining = count as usize;
            let mut buf = vec![0u8; remaining.min(64 * 1024)];
            while remaining > 0 {
                let want = remaining.min(buf.len());
                let got = self.reader.read_exact(&mut buf[..want]).await;
                match got {
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tokio::fs::remove_file(&tmp).await;
                        return Err(anyhow!("short read during file transfer: {e}"));
                    }
                }
                file.write_all(&buf[..want]).await?;
                remaining -= want;
            }
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }

    fn enable_keepalive(&self) -> Result<()> {
        let socket = socket2::Socket::from(self.std_stream.try_clone()?);
        let ka = socket2::TcpKeepalive::new()
            .with_time(KEEPALIVE_IDLE)
            .with_interval(KEEPALIVE_INTERVAL);
        #[cfg(target_os = "linux")]
        let ka = ka.with_retries(KEEPALIVE_RETRIES);
        #[cfg(not(target_os = "linux"))]
        let _ = KEEPALIVE_RETRIES;
        socket.set_tcp_keepalive(&ka)?;
        debug!("keepalive enabled: idle {:?}, interval {:?}", KEEPALIVE_IDLE, KEEPALIVE_INTERVAL);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// In-memory implementation backed by a `tokio::io::duplex` pipe pair, used
/// by tests exercising the session state machine without a real socket.
pub struct ChannelProto {
    reader: BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
}

impl ChannelProto {
    /// Returns a connected pair; `.0` plays the director role, `.1` the
    /// controller role, but either may send or receive.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(MAX_LINE_LEN * 4);
        (Self::from_duplex(a), Self::from_duplex(b))
    }

    fn from_duplex(stream: tokio::io::DuplexStream) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }
}

#[async_trait]
impl Proto for ChannelProto {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv_line(&mut self) -> Result<String> {
        let mut raw = Vec::new();
        let n = self.reader.read_until(b'\n', &mut raw).await?;
        if n == 0 {
            bail!("peer closed the connection");
        }
        while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
            raw.pop();
        }
        String::from_utf8(raw).context("received non-UTF-8 line")
    }

    async fn send_file(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(1024 * 1024) {
            self.writer
                .write_all(format!("{}\r\n", chunk.len()).as_bytes())
                .await?;
            self.writer.write_all(chunk).await?;
        }
        self.writer.write_all(b"0\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv_file(&mut self, dest: &Path) -> Result<()> {
        let tmp = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&tmp).await?;
        loop {
            let header = self.recv_line().await?;
            let count: i64 = header.trim().parse().context("malformed file-transfer header")?;
            if count < 0 {
                bail!("rejecting negative frame length {count}");
            }
            if count == 0 {
                break;
            }
            let mut buf = vec![0u8; count as usize];
            self.reader.read_exact(&mut buf).await?;
            file.write_all(&buf).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }

    fn enable_keepalive(&self) -> Result<()> {
        // No real socket to tune; a no-op that satisfies the capability set.
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// The handshake magic strings exchanged before any other command. The
/// trailing number is the protocol version; a mismatch is fatal on both
/// sides per the command table.
pub const PROTOCOL_VERSION: u32 = 1;
pub const MAGIC_CLIENT_PREFIX: &str = "MLPERF_POWER_CLIENT";
pub const MAGIC_SERVER_PREFIX: &str = "MLPERF_POWER_SERVER";

pub fn magic_client() -> String {
    format!("{MAGIC_CLIENT_PREFIX},{PROTOCOL_VERSION}")
}

pub fn magic_server() -> String {
    format!("{MAGIC_SERVER_PREFIX},{PROTOCOL_VERSION}")
}

/// Parses a received magic line and checks the embedded protocol version.
pub fn check_magic(line: &str, expected_prefix: &str) -> Result<()> {
    let (prefix, version) = line
        .rsplit_once(',')
        .ok_or_else(|| anyhow!("malformed handshake line {line:?}"))?;
    if prefix != expected_prefix {
        bail!("handshake mismatch: expected {expected_prefix:?}, got {prefix:?}");
    }
    let version: u32 = version
        .parse()
        .with_context(|| format!("malformed protocol version in {line:?}"))?;
    if version != PROTOCOL_VERSION {
        bail!("protocol version mismatch: we speak {PROTOCOL_VERSION}, peer speaks {version}");
    }
    Ok(())
}

/// Warns (never fails) when a peer's keepalive setup is skipped because the
/// underlying transport has no real socket, matching [`ChannelProto`]'s
/// no-op above.
pub fn warn_if_unsupported_keepalive(result: &Result<()>) {
    if let Err(e) = result {
        warn!("keepalive not enabled: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn line_round_trip() {
        let (mut a, mut b) = ChannelProto::pair();
        a.send_line("hello,world").await.unwrap();
        let got = b.recv_line().await.unwrap();
        assert_eq!(got, "hello,world");
    }

    #[tokio::test]
    async fn file_round_trip_various_lengths() {
        for len in [0usize, 1, 16 * 1024, 1024 * 1024, 2 * 1024 * 1024 + 1] {
            let (mut a, mut b) = ChannelProto::pair();
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join("out.bin");

            let sender = tokio::spawn(async move {
                a.send_file(&data).await.unwrap();
                data
            });
            b.recv_file(&dest).await.unwrap();
            let sent = sender.await.unwrap();
            let got = tokio::fs::read(&dest).await.unwrap();
            assert_eq!(got, sent, "mismatch at length {len}");
        }
    }

    #[tokio::test]
    async fn negative_frame_length_is_rejected() {
        let (mut a, mut b) = ChannelProto::pair();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let writer = tokio::spawn(async move {
            a.writer.write_all(b"-1\r\n").await.unwrap();
        });
        let result = b.recv_file(&dest).await;
        writer.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn recv_line_reassembles_a_line_split_across_writes() {
        let (mut a, mut b) = ChannelProto::pair();
        // Write the command in two pieces with the CRLF terminator split
        // across the boundary, mimicking a slow or congested sender.
        a.writer.write_all(b"session,demo,start,rang").await.unwrap();
        a.writer.flush().await.unwrap();
        a.writer.write_all(b"ing\r").await.unwrap();
        a.writer.flush().await.unwrap();
        a.writer.write_all(b"\n").await.unwrap();
        a.writer.flush().await.unwrap();

        let got = b.recv_line().await.unwrap();
        assert_eq!(got, "session,demo,start,ranging");
    }

    #[test]
    fn handshake_magic_round_trips() {
        check_magic(&magic_client(), MAGIC_CLIENT_PREFIX).unwrap();
        check_magic(&magic_server(), MAGIC_SERVER_PREFIX).unwrap();
        assert!(check_magic("BOGUS,1", MAGIC_CLIENT_PREFIX).is_err());
        assert!(check_magic(&format!("{MAGIC_CLIENT_PREFIX},99"), MAGIC_CLIENT_PREFIX).is_err());
    }
}
