//! RCON protocol client for game-server consoles.
//!
//! Little-endian framing: `size | id | type | body | 0x00 0x00`, where
//! `size` counts everything after itself. Authentication failure is
//! signalled by a response id of -1.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const PACKET_TYPE_AUTH: i32 = 3;
pub const PACKET_TYPE_COMMAND: i32 = 2;
pub const PACKET_TYPE_RESPONSE: i32 = 0;

/// id + type + two NUL terminators.
const PACKET_OVERHEAD: usize = 10;

/// Upper bound on a peer packet; anything larger is a protocol error.
const MAX_PACKET_SIZE: i32 = 4096;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
        }
    }

    /// Full wire encoding, including the size prefix.
    pub fn encode(&self) -> Vec<u8> {
        let size = (PACKET_OVERHEAD + self.body.len()) as i32;
        let mut buf = Vec::with_capacity(4 + size as usize);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(self.body.as_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    /// Decode a packet payload (everything after the size prefix).
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < PACKET_OVERHEAD {
            bail!("rcon packet too short: {} bytes", data.len());
        }
        let id = i32::from_le_bytes(data[0..4].try_into().expect("4-byte slice"));
        let kind = i32::from_le_bytes(data[4..8].try_into().expect("4-byte slice"));
        let body = String::from_utf8_lossy(&data[8..data.len() - 2]).into_owned();
        Ok(Self { id, kind, body })
    }
}

pub struct RconClient {
    addr: String,
    password: String,
    conn: Option<TcpStream>,
}

impl RconClient {
    pub fn new(host: &str, port: u16, password: &str) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            password: password.to_string(),
            conn: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Connect and authenticate.
    pub async fn connect(&mut self) -> Result<()> {
        let conn = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .context("rcon connect timed out")?
            .with_context(|| format!("connect to rcon server {}", self.addr))?;
        self.conn = Some(conn);
        info!(addr = %self.addr, "connected to rcon server");

        self.send_packet(&Packet::new(1, PACKET_TYPE_AUTH, self.password.clone()))
            .await?;
        let response = self.read_packet().await?;
        if response.id == -1 {
            self.conn = None;
            bail!("authentication failed: invalid password");
        }

        debug!(addr = %self.addr, "rcon authentication successful");
        Ok(())
    }

    /// Send a command and return the server's response body.
    pub async fn execute(&mut self, command: &str) -> Result<String> {
        if self.conn.is_none() {
            bail!("not connected");
        }

        self.send_packet(&Packet::new(2, PACKET_TYPE_COMMAND, command))
            .await?;
        let response = self.read_packet().await?;
        Ok(response.body)
    }

    pub fn disconnect(&mut self) {
        self.conn = None;
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let conn = self.conn.as_mut().context("not connected")?;
        tokio::time::timeout(IO_TIMEOUT, conn.write_all(&packet.encode()))
            .await
            .context("rcon write timed out")?
            .context("write rcon packet")
    }

    async fn read_packet(&mut self) -> Result<Packet> {
        let conn = self.conn.as_mut().context("not connected")?;

        let size = tokio::time::timeout(IO_TIMEOUT, conn.read_i32_le())
            .await
            .context("rcon read timed out")?
            .context("read rcon packet size")?;
        if size < PACKET_OVERHEAD as i32 || size > MAX_PACKET_SIZE {
            bail!("invalid rcon packet size: {size}");
        }

        let mut data = vec![0u8; size as usize];
        tokio::time::timeout(IO_TIMEOUT, conn.read_exact(&mut data))
            .await
            .context("rcon read timed out")?
            .context("read rcon packet body")?;

        Packet::decode(&data)
    }
}

/// One lazily-connected RCON client per workload.
#[derive(Default)]
pub struct RconPool {
    clients: Mutex<HashMap<String, Arc<Mutex<RconClient>>>>,
}

impl RconPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute a command against a workload's RCON endpoint, connecting
    /// on first use. A failed exchange drops the connection so the next
    /// call reconnects.
    pub async fn execute(
        &self,
        server_id: &str,
        host: &str,
        port: u16,
        password: &str,
        command: &str,
    ) -> Result<String> {
        let client = {
            let mut clients = self.clients.lock().await;
            clients
                .entry(server_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(RconClient::new(host, port, password))))
                .clone()
        };

        let mut client = client.lock().await;
        if !client.is_connected() {
            client.connect().await?;
        }
        match client.execute(command).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                client.disconnect();
                Err(e)
            }
        }
    }

    pub async fn remove(&self, server_id: &str) {
        if self.clients.lock().await.remove(server_id).is_some() {
            info!(server_id = %server_id, "removed rcon client");
        }
    }

    pub async fn close_all(&self) {
        self.clients.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_wire_layout() {
        let packet = Packet::new(1, PACKET_TYPE_AUTH, "hunter2");
        let wire = packet.encode();

        // size = 10 overhead + 7 body
        assert_eq!(&wire[0..4], &17i32.to_le_bytes());
        assert_eq!(&wire[4..8], &1i32.to_le_bytes());
        assert_eq!(&wire[8..12], &3i32.to_le_bytes());
        assert_eq!(&wire[12..19], b"hunter2");
        assert_eq!(&wire[19..], &[0, 0]);
    }

    #[test]
    fn decode_inverts_encode() {
        let packet = Packet::new(7, PACKET_TYPE_RESPONSE, "There are 3 players online");
        let wire = packet.encode();
        let decoded = Packet::decode(&wire[4..]).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn decode_empty_body() {
        let wire = Packet::new(2, PACKET_TYPE_COMMAND, "").encode();
        let decoded = Packet::decode(&wire[4..]).unwrap();
        assert_eq!(decoded.body, "");
    }

    #[test]
    fn decode_rejects_truncated_packets() {
        assert!(Packet::decode(&[0, 0, 0]).is_err());
    }

    #[test]
    fn auth_failure_sentinel() {
        let mut wire = Packet::new(0, PACKET_TYPE_COMMAND, "").encode();
        // Server replaces the id with -1 on bad credentials.
        wire[4..8].copy_from_slice(&(-1i32).to_le_bytes());
        let decoded = Packet::decode(&wire[4..]).unwrap();
        assert_eq!(decoded.id, -1);
    }
}
