//! Minimal SNTP (RFC 4330) client.

use super::unix_now;
use crate::error::SyncError;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::debug;

const NTP_PORT: u16 = 123;
const PACKET_LEN: usize = 48;
/// Seconds between 1900-01-01 and 1970-01-01
const NTP_UNIX_DELTA: f64 = 2_208_988_800.0;
/// LI = 0, VN = 4, Mode = 3 (client)
const CLIENT_HEADER: u8 = 0b00_100_011;
const MODE_SERVER: u8 = 4;

/// Reply of a single time server query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerReading {
    /// Server clock minus local clock, in seconds
    pub offset: f64,
    /// Round-trip delay, in seconds
    pub delay: f64,
}

/// Something that can tell how far the local clock is from a time server
pub trait TimeSource: Send + Sync {
    fn query(&self, server: &str) -> Result<ServerReading, SyncError>;
}

pub struct SntpClient {
    timeout: Duration,
}

impl SntpClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn resolve(server: &str) -> Result<SocketAddr, SyncError> {
        let target = if server.contains(':') {
            server.to_string()
        } else {
            format!("{}:{}", server, NTP_PORT)
        };
        target
            .to_socket_addrs()
            .map_err(|e| unreachable(server, e))?
            .next()
            .ok_or_else(|| unreachable(server, "no address resolved"))
    }
}

impl TimeSource for SntpClient {
    fn query(&self, server: &str) -> Result<ServerReading, SyncError> {
        let addr = Self::resolve(server)?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).map_err(|e| unreachable(server, e))?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| unreachable(server, e))?;

        let originate = unix_now();
        socket
            .send_to(&encode_request(originate), addr)
            .map_err(|e| unreachable(server, e))?;

        let mut buffer = [0u8; 512];
        let (len, from) = socket
            .recv_from(&mut buffer)
            .map_err(|e| unreachable(server, e))?;
        let destination = unix_now();

        if from.ip() != addr.ip() {
            return Err(invalid(server, format!("reply from unexpected peer {}", from)));
        }

        let reading = parse_reply(&buffer[..len], originate, destination)
            .map_err(|reason| invalid(server, reason))?;
        debug!(server = %server, offset = reading.offset, delay = reading.delay, "time server reply");
        Ok(reading)
    }
}

fn unreachable(server: &str, reason: impl ToString) -> SyncError {
    SyncError::TimeServerUnreachable {
        server: server.to_string(),
        reason: reason.to_string(),
    }
}

fn invalid(server: &str, reason: impl ToString) -> SyncError {
    SyncError::InvalidReply {
        server: server.to_string(),
        reason: reason.to_string(),
    }
}

/// Client request carrying `originate` as its transmit timestamp
pub fn encode_request(originate: f64) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = CLIENT_HEADER;
    packet[40..48].copy_from_slice(&to_ntp_timestamp(originate));
    packet
}

/// Offset and delay from a server reply.
///
/// `originate` and `destination` are the local send and receive times.
pub fn parse_reply(
    packet: &[u8],
    originate: f64,
    destination: f64,
) -> Result<ServerReading, String> {
    if packet.len() < PACKET_LEN {
        return Err(format!("short packet ({} bytes)", packet.len()));
    }
    let mode = packet[0] & 0x07;
    if mode != MODE_SERVER {
        return Err(format!("unexpected mode {}", mode));
    }
    if packet[0] >> 6 == 3 {
        return Err("server clock not synchronized".to_string());
    }
    let stratum = packet[1];
    if stratum == 0 {
        return Err("kiss-of-death reply".to_string());
    }

    let receive = from_ntp_timestamp(&packet[32..40]);
    let transmit = from_ntp_timestamp(&packet[40..48]);
    let (Some(receive), Some(transmit)) = (receive, transmit) else {
        return Err("zero timestamp in reply".to_string());
    };

    let offset = ((receive - originate) + (transmit - destination)) / 2.0;
    let delay = ((destination - originate) - (transmit - receive)).max(0.0);
    Ok(ServerReading { offset, delay })
}

fn to_ntp_timestamp(unix: f64) -> [u8; 8] {
    let ntp = unix + NTP_UNIX_DELTA;
    let seconds = ntp.trunc() as u32;
    let fraction = (ntp.fract() * 4_294_967_296.0) as u32;
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&seconds.to_be_bytes());
    out[4..].copy_from_slice(&fraction.to_be_bytes());
    out
}

fn from_ntp_timestamp(raw: &[u8]) -> Option<f64> {
    let seconds = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let fraction = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    if seconds == 0 && fraction == 0 {
        return None;
    }
    Some(seconds as f64 + fraction as f64 / 4_294_967_296.0 - NTP_UNIX_DELTA)
}
