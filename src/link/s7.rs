//! S7 controller link over ISO-on-TCP.
//!
//! Minimal client for S7-family controllers: TPKT (RFC 1006) framing, a COTP
//! connection request carrying rack/slot in the remote TSAP, S7 "setup
//! communication" to negotiate the PDU size, then `read var` / `write var`
//! jobs against data blocks (area `0x84`).
//!
//! Bits are written with the S7 bit transport size, so neighbouring bits the
//! controller manages are never rewritten by us.
//!
//! Every request is bounded by `request_timeout`. Any transport failure or
//! timeout drops the socket, which is how the guardian learns the link is down.

use super::{AddressableLink, LinkError};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

const ISO_TCP_PORT: u16 = 102;
const TPKT_HEADER: usize = 4;
const COTP_DATA_HEADER: [u8; 3] = [0x02, 0xF0, 0x80];
const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;
const FN_SETUP_COMMUNICATION: u8 = 0xF0;
const FN_READ_VAR: u8 = 0x04;
const FN_WRITE_VAR: u8 = 0x05;
const AREA_DB: u8 = 0x84;
const TRANSPORT_BIT: u8 = 0x01;
const TRANSPORT_BYTE: u8 = 0x02;
const DATA_BIT: u8 = 0x03;
const DATA_BYTE_BITS: u8 = 0x04;
const DATA_OCTET_STRING: u8 = 0x09;
const RETURN_SUCCESS: u8 = 0xFF;
const REQUESTED_PDU: u16 = 480;
/// The `ANY` pointer carries a 24-bit bit address.
const MAX_BIT_ADDRESS: u32 = 0x00FF_FFFF;
/// S7 ack header (12) + read params (2) + item header (4).
const READ_OVERHEAD: u16 = 18;

/// Connection settings for [`S7Link`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S7LinkConfig {
    /// Controller IP address or host name.
    pub host: String,
    /// ISO-on-TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Rack number of the CPU.
    #[serde(default)]
    pub rack: u16,
    /// Slot number of the CPU.
    #[serde(default = "default_cpu_slot")]
    pub slot: u16,
    /// Upper bound for TCP connect plus handshake.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Upper bound for one request/response exchange.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

fn default_port() -> u16 {
    ISO_TCP_PORT
}

fn default_cpu_slot() -> u16 {
    1
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for S7LinkConfig {
    fn default() -> Self {
        Self::new("192.168.0.1")
    }
}

impl S7LinkConfig {
    /// Config for `host` with default port, rack 0, slot 1.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            rack: 0,
            slot: default_cpu_slot(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// ISO-on-TCP link to an S7 controller.
pub struct S7Link {
    config: S7LinkConfig,
    stream: Option<TcpStream>,
    pdu_length: u16,
    pdu_ref: u16,
}

impl S7Link {
    /// Create a disconnected link.
    pub fn new(config: S7LinkConfig) -> Self {
        Self {
            config,
            stream: None,
            pdu_length: REQUESTED_PDU,
            pdu_ref: 0,
        }
    }

    /// PDU size negotiated with the controller.
    pub fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    async fn handshake(&mut self) -> Result<(TcpStream, u16), LinkError> {
        let addr = (self.config.host.as_str(), self.config.port);
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let request = tpkt(&cotp_connection_request(self.config.rack, self.config.slot));
        stream.write_all(&request).await?;
        let reply = read_tpkt(&mut stream).await?;
        check_connection_confirm(&reply)?;

        let pdu_ref = self.next_ref();
        stream
            .write_all(&tpkt(&setup_communication_request(pdu_ref, REQUESTED_PDU)))
            .await?;
        let reply = read_tpkt(&mut stream).await?;
        let pdu_length = parse_setup_response(strip_cotp(&reply)?)?;
        Ok((stream, pdu_length))
    }

    async fn exchange(&mut self, payload: &[u8]) -> Result<Vec<u8>, LinkError> {
        let request = tpkt(payload);
        let stream = self.stream.as_mut().ok_or(LinkError::NotConnected)?;
        let result = timeout(self.config.request_timeout, async {
            stream.write_all(&request).await?;
            read_tpkt(stream).await
        })
        .await;

        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                self.stream = None;
                Err(err)
            }
            Err(_) => {
                self.stream = None;
                Err(LinkError::Timeout)
            }
        }
    }
}

#[async_trait]
impl AddressableLink for S7Link {
    async fn connect(&mut self) -> Result<(), LinkError> {
        self.stream = None;
        match timeout(self.config.connect_timeout, self.handshake()).await {
            Ok(Ok((stream, pdu_length))) => {
                self.stream = Some(stream);
                self.pdu_length = pdu_length;
                info!(
                    host = %self.config.host,
                    rack = self.config.rack,
                    slot = self.config.slot,
                    pdu_length,
                    "Connected to controller"
                );
                Ok(())
            }
            Ok(Err(err)) => Err(LinkError::ConnectFailed(err.to_string())),
            Err(_) => Err(LinkError::ConnectFailed(format!(
                "no answer from {}:{} within {:?}",
                self.config.host, self.config.port, self.config.connect_timeout
            ))),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!(host = %self.config.host, "Disconnected from controller");
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_bytes(
        &mut self,
        region: u16,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>, LinkError> {
        let chunk = u32::from(self.pdu_length.saturating_sub(READ_OVERHEAD).max(1));
        let mut data = Vec::with_capacity(len as usize);
        let mut done = 0;
        while done < len {
            let count = (len - done).min(chunk);
            let start = offset.checked_add(done).ok_or(LinkError::OutOfRange {
                region,
                offset,
                len,
            })?;
            let pdu_ref = self.next_ref();
            let request = read_var_request(pdu_ref, region, start, count)?;
            let reply = self.exchange(&request).await?;
            let part = parse_read_response(strip_cotp(&reply)?, region, start, count)?;
            data.extend_from_slice(&part);
            done += count;
        }
        debug!(region, offset, len, "read");
        Ok(data)
    }

    async fn write_bit(
        &mut self,
        region: u16,
        offset: u32,
        bit: u8,
        value: bool,
    ) -> Result<(), LinkError> {
        let pdu_ref = self.next_ref();
        let request = write_bit_request(pdu_ref, region, offset, bit, value)?;
        let reply = self.exchange(&request).await?;
        parse_write_response(strip_cotp(&reply)?, region, offset)
    }
}

// =============================================================================
// Frame building
// =============================================================================

fn tpkt(payload: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(TPKT_HEADER + payload.len());
    frame.put_u8(0x03);
    frame.put_u8(0x00);
    frame.put_u16((TPKT_HEADER + payload.len()) as u16);
    frame.put_slice(payload);
    frame
}

fn cotp_connection_request(rack: u16, slot: u16) -> Vec<u8> {
    let remote_tsap = ((rack * 0x20 + slot) & 0xFF) as u8;
    vec![
        0x11, // length indicator
        0xE0, // CR
        0x00, 0x00, // destination reference
        0x00, 0x01, // source reference
        0x00, // class 0
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // calling TSAP
        0xC2, 0x02, 0x01, remote_tsap, // called TSAP (PG, rack/slot)
    ]
}

fn s7_job(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(COTP_DATA_HEADER.len() + 10 + params.len() + data.len());
    buf.put_slice(&COTP_DATA_HEADER);
    buf.put_u8(S7_PROTOCOL_ID);
    buf.put_u8(ROSCTR_JOB);
    buf.put_u16(0);
    buf.put_u16(pdu_ref);
    buf.put_u16(params.len() as u16);
    buf.put_u16(data.len() as u16);
    buf.put_slice(params);
    buf.put_slice(data);
    buf.to_vec()
}

fn setup_communication_request(pdu_ref: u16, pdu_length: u16) -> Vec<u8> {
    let mut params = BytesMut::with_capacity(8);
    params.put_u8(FN_SETUP_COMMUNICATION);
    params.put_u8(0x00);
    params.put_u16(1); // max AmQ calling
    params.put_u16(1); // max AmQ called
    params.put_u16(pdu_length);
    s7_job(pdu_ref, &params, &[])
}

/// S7 `ANY` pointer to `count` items at `byte`.`bit` of a data block.
fn any_pointer(
    transport: u8,
    count: u16,
    region: u16,
    byte: u32,
    bit: u8,
) -> Result<BytesMut, LinkError> {
    let bit_address = byte
        .checked_mul(8)
        .and_then(|bits| bits.checked_add(u32::from(bit)))
        .filter(|address| *address <= MAX_BIT_ADDRESS)
        .ok_or(LinkError::OutOfRange {
            region,
            offset: byte,
            len: u32::from(count),
        })?;
    let mut item = BytesMut::with_capacity(12);
    item.put_u8(0x12); // variable specification
    item.put_u8(0x0A); // length of following address
    item.put_u8(0x10); // syntax id: S7ANY
    item.put_u8(transport);
    item.put_u16(count);
    item.put_u16(region);
    item.put_u8(AREA_DB);
    item.put_slice(&bit_address.to_be_bytes()[1..]);
    Ok(item)
}

fn read_var_request(pdu_ref: u16, region: u16, offset: u32, len: u32) -> Result<Vec<u8>, LinkError> {
    let count = u16::try_from(len).map_err(|_| LinkError::OutOfRange {
        region,
        offset,
        len,
    })?;
    let mut params = BytesMut::with_capacity(14);
    params.put_u8(FN_READ_VAR);
    params.put_u8(1);
    params.put_slice(&any_pointer(TRANSPORT_BYTE, count, region, offset, 0)?);
    Ok(s7_job(pdu_ref, &params, &[]))
}

fn write_bit_request(
    pdu_ref: u16,
    region: u16,
    offset: u32,
    bit: u8,
    value: bool,
) -> Result<Vec<u8>, LinkError> {
    if bit > 7 {
        return Err(LinkError::Protocol(format!("bit index {bit} out of range")));
    }
    let mut params = BytesMut::with_capacity(14);
    params.put_u8(FN_WRITE_VAR);
    params.put_u8(1);
    params.put_slice(&any_pointer(TRANSPORT_BIT, 1, region, offset, bit)?);
    let data = [0x00, DATA_BIT, 0x00, 0x01, u8::from(value)];
    Ok(s7_job(pdu_ref, &params, &data))
}

// =============================================================================
// Frame parsing
// =============================================================================

async fn read_tpkt(stream: &mut TcpStream) -> Result<Vec<u8>, LinkError> {
    let mut header = [0u8; TPKT_HEADER];
    stream.read_exact(&mut header).await?;
    if header[0] != 0x03 {
        return Err(LinkError::Protocol(format!(
            "bad TPKT version {:#04x}",
            header[0]
        )));
    }
    let total = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if total < TPKT_HEADER + 2 {
        return Err(LinkError::Protocol(format!("TPKT length {total} too short")));
    }
    let mut payload = vec![0u8; total - TPKT_HEADER];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

fn check_connection_confirm(cotp: &[u8]) -> Result<(), LinkError> {
    match cotp.get(1) {
        Some(pdu_type) if pdu_type & 0xF0 == 0xD0 => Ok(()),
        Some(pdu_type) => Err(LinkError::Protocol(format!(
            "expected COTP connection confirm, got {pdu_type:#04x}"
        ))),
        None => Err(LinkError::Protocol("empty COTP reply".into())),
    }
}

/// Skip the COTP data header and return the S7 PDU.
fn strip_cotp(payload: &[u8]) -> Result<&[u8], LinkError> {
    let header_len = usize::from(*payload.first().ok_or_else(|| {
        LinkError::Protocol("empty COTP frame".into())
    })?) + 1;
    payload
        .get(header_len..)
        .ok_or_else(|| LinkError::Protocol("truncated COTP frame".into()))
}

/// Validate an ack-data header and split it into `(params, data)`.
fn split_ack(pdu: &[u8]) -> Result<(&[u8], &[u8]), LinkError> {
    if pdu.len() < 12 || pdu[0] != S7_PROTOCOL_ID {
        return Err(LinkError::Protocol("malformed S7 header".into()));
    }
    if pdu[1] != ROSCTR_ACK_DATA {
        return Err(LinkError::Protocol(format!(
            "unexpected S7 ROSCTR {:#04x}",
            pdu[1]
        )));
    }
    let (class, code) = (pdu[10], pdu[11]);
    if class != 0 || code != 0 {
        return Err(LinkError::Protocol(format!(
            "controller rejected job (class {class:#04x}, code {code:#04x})"
        )));
    }
    let param_len = usize::from(u16::from_be_bytes([pdu[6], pdu[7]]));
    let data_len = usize::from(u16::from_be_bytes([pdu[8], pdu[9]]));
    let params = pdu
        .get(12..12 + param_len)
        .ok_or_else(|| LinkError::Protocol("truncated S7 parameters".into()))?;
    let data = pdu
        .get(12 + param_len..12 + param_len + data_len)
        .ok_or_else(|| LinkError::Protocol("truncated S7 data".into()))?;
    Ok((params, data))
}

fn parse_setup_response(pdu: &[u8]) -> Result<u16, LinkError> {
    let (params, _) = split_ack(pdu)?;
    if params.len() < 8 || params[0] != FN_SETUP_COMMUNICATION {
        return Err(LinkError::Protocol("bad setup-communication reply".into()));
    }
    Ok(u16::from_be_bytes([params[6], params[7]]))
}

fn item_error(code: u8, region: u16, offset: u32, len: u32) -> LinkError {
    match code {
        0x05 | 0x0A => LinkError::OutOfRange {
            region,
            offset,
            len,
        },
        other => LinkError::Protocol(format!("item return code {other:#04x}")),
    }
}

fn parse_read_response(pdu: &[u8], region: u16, offset: u32, len: u32) -> Result<Vec<u8>, LinkError> {
    let (params, data) = split_ack(pdu)?;
    if params.first() != Some(&FN_READ_VAR) {
        return Err(LinkError::Protocol("bad read-var reply".into()));
    }
    if data.len() < 4 {
        return Err(LinkError::Protocol("truncated read-var item".into()));
    }
    if data[0] != RETURN_SUCCESS {
        return Err(item_error(data[0], region, offset, len));
    }
    let raw_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    let byte_len = match data[1] {
        DATA_BYTE_BITS => raw_len / 8,
        DATA_OCTET_STRING | 0x07 => raw_len,
        other => {
            return Err(LinkError::Protocol(format!(
                "unexpected transport size {other:#04x}"
            )))
        }
    };
    if byte_len != len as usize {
        return Err(LinkError::Protocol(format!(
            "asked for {len} bytes, controller returned {byte_len}"
        )));
    }
    data.get(4..4 + byte_len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| LinkError::Protocol("truncated read-var payload".into()))
}

fn parse_write_response(pdu: &[u8], region: u16, offset: u32) -> Result<(), LinkError> {
    let (params, data) = split_ack(pdu)?;
    if params.first() != Some(&FN_WRITE_VAR) {
        return Err(LinkError::Protocol("bad write-var reply".into()));
    }
    match data.first() {
        Some(&RETURN_SUCCESS) => Ok(()),
        Some(code) => Err(item_error(*code, region, offset, 1)),
        None => Err(LinkError::Protocol("empty write-var reply".into())),
    }
}
