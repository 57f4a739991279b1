//! # Register Transport
//!
//! The [`RegisterTransport`] trait is the engine's only view of the field
//! bus: bulk-read a block of holding registers, write a single register,
//! close the session. Register words cross this boundary as signed 16-bit
//! values; the two's-complement reinterpretation of the unsigned wire word
//! happens here and nowhere else.
//!
//! [`ModbusTcpTransport`] is the production implementation: one TCP
//! session, MBAP framing, FC03 (Read Holding Registers) and FC06 (Write
//! Single Register), sequential request/response with a per-request
//! timeout. A failed or timed-out exchange drops the session and the
//! next request dials again, so a controller reboot costs one failed
//! poll cycle instead of wedging the bridge. Kronoterm controllers
//! default to unit id 20.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};

/// Modbus protocol limit for FC03 block reads.
pub const MAX_READ_REGISTERS: u16 = 125;

/// MBAP header length (transaction id, protocol id, length, unit id).
const MBAP_HEADER_LEN: usize = 7;

/// Abstract register-addressed field bus session.
///
/// Implementations own connection lifecycle and wire framing; the engine
/// only ever calls these three operations, from a single owner at a time.
#[async_trait]
pub trait RegisterTransport: Send {
    /// Read `count` consecutive holding registers starting at `start`.
    async fn read_block(&mut self, start: u16, count: u16) -> BridgeResult<Vec<i16>>;

    /// Write a single holding register.
    async fn write_register(&mut self, address: u16, value: i16) -> BridgeResult<()>;

    /// Release the underlying session.
    async fn close(&mut self) -> BridgeResult<()>;
}

// ============================================================================
// Modbus TCP implementation
// ============================================================================

/// Modbus TCP session speaking FC03/FC06 to a single unit.
///
/// The session is re-established lazily: after an I/O error or timeout
/// the stream (possibly left mid-frame or with a stale response
/// buffered) is dropped, and the next request reconnects.
pub struct ModbusTcpTransport {
    address: String,
    stream: Option<TcpStream>,
    unit_id: u8,
    timeout: Duration,
    transaction_id: u16,
}

impl ModbusTcpTransport {
    /// Connect to `host:port` with the given per-request timeout.
    pub async fn connect(
        host: &str,
        port: u16,
        unit_id: u8,
        timeout: Duration,
    ) -> BridgeResult<Self> {
        let mut transport = ModbusTcpTransport {
            address: format!("{host}:{port}"),
            stream: None,
            unit_id,
            timeout,
            transaction_id: 0,
        };
        transport.reconnect().await?;
        Ok(transport)
    }

    async fn reconnect(&mut self) -> BridgeResult<()> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| BridgeError::transport(format!("Connect to {} timed out", self.address)))?
            .map_err(|e| {
                BridgeError::transport(format!("Connect to {} failed: {e}", self.address))
            })?;
        stream.set_nodelay(true)?;

        debug!(
            "Connected to Modbus TCP server at {} (unit {})",
            self.address, self.unit_id
        );
        self.stream = Some(stream);
        Ok(())
    }

    /// Send one PDU and return the response PDU, matching transaction ids.
    /// Reconnects first if the previous exchange broke the session.
    async fn request(&mut self, pdu: &[u8]) -> BridgeResult<Vec<u8>> {
        if self.stream.is_none() {
            self.reconnect().await?;
        }
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let frame = encode_frame(self.transaction_id, self.unit_id, pdu);

        let result = match tokio::time::timeout(self.timeout, self.exchange(&frame)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::transport("Request timed out")),
        };
        if result.is_err() {
            // A late response may still be buffered on the stream and
            // would desynchronize transaction ids; start over instead.
            self.stream = None;
        }
        result
    }

    async fn exchange(&mut self, frame: &[u8]) -> BridgeResult<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BridgeError::transport("Not connected"))?;
        stream.write_all(frame).await?;

        let mut header = [0u8; MBAP_HEADER_LEN];
        stream.read_exact(&mut header).await?;

        let mut buf = &header[..];
        let transaction_id = buf.get_u16();
        let protocol_id = buf.get_u16();
        let length = buf.get_u16() as usize;

        if protocol_id != 0 {
            return Err(BridgeError::transport(format!(
                "Unexpected protocol id {protocol_id}"
            )));
        }
        if transaction_id != self.transaction_id {
            return Err(BridgeError::transport(format!(
                "Transaction id mismatch: sent {}, got {transaction_id}",
                self.transaction_id
            )));
        }
        // Length covers unit id + PDU; unit id is the header's last byte.
        if length < 2 {
            return Err(BridgeError::transport("Response frame too short"));
        }

        let mut pdu = vec![0u8; length - 1];
        stream.read_exact(&mut pdu).await?;
        Ok(pdu)
    }
}

#[async_trait]
impl RegisterTransport for ModbusTcpTransport {
    async fn read_block(&mut self, start: u16, count: u16) -> BridgeResult<Vec<i16>> {
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(BridgeError::transport(format!(
                "Invalid register count {count} (must be 1-{MAX_READ_REGISTERS})"
            )));
        }
        let pdu = self.request(&encode_read_pdu(start, count)).await?;
        parse_read_response(&pdu, count)
    }

    async fn write_register(&mut self, address: u16, value: i16) -> BridgeResult<()> {
        let pdu = self.request(&encode_write_pdu(address, value)).await?;
        parse_write_response(&pdu, address, value)
    }

    async fn close(&mut self) -> BridgeResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
            debug!("Modbus TCP session closed");
        }
        Ok(())
    }
}

// ============================================================================
// Frame encoding / parsing
// ============================================================================

/// Wrap a PDU in an MBAP header.
fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0); // protocol id
    frame.put_u16(pdu.len() as u16 + 1); // unit id + PDU
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    frame
}

/// FC03 request PDU.
fn encode_read_pdu(start: u16, count: u16) -> [u8; 5] {
    let start = start.to_be_bytes();
    let count = count.to_be_bytes();
    [0x03, start[0], start[1], count[0], count[1]]
}

/// FC06 request PDU. The signed value is written as its raw wire word.
fn encode_write_pdu(address: u16, value: i16) -> [u8; 5] {
    let address = address.to_be_bytes();
    let value = (value as u16).to_be_bytes();
    [0x06, address[0], address[1], value[0], value[1]]
}

/// Check for a Modbus exception response (function code with bit 7 set).
fn check_exception(pdu: &[u8], expected_fc: u8) -> BridgeResult<()> {
    if pdu.is_empty() {
        return Err(BridgeError::transport("Empty response PDU"));
    }
    if pdu[0] == expected_fc | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(BridgeError::transport(format!(
            "Device rejected function {expected_fc:#04x}: {} (exception {code:#04x})",
            exception_name(code)
        )));
    }
    if pdu[0] != expected_fc {
        return Err(BridgeError::transport(format!(
            "Function code mismatch: expected {expected_fc:#04x}, got {:#04x}",
            pdu[0]
        )));
    }
    Ok(())
}

/// FC03 response: byte count plus big-endian words, reinterpreted signed.
fn parse_read_response(pdu: &[u8], expected_count: u16) -> BridgeResult<Vec<i16>> {
    check_exception(pdu, 0x03)?;
    if pdu.len() < 2 {
        return Err(BridgeError::transport("Truncated FC03 response"));
    }

    let byte_count = pdu[1] as usize;
    let data = &pdu[2..];
    if data.len() < byte_count || byte_count != expected_count as usize * 2 {
        return Err(BridgeError::transport(format!(
            "FC03 returned {byte_count} data bytes, expected {}",
            expected_count * 2
        )));
    }

    let mut values = Vec::with_capacity(expected_count as usize);
    for word in data[..byte_count].chunks_exact(2) {
        values.push(u16::from_be_bytes([word[0], word[1]]) as i16);
    }
    Ok(values)
}

/// FC06 response: echo of address and value.
fn parse_write_response(pdu: &[u8], address: u16, value: i16) -> BridgeResult<()> {
    check_exception(pdu, 0x06)?;
    if pdu.len() < 5 {
        return Err(BridgeError::transport("Truncated FC06 response"));
    }
    let echo_address = u16::from_be_bytes([pdu[1], pdu[2]]);
    let echo_value = u16::from_be_bytes([pdu[3], pdu[4]]) as i16;
    if echo_address != address || echo_value != value {
        return Err(BridgeError::transport(format!(
            "FC06 echo mismatch: wrote {value} to {address}, device echoed {echo_value} at {echo_address}"
        )));
    }
    Ok(())
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        _ => "unknown exception",
    }
}

// ============================================================================
// Tests
// ============================================================================
