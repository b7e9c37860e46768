//! CONNECT-IP wire details: datagram framing and request construction.
//!
//! Once the extended CONNECT request is accepted, every QUIC datagram on the
//! connection carries one IP packet behind a variable-length context ID
//! prefix. Context ID 0 means "this is an IP packet"; other contexts are
//! reserved for extensions and are dropped by this client.

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Context ID carrying plain IP payloads.
pub const CONTEXT_ID_IP: u64 = 0;

/// Wildcard IP-proxying request template: tunnel everything, let the
/// endpoint pick addressing.
pub const CONNECT_IP_TEMPLATE: &str = "/.well-known/masque/ip/*/*/";

/// Encode a QUIC variable-length integer.
pub fn put_varint(buf: &mut BytesMut, value: u64) {
    if value < 64 {
        buf.put_u8(value as u8);
    } else if value < 16_384 {
        buf.put_u16(0x4000 | value as u16);
    } else if value < 1_073_741_824 {
        buf.put_u32(0x8000_0000 | value as u32);
    } else {
        buf.put_u64(0xC000_0000_0000_0000 | value);
    }
}

/// Decode a QUIC variable-length integer.
pub fn get_varint(buf: &mut impl Buf) -> Result<u64> {
    if !buf.has_remaining() {
        bail!("empty buffer for varint");
    }

    let first = buf.get_u8();
    match first >> 6 {
        0 => Ok(first as u64),
        1 => {
            if buf.remaining() < 1 {
                bail!("truncated 2-byte varint");
            }
            Ok((((first & 0x3F) as u64) << 8) | buf.get_u8() as u64)
        }
        2 => {
            if buf.remaining() < 3 {
                bail!("truncated 4-byte varint");
            }
            let mut val = ((first & 0x3F) as u64) << 24;
            for shift in (0..3).rev() {
                val |= (buf.get_u8() as u64) << (shift * 8);
            }
            Ok(val)
        }
        3 => {
            if buf.remaining() < 7 {
                bail!("truncated 8-byte varint");
            }
            let mut val = ((first & 0x3F) as u64) << 56;
            for shift in (0..7).rev() {
                val |= (buf.get_u8() as u64) << (shift * 8);
            }
            Ok(val)
        }
        _ => unreachable!(),
    }
}

/// One tunnelled IP packet as carried in a QUIC datagram.
#[derive(Debug, Clone)]
pub struct IpDatagram {
    pub context_id: u64,
    pub payload: Bytes,
}

impl IpDatagram {
    /// Wrap an IP packet under the default context.
    pub fn new(payload: Bytes) -> Self {
        Self {
            context_id: CONTEXT_ID_IP,
            payload,
        }
    }

    /// Encode for transmission.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.payload.len());
        put_varint(&mut buf, self.context_id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a received datagram. The payload is not inspected; IP-level
    /// validation belongs to the network stack it is injected into.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        let context_id = get_varint(&mut data)?;
        Ok(Self {
            context_id,
            payload: data,
        })
    }
}

/// Build the extended CONNECT request that opens the IP tunnel.
///
/// The protocol token travels as a plain header next to the
/// capsule-protocol signal; h3's request API has no slot for arbitrary
/// `:protocol` values.
pub fn connect_ip_request(authority: &str) -> Result<http::Request<()>> {
    let uri = format!("https://{}{}", authority, CONNECT_IP_TEMPLATE);
    http::Request::builder()
        .method(http::Method::CONNECT)
        .uri(&uri)
        .header("x-protocol", "connect-ip")
        .header("capsule-protocol", "?1")
        .body(())
        .with_context(|| format!("building connect-ip request for {uri}"))
}
