//! MySQL packet codec
//!
//! Framing plus encoders/decoders for the connection-phase packets.
//! Decoding goes through [`PayloadReader`], which turns any truncation into a
//! protocol error instead of an out-of-bounds panic.
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html>

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::packets::*;
use crate::error::{RelayError, Result};

// ============================================================================
// Framing
// ============================================================================

/// Read one complete MySQL packet.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(PacketHeader, Vec<u8>)> {
    let mut header_buf = [0u8; 4];
    reader.read_exact(&mut header_buf).await?;
    let header = PacketHeader::from_bytes(header_buf);

    let mut payload = vec![0u8; header.payload_length as usize];
    reader.read_exact(&mut payload).await?;

    trace!(
        len = header.payload_length,
        seq = header.sequence_id,
        "Read packet"
    );
    Ok((header, payload))
}

/// Write one MySQL packet and flush.
///
/// Connection-phase packets are small; payloads that would need splitting
/// across several frames are rejected.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    sequence_id: u8,
    payload: &[u8],
) -> Result<()> {
    if payload.len() >= PacketHeader::MAX_PAYLOAD_LENGTH as usize {
        return Err(RelayError::Protocol(format!(
            "payload of {} bytes exceeds a single packet",
            payload.len()
        )));
    }
    let header = PacketHeader::new(payload.len() as u32, sequence_id);
    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// Reader
// ============================================================================

/// Bounds-checked cursor over a packet payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(RelayError::Protocol(format!(
                "truncated packet: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Bytes up to (not including) the next NUL; the NUL is consumed.
    pub fn null_terminated(&mut self) -> Result<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| RelayError::Protocol("missing null terminator".into()))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    pub fn null_terminated_string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.null_terminated()?).into_owned())
    }

    /// Length-encoded integer.
    pub fn lenenc_int(&mut self) -> Result<u64> {
        match self.u8()? {
            n @ 0x00..=0xFA => Ok(n as u64),
            // NULL marker, only meaningful in row data
            0xFB => Ok(0),
            0xFC => Ok(self.u16_le()? as u64),
            0xFD => {
                let b = self.take(3)?;
                Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64)
            }
            0xFE => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(u64::from_le_bytes(raw))
            }
            _ => Err(RelayError::Protocol(
                "invalid length-encoded int marker 0xFF".into(),
            )),
        }
    }

    /// Length-encoded byte string.
    pub fn lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.lenenc_int()?;
        let len = usize::try_from(len)
            .map_err(|_| RelayError::Protocol(format!("length {} out of range", len)))?;
        self.take(len)
    }

    /// Everything not consumed yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

// ============================================================================
// Writer helpers
// ============================================================================

pub fn put_lenenc_int(buf: &mut Vec<u8>, value: u64) {
    if value < 0xFB {
        buf.push(value as u8);
    } else if value <= 0xFFFF {
        buf.push(0xFC);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xFF_FFFF {
        buf.push(0xFD);
        buf.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        buf.push(0xFE);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

pub fn put_lenenc_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_lenenc_int(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn put_null_terminated(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
    buf.push(0);
}

// ============================================================================
// HandshakeV10
// ============================================================================

/// Parse a HandshakeV10 payload.
pub fn parse_handshake_v10(payload: &[u8]) -> Result<HandshakeV10> {
    let mut r = PayloadReader::new(payload);

    let protocol_version = r.u8()?;
    if protocol_version != 10 {
        return Err(RelayError::Protocol(format!(
            "unsupported protocol version: {}",
            protocol_version
        )));
    }

    let server_version = r.null_terminated_string()?;
    let connection_id = r.u32_le()?;
    let mut auth_plugin_data = r.take(8)?.to_vec();
    r.skip(1)?; // filler
    let mut capability_flags = r.u16_le()? as u32;

    let mut handshake = HandshakeV10 {
        protocol_version,
        server_version,
        connection_id,
        auth_plugin_data: Vec::new(),
        capability_flags,
        character_set: DEFAULT_COLLATION_ID,
        status_flags: 0,
        auth_plugin_name: String::new(),
    };

    // Pre-4.1 servers stop here
    if r.is_empty() {
        handshake.auth_plugin_data = auth_plugin_data;
        return Ok(handshake);
    }

    handshake.character_set = r.u8()?;
    handshake.status_flags = r.u16_le()?;
    capability_flags |= (r.u16_le()? as u32) << 16;
    let auth_plugin_data_len = r.u8()? as usize;
    r.skip(10)?; // reserved

    if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
        let part2_len = std::cmp::max(13, auth_plugin_data_len.saturating_sub(8));
        let part2 = r.take(part2_len.min(r.remaining()))?;
        let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
        auth_plugin_data.extend_from_slice(part2);
    }

    if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
        let name = r.rest();
        let name = name.strip_suffix(&[0]).unwrap_or(name);
        handshake.auth_plugin_name = String::from_utf8_lossy(name).into_owned();
    }

    handshake.capability_flags = capability_flags;
    handshake.auth_plugin_data = auth_plugin_data;
    Ok(handshake)
}

/// Build a HandshakeV10 payload.
pub fn build_handshake_v10(handshake: &HandshakeV10) -> Vec<u8> {
    let caps = handshake.capability_flags;
    let data = &handshake.auth_plugin_data;
    let (part1, part2) = data.split_at(data.len().min(8));

    let mut payload = Vec::with_capacity(128);
    payload.push(handshake.protocol_version);
    put_null_terminated(&mut payload, handshake.server_version.as_bytes());
    payload.extend_from_slice(&handshake.connection_id.to_le_bytes());
    payload.extend_from_slice(part1);
    payload.resize(payload.len() + (8 - part1.len()), 0);
    payload.push(0); // filler
    payload.extend_from_slice(&((caps & 0xFFFF) as u16).to_le_bytes());
    payload.push(handshake.character_set);
    payload.extend_from_slice(&handshake.status_flags.to_le_bytes());
    payload.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
    payload.push(if caps & CLIENT_PLUGIN_AUTH != 0 {
        (data.len() + 1) as u8
    } else {
        0
    });
    payload.extend_from_slice(&[0u8; 10]);

    if caps & CLIENT_SECURE_CONNECTION != 0 {
        // At least 13 bytes including the terminating NUL
        let start = payload.len();
        put_null_terminated(&mut payload, part2);
        let written = payload.len() - start;
        if written < 13 {
            payload.resize(payload.len() + (13 - written), 0);
        }
    }
    if caps & CLIENT_PLUGIN_AUTH != 0 {
        put_null_terminated(&mut payload, handshake.auth_plugin_name.as_bytes());
    }
    payload
}

// ============================================================================
// HandshakeResponse41
// ============================================================================

/// True for the 32-byte SSLRequest a client sends before upgrading to TLS.
pub fn is_ssl_request(payload: &[u8]) -> bool {
    payload.len() == 32
        && u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) & CLIENT_SSL != 0
}

/// Parse a HandshakeResponse41 payload.
pub fn parse_handshake_response41(payload: &[u8]) -> Result<HandshakeResponse41> {
    let mut r = PayloadReader::new(payload);

    let capability_flags = r.u32_le()?;
    if capability_flags & CLIENT_PROTOCOL_41 == 0 {
        return Err(RelayError::Protocol(
            "client does not speak protocol 4.1".into(),
        ));
    }
    let max_packet_size = r.u32_le()?;
    let character_set = r.u8()?;
    r.skip(23)?;
    let username = r.null_terminated_string()?;

    let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        r.lenenc_bytes()?.to_vec()
    } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
        let len = r.u8()? as usize;
        r.take(len)?.to_vec()
    } else {
        r.null_terminated()?.to_vec()
    };

    let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !r.is_empty() {
        Some(r.null_terminated_string()?).filter(|db| !db.is_empty())
    } else {
        None
    };

    let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
        Some(r.null_terminated_string()?)
    } else {
        None
    };

    let connect_attrs = if capability_flags & CLIENT_CONNECT_ATTRS != 0 && !r.is_empty() {
        match parse_connect_attrs(&mut r) {
            Ok(attrs) => {
                debug!(attrs_count = attrs.len(), "Parsed MySQL connect_attrs");
                attrs
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse MySQL connect_attrs");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    Ok(HandshakeResponse41 {
        capability_flags,
        max_packet_size,
        character_set,
        username,
        auth_response,
        database,
        auth_plugin_name,
        connect_attrs,
    })
}

/// Connection attributes: a length-encoded total, then key/value pairs of
/// length-encoded strings. A truncated block yields the pairs read so far.
fn parse_connect_attrs(r: &mut PayloadReader<'_>) -> Result<Vec<(String, String)>> {
    let block = r.lenenc_bytes()?;
    let mut attrs = PayloadReader::new(block);
    let mut out = Vec::new();
    while !attrs.is_empty() {
        let (Ok(key), Ok(value)) = (attrs.lenenc_bytes(), attrs.lenenc_bytes()) else {
            break;
        };
        out.push((
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
    }
    Ok(out)
}

/// Build a HandshakeResponse41 payload.
pub fn build_handshake_response41(response: &HandshakeResponse41) -> Vec<u8> {
    let caps = response.capability_flags;
    let mut payload = Vec::with_capacity(128);

    payload.extend_from_slice(&caps.to_le_bytes());
    payload.extend_from_slice(&response.max_packet_size.to_le_bytes());
    payload.push(response.character_set);
    payload.extend_from_slice(&[0u8; 23]);
    put_null_terminated(&mut payload, response.username.as_bytes());

    if caps & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        put_lenenc_bytes(&mut payload, &response.auth_response);
    } else if caps & CLIENT_SECURE_CONNECTION != 0 {
        payload.push(response.auth_response.len() as u8);
        payload.extend_from_slice(&response.auth_response);
    } else {
        put_null_terminated(&mut payload, &response.auth_response);
    }

    if caps & CLIENT_CONNECT_WITH_DB != 0 {
        put_null_terminated(
            &mut payload,
            response.database.as_deref().unwrap_or("").as_bytes(),
        );
    }
    if caps & CLIENT_PLUGIN_AUTH != 0 {
        put_null_terminated(
            &mut payload,
            response
                .auth_plugin_name
                .as_deref()
                .unwrap_or(MYSQL_NATIVE_PASSWORD)
                .as_bytes(),
        );
    }
    if caps & CLIENT_CONNECT_ATTRS != 0 {
        let mut block = Vec::new();
        for (key, value) in &response.connect_attrs {
            put_lenenc_bytes(&mut block, key.as_bytes());
            put_lenenc_bytes(&mut block, value.as_bytes());
        }
        put_lenenc_bytes(&mut payload, &block);
    }
    payload
}

// ============================================================================
// OK / ERR / auth switch
// ============================================================================

pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

/// Parse an OK packet (protocol 4.1 layout).
pub fn parse_ok_packet(payload: &[u8]) -> Result<OkPacket> {
    let mut r = PayloadReader::new(payload);
    let header = r.u8()?;
    if header != OK_HEADER && header != AUTH_SWITCH_REQUEST {
        return Err(RelayError::Protocol(format!(
            "invalid OK packet header: 0x{:02X}",
            header
        )));
    }
    Ok(OkPacket {
        affected_rows: r.lenenc_int()?,
        last_insert_id: r.lenenc_int()?,
        status_flags: r.u16_le()?,
        warnings: r.u16_le()?,
        info: String::from_utf8_lossy(r.rest()).into_owned(),
    })
}

/// Build an OK packet (protocol 4.1 layout).
pub fn build_ok_packet(ok: &OkPacket) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + ok.info.len());
    payload.push(OK_HEADER);
    put_lenenc_int(&mut payload, ok.affected_rows);
    put_lenenc_int(&mut payload, ok.last_insert_id);
    payload.extend_from_slice(&ok.status_flags.to_le_bytes());
    payload.extend_from_slice(&ok.warnings.to_le_bytes());
    payload.extend_from_slice(ok.info.as_bytes());
    payload
}

/// Parse an ERR packet (protocol 4.1 layout; the state marker is optional).
pub fn parse_err_packet(payload: &[u8]) -> Result<ErrPacket> {
    let mut r = PayloadReader::new(payload);
    let header = r.u8()?;
    if header != ERR_HEADER {
        return Err(RelayError::Protocol(format!(
            "invalid ERR packet header: 0x{:02X}",
            header
        )));
    }
    let error_code = r.u16_le()?;
    let mut sql_state = *b"HY000";
    if r.remaining() >= 6 && payload[3] == b'#' {
        r.skip(1)?;
        sql_state.copy_from_slice(r.take(5)?);
    }
    Ok(ErrPacket {
        error_code,
        sql_state,
        error_message: String::from_utf8_lossy(r.rest()).into_owned(),
    })
}

/// Build an ERR packet (protocol 4.1 layout).
pub fn build_err_packet(err: &ErrPacket) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9 + err.error_message.len());
    payload.push(ERR_HEADER);
    payload.extend_from_slice(&err.error_code.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(&err.sql_state);
    payload.extend_from_slice(err.error_message.as_bytes());
    payload
}

/// Build an AuthSwitchRequest: 0xFE, plugin name, plugin data + NUL.
pub fn build_auth_switch_request(plugin: &str, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + plugin.len() + data.len() + 1);
    payload.push(AUTH_SWITCH_REQUEST);
    put_null_terminated(&mut payload, plugin.as_bytes());
    put_null_terminated(&mut payload, data);
    payload
}

/// Parse an AuthSwitchRequest into plugin name and plugin data.
///
/// The trailing NUL some servers append to the data is stripped.
pub fn parse_auth_switch_request(payload: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut r = PayloadReader::new(payload);
    if r.u8()? != AUTH_SWITCH_REQUEST {
        return Err(RelayError::Protocol("not an auth switch request".into()));
    }
    let plugin = r.null_terminated_string()?;
    let data = r.rest();
    let data = data.strip_suffix(&[0]).unwrap_or(data);
    Ok((plugin, data.to_vec()))
}
