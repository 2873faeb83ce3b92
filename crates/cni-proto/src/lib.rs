//! Binary protocol for plugin-to-daemon communication over the Unix socket.
//!
//! ## Wire Format
//!
//! ```text
//! [4-byte length][1-byte type][4-byte seq][payload]
//! ```
//!
//! - **length**: big-endian u32, size of (type + seq + payload)
//! - **type**: u8 message type
//! - **seq**: big-endian u32, sequence number chosen by the client and
//!   echoed by the daemon
//! - **payload**: type-specific binary data; strings are `[2B len][bytes]`
//!
//! ## Message Types
//!
//! | Type | Direction | Name      | Payload |
//! |------|-----------|-----------|---------|
//! | 0x01 | P→D       | add       | container_id, netns, ifname, pod_name, pod_namespace, pod_uid, cluster_ip |
//! | 0x02 | D→P       | add_ok    | ipv4, ipv6 (empty when absent), hostname |
//! | 0x03 | P→D       | del       | container_id, netns, ifname |
//! | 0x04 | D→P       | del_ok    | (empty) |
//! | 0x05 | P→D       | check     | container_id, netns, ifname |
//! | 0x06 | D→P       | check_ok  | `[1B healthy]` + message |
//! | 0xFF | D→P       | error     | message |

/// Header size (4-byte length prefix).
pub const HEADER_SIZE: usize = 4;

/// Maximum message body size. Requests carry short identifiers only.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Minimum body size: type (1) + seq (4).
pub const MIN_BODY_SIZE: usize = 5;

// Message type constants.
pub const MSG_ADD: u8 = 0x01;
pub const MSG_ADD_OK: u8 = 0x02;
pub const MSG_DEL: u8 = 0x03;
pub const MSG_DEL_OK: u8 = 0x04;
pub const MSG_CHECK: u8 = 0x05;
pub const MSG_CHECK_OK: u8 = 0x06;
pub const MSG_ERROR: u8 = 0xFF;

/// Protocol error.
#[derive(Debug, Clone)]
pub enum ProtoError {
    MessageTooLarge(usize),
    MessageTooSmall(usize),
    InvalidPayload(&'static str),
    FieldTooLarge(&'static str, usize),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge(size) => write!(f, "message too large: {size}"),
            Self::MessageTooSmall(size) => write!(f, "message too small: {size}"),
            Self::InvalidPayload(msg) => write!(f, "invalid payload: {msg}"),
            Self::FieldTooLarge(field, size) => {
                write!(f, "payload field too large: {field} ({size} bytes)")
            }
        }
    }
}

impl std::error::Error for ProtoError {}

/// A raw decoded message.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub msg_type: u8,
    pub seq: u32,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// ADD request fields, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_uid: String,
    pub cluster_ip: String,
}

/// ADD response: overlay addresses and the derived hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddResponse {
    pub ipv4: String,
    /// Empty string when the node has no IPv6 overlay address.
    pub ipv6: String,
    pub hostname: String,
}

/// DEL and CHECK carry the same identifying triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
}

/// CHECK response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResponse {
    pub healthy: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn read_u8_at(data: &[u8], offset: usize) -> Option<u8> {
    data.get(offset).copied()
}

fn read_u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes: [u8; 2] = data.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Append a `[2B len][bytes]` string field.
fn put_str(buf: &mut Vec<u8>, field: &'static str, s: &str) -> Result<(), ProtoError> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(ProtoError::FieldTooLarge(field, bytes.len()));
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Read a `[2B len][bytes]` string field, advancing `offset`.
fn take_str(data: &[u8], offset: &mut usize, field: &'static str) -> Result<String, ProtoError> {
    let len = read_u16_at(data, *offset).ok_or(ProtoError::InvalidPayload(field))? as usize;
    let start = *offset + 2;
    let bytes = data
        .get(start..start + len)
        .ok_or(ProtoError::InvalidPayload(field))?;
    let s = std::str::from_utf8(bytes).map_err(|_| ProtoError::InvalidPayload(field))?;
    *offset = start + len;
    Ok(s.to_string())
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a raw message: `[4-byte length][1-byte type][4-byte seq][payload]`.
pub fn encode(msg_type: u8, seq: u32, payload: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let body_len = 1 + 4 + payload.len();
    if body_len > MAX_MESSAGE_SIZE {
        return Err(ProtoError::MessageTooLarge(body_len));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.push(msg_type);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub fn encode_add(req: &AddRequest) -> Result<Vec<u8>, ProtoError> {
    let mut p = Vec::with_capacity(64);
    put_str(&mut p, "container_id", &req.container_id)?;
    put_str(&mut p, "netns", &req.netns)?;
    put_str(&mut p, "ifname", &req.ifname)?;
    put_str(&mut p, "pod_name", &req.pod_name)?;
    put_str(&mut p, "pod_namespace", &req.pod_namespace)?;
    put_str(&mut p, "pod_uid", &req.pod_uid)?;
    put_str(&mut p, "cluster_ip", &req.cluster_ip)?;
    Ok(p)
}

pub fn encode_add_ok(resp: &AddResponse) -> Result<Vec<u8>, ProtoError> {
    let mut p = Vec::with_capacity(48);
    put_str(&mut p, "ipv4", &resp.ipv4)?;
    put_str(&mut p, "ipv6", &resp.ipv6)?;
    put_str(&mut p, "hostname", &resp.hostname)?;
    Ok(p)
}

pub fn encode_pod_ref(r: &PodRef) -> Result<Vec<u8>, ProtoError> {
    let mut p = Vec::with_capacity(48);
    put_str(&mut p, "container_id", &r.container_id)?;
    put_str(&mut p, "netns", &r.netns)?;
    put_str(&mut p, "ifname", &r.ifname)?;
    Ok(p)
}

pub fn encode_check_ok(resp: &CheckResponse) -> Result<Vec<u8>, ProtoError> {
    let mut p = Vec::with_capacity(3 + resp.message.len());
    p.push(u8::from(resp.healthy));
    put_str(&mut p, "message", &resp.message)?;
    Ok(p)
}

/// Encode error payload. Message is truncated to 65535 bytes if longer.
pub fn encode_error(message: &str) -> Vec<u8> {
    let msg = message.as_bytes();
    let msg_len = msg.len().min(u16::MAX as usize);
    let mut p = Vec::with_capacity(2 + msg_len);
    p.extend_from_slice(&(msg_len as u16).to_be_bytes());
    p.extend_from_slice(msg.get(..msg_len).unwrap_or(msg));
    p
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

pub fn decode_add(payload: &[u8]) -> Result<AddRequest, ProtoError> {
    let mut off = 0;
    Ok(AddRequest {
        container_id: take_str(payload, &mut off, "container_id")?,
        netns: take_str(payload, &mut off, "netns")?,
        ifname: take_str(payload, &mut off, "ifname")?,
        pod_name: take_str(payload, &mut off, "pod_name")?,
        pod_namespace: take_str(payload, &mut off, "pod_namespace")?,
        pod_uid: take_str(payload, &mut off, "pod_uid")?,
        cluster_ip: take_str(payload, &mut off, "cluster_ip")?,
    })
}

pub fn decode_add_ok(payload: &[u8]) -> Result<AddResponse, ProtoError> {
    let mut off = 0;
    Ok(AddResponse {
        ipv4: take_str(payload, &mut off, "ipv4")?,
        ipv6: take_str(payload, &mut off, "ipv6")?,
        hostname: take_str(payload, &mut off, "hostname")?,
    })
}

pub fn decode_pod_ref(payload: &[u8]) -> Result<PodRef, ProtoError> {
    let mut off = 0;
    Ok(PodRef {
        container_id: take_str(payload, &mut off, "container_id")?,
        netns: take_str(payload, &mut off, "netns")?,
        ifname: take_str(payload, &mut off, "ifname")?,
    })
}

pub fn decode_check_ok(payload: &[u8]) -> Result<CheckResponse, ProtoError> {
    let healthy = read_u8_at(payload, 0).ok_or(ProtoError::InvalidPayload("healthy"))? == 1;
    let mut off = 1;
    let message = take_str(payload, &mut off, "message")?;
    Ok(CheckResponse { healthy, message })
}

/// Decode error payload. Returns the error message.
pub fn decode_error(payload: &[u8]) -> Result<String, ProtoError> {
    let mut off = 0;
    take_str(payload, &mut off, "error")
}

// ---------------------------------------------------------------------------
// Decoder (buffered, handles partial reads)
// ---------------------------------------------------------------------------

/// Buffered message decoder for streaming data.
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4 * 1024),
        }
    }

    /// Feed data and extract complete messages.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<RawMessage>, ProtoError> {
        self.buf.extend_from_slice(data);
        let mut messages = Vec::new();
        let mut offset = 0;

        while offset + HEADER_SIZE <= self.buf.len() {
            let length = match read_u32_at(&self.buf, offset) {
                Some(v) => v as usize,
                None => break,
            };

            if length > MAX_MESSAGE_SIZE {
                self.buf.clear();
                return Err(ProtoError::MessageTooLarge(length));
            }
            if length < MIN_BODY_SIZE {
                self.buf.clear();
                return Err(ProtoError::MessageTooSmall(length));
            }

            let total = HEADER_SIZE + length;
            if offset + total > self.buf.len() {
                break;
            }

            let msg_type = match read_u8_at(&self.buf, offset + HEADER_SIZE) {
                Some(v) => v,
                None => break,
            };
            let seq = match read_u32_at(&self.buf, offset + HEADER_SIZE + 1) {
                Some(v) => v,
                None => break,
            };
            let payload = self
                .buf
                .get(offset + HEADER_SIZE + MIN_BODY_SIZE..offset + total)
                .unwrap_or_default()
                .to_vec();

            messages.push(RawMessage {
                msg_type,
                seq,
                payload,
            });
            offset += total;
        }

        // Compact: remove consumed bytes once at the end
        if offset > 0 {
            self.buf.drain(..offset);
        }

        Ok(messages)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_add() -> AddRequest {
        AddRequest {
            container_id: "0123456789abcdef".into(),
            netns: "/proc/1234/ns/net".into(),
            ifname: "eth0".into(),
            pod_name: "nginx-deployment-7b5d9c6f8-xyz12".into(),
            pod_namespace: "default".into(),
            pod_uid: "aa-bb-cc".into(),
            cluster_ip: "10.244.0.17".into(),
        }
    }

    #[test]
    fn encode_decode_roundtrip_empty_payload() {
        let data = encode(MSG_DEL_OK, 1, &[]).unwrap();
        let mut dec = Decoder::new();
        let msgs = dec.decode(&data).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_type, MSG_DEL_OK);
        assert_eq!(msgs[0].seq, 1);
        assert!(msgs[0].payload.is_empty());
    }

    #[test]
    fn add_request_roundtrip() {
        let req = sample_add();
        let payload = encode_add(&req).unwrap();
        let decoded = decode_add(&payload).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn add_response_roundtrip_with_ipv6() {
        let resp = AddResponse {
            ipv4: "100.64.0.7".into(),
            ipv6: "fd7a:115c:a1e0::7".into(),
            hostname: "k8s-default-nginx-deployment".into(),
        };
        let payload = encode_add_ok(&resp).unwrap();
        assert_eq!(decode_add_ok(&payload).unwrap(), resp);
    }

    #[test]
    fn add_response_roundtrip_without_ipv6() {
        let resp = AddResponse {
            ipv4: "100.64.0.7".into(),
            ipv6: String::new(),
            hostname: "k8s-default-plex".into(),
        };
        let payload = encode_add_ok(&resp).unwrap();
        assert_eq!(decode_add_ok(&payload).unwrap(), resp);
    }

    #[test]
    fn pod_ref_roundtrip() {
        let r = PodRef {
            container_id: "deadbeef".into(),
            netns: "/var/run/netns/x".into(),
            ifname: "ts0".into(),
        };
        let payload = encode_pod_ref(&r).unwrap();
        assert_eq!(decode_pod_ref(&payload).unwrap(), r);
    }

    #[test]
    fn check_response_roundtrip() {
        let resp = CheckResponse {
            healthy: false,
            message: "backend state is NeedsLogin".into(),
        };
        let payload = encode_check_ok(&resp).unwrap();
        assert_eq!(decode_check_ok(&payload).unwrap(), resp);
    }

    #[test]
    fn error_payload_roundtrip() {
        let payload = encode_error("minting auth key: status 403");
        assert_eq!(decode_error(&payload).unwrap(), "minting auth key: status 403");
    }

    #[test]
    fn decoder_handles_partial_reads() {
        let payload = encode_add(&sample_add()).unwrap();
        let data = encode(MSG_ADD, 7, &payload).unwrap();
        let mut dec = Decoder::new();

        let msgs = dec.decode(&data[..5]).unwrap();
        assert!(msgs.is_empty());

        let msgs = dec.decode(&data[5..]).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_type, MSG_ADD);
        assert_eq!(msgs[0].seq, 7);
        assert_eq!(decode_add(&msgs[0].payload).unwrap(), sample_add());
    }

    #[test]
    fn decoder_handles_multiple_messages() {
        let mut data = encode(MSG_DEL, 1, &encode_pod_ref(&PodRef {
            container_id: "a".into(),
            netns: "b".into(),
            ifname: "c".into(),
        }).unwrap())
        .unwrap();
        data.extend_from_slice(&encode(MSG_DEL_OK, 1, &[]).unwrap());

        let mut dec = Decoder::new();
        let msgs = dec.decode(&data).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].msg_type, MSG_DEL);
        assert_eq!(msgs[1].msg_type, MSG_DEL_OK);
    }

    #[test]
    fn decoder_rejects_too_large() {
        let bad = (2 * MAX_MESSAGE_SIZE as u32).to_be_bytes();
        let mut dec = Decoder::new();
        let err = dec.decode(&bad).unwrap_err();
        assert!(matches!(err, ProtoError::MessageTooLarge(_)));
    }

    #[test]
    fn decoder_rejects_too_small() {
        let bad = 2_u32.to_be_bytes();
        let mut dec = Decoder::new();
        let err = dec.decode(&bad).unwrap_err();
        assert!(matches!(err, ProtoError::MessageTooSmall(2)));
    }

    #[test]
    fn decoder_byte_by_byte() {
        let data = encode(MSG_CHECK_OK, 3, &encode_check_ok(&CheckResponse {
            healthy: true,
            message: "healthy".into(),
        }).unwrap())
        .unwrap();
        let mut dec = Decoder::new();

        for (i, &byte) in data.iter().enumerate() {
            let msgs = dec.decode(&[byte]).unwrap();
            if i < data.len() - 1 {
                assert!(msgs.is_empty());
            } else {
                assert_eq!(msgs.len(), 1);
                assert_eq!(msgs[0].msg_type, MSG_CHECK_OK);
            }
        }
    }

    #[test]
    fn truncated_add_payload_rejected() {
        let payload = encode_add(&sample_add()).unwrap();
        assert!(decode_add(&payload[..payload.len() - 3]).is_err());
    }

    #[test]
    fn field_too_large_rejected() {
        let mut req = sample_add();
        req.pod_name = "x".repeat(u16::MAX as usize + 1);
        let err = encode_add(&req).unwrap_err();
        assert!(matches!(err, ProtoError::FieldTooLarge("pod_name", _)));
    }
}
