// author: kodeholic (powered by Claude)
// DataChannel 프레임 파싱 + 이벤트 디스패치
//
// SCTP user message 하나 = (stream_id, PPID, payload)
//   PPID 50      → DCEP (RFC 8832) : 0x03 OPEN / 0x02 ACK
//   PPID 51, 53  → string / binary 데이터
//   PPID 56, 57  → 빈 string / binary (payload는 자리채움 1바이트, 무시)
//   그 외        → Other (로그만)

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::{NetError, NetResult};

/// Payload Protocol Identifiers for WebRTC
pub mod ppid {
    pub const DCEP:         u32 = 50;
    pub const STRING:       u32 = 51;
    pub const BINARY:       u32 = 53;
    pub const STRING_EMPTY: u32 = 56;
    pub const BINARY_EMPTY: u32 = 57;
}

const DCEP_OPEN: u8 = 0x03;
const DCEP_ACK:  u8 = 0x02;
const DCEP_OPEN_HEADER_LEN: usize = 12;

// ============================================================================
// [프레임]
// ============================================================================

/// DATA_CHANNEL_OPEN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    pub channel_type:      u8,
    pub priority:          u16,
    pub reliability_param: u32,
    pub label:             String,
    pub protocol:          String,
}

impl ChannelOpen {
    /// reliable ordered 채널
    pub fn reliable(label: &str) -> Self {
        Self {
            channel_type:      0x00,
            priority:          0,
            reliability_param: 0,
            label:             label.to_string(),
            protocol:          String::new(),
        }
    }

    /// label / protocol 길이 필드는 u16. 초과하면 잘린 프레임 대신 에러
    pub fn marshal(&self) -> NetResult<Bytes> {
        let label    = self.label.as_bytes();
        let protocol = self.protocol.as_bytes();
        let label_len = u16::try_from(label.len())
            .map_err(|_| NetError::DataChannel(format!("label too long: {} bytes", label.len())))?;
        let protocol_len = u16::try_from(protocol.len())
            .map_err(|_| NetError::DataChannel(format!("protocol too long: {} bytes", protocol.len())))?;

        let mut buf  = BytesMut::with_capacity(DCEP_OPEN_HEADER_LEN + label.len() + protocol.len());
        buf.put_u8(DCEP_OPEN);
        buf.put_u8(self.channel_type);
        buf.put_u16(self.priority);
        buf.put_u32(self.reliability_param);
        buf.put_u16(label_len);
        buf.put_u16(protocol_len);
        buf.put_slice(label);
        buf.put_slice(protocol);
        Ok(buf.freeze())
    }

    fn unmarshal(data: &[u8]) -> NetResult<Self> {
        if data.len() < DCEP_OPEN_HEADER_LEN {
            return Err(NetError::DataChannel(format!("DATA_CHANNEL_OPEN too short: {}", data.len())));
        }

        let label_len    = u16::from_be_bytes([data[8], data[9]]) as usize;
        let protocol_len = u16::from_be_bytes([data[10], data[11]]) as usize;
        let label_end    = DCEP_OPEN_HEADER_LEN + label_len;
        if data.len() < label_end + protocol_len {
            return Err(NetError::DataChannel("DATA_CHANNEL_OPEN truncated".to_string()));
        }

        let label = String::from_utf8(data[DCEP_OPEN_HEADER_LEN..label_end].to_vec())
            .map_err(|_| NetError::DataChannel("label is not UTF-8".to_string()))?;
        let protocol = String::from_utf8(data[label_end..label_end + protocol_len].to_vec())
            .map_err(|_| NetError::DataChannel("protocol is not UTF-8".to_string()))?;

        Ok(Self {
            channel_type:      data[1],
            priority:          u16::from_be_bytes([data[2], data[3]]),
            reliability_param: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            label,
            protocol,
        })
    }
}

/// 디스패처가 이벤트로 올리지 않는 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtherFrame {
    Ack,
    UnknownPpid(u32),
}

/// 파싱된 DataChannel 프레임 (닫힌 열거 — 새 종류는 반드시 여기서 분기)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Open(ChannelOpen),
    Data(Bytes),
    Other(OtherFrame),
}

/// DATA_CHANNEL_ACK (메시지 타입 1바이트)
pub fn ack_frame() -> Bytes {
    Bytes::from_static(&[DCEP_ACK])
}

pub fn parse(ppid_value: u32, payload: &Bytes) -> NetResult<ChannelFrame> {
    match ppid_value {
        ppid::DCEP => match payload.first() {
            Some(&DCEP_OPEN) => Ok(ChannelFrame::Open(ChannelOpen::unmarshal(payload)?)),
            Some(&DCEP_ACK)  => Ok(ChannelFrame::Other(OtherFrame::Ack)),
            Some(other)      => Err(NetError::DataChannel(format!("unknown DCEP type 0x{:02x}", other))),
            None             => Err(NetError::DataChannel("empty DCEP message".to_string())),
        },
        ppid::STRING | ppid::BINARY => Ok(ChannelFrame::Data(payload.clone())),
        ppid::STRING_EMPTY | ppid::BINARY_EMPTY => Ok(ChannelFrame::Data(Bytes::new())),
        other => Ok(ChannelFrame::Other(OtherFrame::UnknownPpid(other))),
    }
}

// ============================================================================
// [이벤트]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelCreated {
    pub stream_id: u16,
    pub label:     String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelMessage {
    pub stream_id: u16,
    pub body:      Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelEvent {
    Created(DataChannelCreated),
    Message(DataChannelMessage),
}

pub type DataChannelEventHandler = Arc<dyn Fn(DataChannelEvent) + Send + Sync>;

// ============================================================================
// [디스패처]
// ============================================================================

pub struct DataChannelDispatcher {
    handler: DataChannelEventHandler,
}

impl DataChannelDispatcher {
    pub fn new(handler: DataChannelEventHandler) -> Self {
        Self { handler }
    }

    pub fn dispatch(&self, stream_id: u16, frame: ChannelFrame) {
        match frame {
            ChannelFrame::Open(open) => {
                debug!("[datachannel] opened stream={} label={}", stream_id, open.label);
                (self.handler)(DataChannelEvent::Created(DataChannelCreated {
                    stream_id,
                    label: open.label,
                }));
            }
            ChannelFrame::Data(body) => {
                trace!("[datachannel] {} bytes on stream={}", body.len(), stream_id);
                (self.handler)(DataChannelEvent::Message(DataChannelMessage { stream_id, body }));
            }
            ChannelFrame::Other(other) => {
                debug!("[datachannel] Unhandled DataChannel message stream={} {:?}", stream_id, other);
            }
        }
    }
}
