// author: kodeholic (powered by Claude)
// SCTP Association 계약 + webrtc-sctp 기반 기본 구현
//
// association → 세션 방향은 콜백 대신 AssociationEvent 채널로만 흐른다.
//   Outbound(packet) : 보낼 바이트가 준비됨 (세션이 marshal → DTLS → 포트)
//   Message(msg)     : user message 재조립 완료 (세션이 DataChannel 파싱)
//
// 기본 구현 흐름:
//   handle_inbound() → SctpConn.recv() → webrtc-sctp Association (server)
//   Association.send → SctpConn.send() → AssociationEvent::Outbound

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc_sctp::association::{Association as SctpCore, Config as SctpConfig};
use webrtc_sctp::chunk::chunk_payload_data::PayloadProtocolIdentifier;
use webrtc_sctp::stream::Stream;

use crate::config;
use crate::error::{NetError, NetResult};

// ============================================================================
// [계약]
// ============================================================================

/// 재조립된 user message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub stream_id: u16,
    pub ppid:      u32,
    pub payload:   Bytes,
}

/// 송신 대기 SCTP 패킷. marshal 실패는 세션에서 로그 후 드롭
pub trait SctpPacket: Send {
    fn marshal(&self) -> NetResult<Bytes>;
}

/// 이미 직렬화가 끝난 패킷
impl SctpPacket for Bytes {
    fn marshal(&self) -> NetResult<Bytes> {
        Ok(self.clone())
    }
}

pub enum AssociationEvent {
    Outbound(Box<dyn SctpPacket>),
    Message(UserMessage),
}

impl std::fmt::Debug for AssociationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationEvent::Outbound(_) => f.write_str("Outbound(..)"),
            AssociationEvent::Message(m)  => f.debug_tuple("Message").field(m).finish(),
        }
    }
}

pub type AssociationEventTx = mpsc::UnboundedSender<AssociationEvent>;

#[async_trait]
pub trait Association: Send + Sync {
    /// DTLS application data (SCTP 패킷) 주입
    async fn handle_inbound(&self, data: Bytes) -> NetResult<()>;

    /// 스트림으로 user message 송신
    async fn send(&self, stream_id: u16, ppid: u32, payload: Bytes) -> NetResult<()>;

    /// 시작 전이거나 이미 닫힌 상태에서도 Ok
    async fn close(&self) -> NetResult<()>;
}

/// 세션 생성 시 이벤트 송신단을 받아 association을 만든다
pub type AssociationFactory = Box<dyn FnOnce(AssociationEventTx) -> NetResult<Arc<dyn Association>> + Send>;

// ============================================================================
// [SctpAssociation] — webrtc-sctp server
// ============================================================================

type Slot = Arc<tokio::sync::Mutex<Option<Arc<SctpCore>>>>;
type StreamMap = Arc<Mutex<HashMap<u16, Arc<Stream>>>>;

pub struct SctpAssociation {
    inbound_tx: mpsc::Sender<Bytes>,
    events:     AssociationEventTx,
    core:       Slot,
    streams:    StreamMap,
    task:       Mutex<Option<JoinHandle<()>>>,
    closed:     AtomicBool,
}

impl SctpAssociation {
    /// tokio 런타임 안에서 호출. 상대 INIT을 기다리는 태스크를 바로 띄운다
    pub fn new(events: AssociationEventTx) -> NetResult<Arc<dyn Association>> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| NetError::NoRuntime)?;

        let (conn, inbound_tx) = SctpConn::new(events.clone());
        let core:    Slot      = Arc::new(tokio::sync::Mutex::new(None));
        let streams: StreamMap = Arc::new(Mutex::new(HashMap::new()));

        let task = runtime.spawn(run_association(
            Arc::new(conn),
            events.clone(),
            Arc::clone(&core),
            Arc::clone(&streams),
        ));

        Ok(Arc::new(Self {
            inbound_tx,
            events,
            core,
            streams,
            task:   Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Association for SctpAssociation {
    async fn handle_inbound(&self, data: Bytes) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        self.inbound_tx.send(data).await
            .map_err(|_| NetError::Sctp("association task gone".to_string()))
    }

    async fn send(&self, stream_id: u16, ppid: u32, payload: Bytes) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }

        let core = self.core.lock().await.clone()
            .ok_or_else(|| NetError::Sctp("association not established".to_string()))?;
        let ppi = PayloadProtocolIdentifier::from(ppid);

        let existing = self.streams.lock().get(&stream_id).cloned();
        let stream = match existing {
            Some(s) => s,
            None    => {
                let s = core.open_stream(stream_id, ppi).await
                    .map_err(|e| NetError::Sctp(format!("open stream {}: {}", stream_id, e)))?;
                // 로컬에서 연 스트림은 accept_stream 으로 오지 않는다. 상대 응답(ACK 등)을 여기서 읽는다
                debug!("[sctp] opened stream={}", stream_id);
                self.streams.lock().insert(stream_id, Arc::clone(&s));
                tokio::spawn(read_stream(Arc::clone(&s), self.events.clone()));
                s
            }
        };

        stream.write_sctp(&payload, ppi).await
            .map_err(|e| NetError::Sctp(format!("write stream {}: {}", stream_id, e)))?;
        Ok(())
    }

    async fn close(&self) -> NetResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let core   = self.core.lock().await.take();
        let result = match core {
            Some(core) => core.close().await.map_err(|e| NetError::Sctp(format!("close: {}", e))),
            None       => {
                debug!("[sctp] close before association was established");
                Ok(())
            }
        };

        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.streams.lock().clear();
        info!("[sctp] association closed");
        result
    }
}

async fn run_association(conn: Arc<SctpConn>, events: AssociationEventTx, slot: Slot, streams: StreamMap) {
    let config = SctpConfig {
        net_conn:                conn,
        max_receive_buffer_size: 0,
        max_message_size:        0,
        mtu:                     config::SCTP_MTU,
        name:                    "session".to_string(),
        remote_port:             config::SCTP_PORT,
        local_port:              config::SCTP_PORT,
    };

    let core = match SctpCore::server(config).await {
        Ok(a)  => Arc::new(a),
        Err(e) => { warn!("[sctp] association failed: {}", e); return; }
    };
    info!("[sctp] association established");
    *slot.lock().await = Some(Arc::clone(&core));

    while let Some(stream) = core.accept_stream().await {
        let stream_id = stream.stream_identifier();
        debug!("[sctp] accepted stream={}", stream_id);
        streams.lock().insert(stream_id, Arc::clone(&stream));
        tokio::spawn(read_stream(stream, events.clone()));
    }
    debug!("[sctp] accept loop finished");
}

async fn read_stream(stream: Arc<Stream>, events: AssociationEventTx) {
    let stream_id = stream.stream_identifier();
    let mut buf   = vec![0u8; config::SCTP_READ_BUF_SIZE];

    loop {
        let (n, ppi) = match stream.read_sctp(&mut buf).await {
            Ok(r)  => r,
            Err(e) => { debug!("[sctp] stream={} read ended: {}", stream_id, e); break; }
        };
        trace!("[sctp] stream={} {} bytes ppid={:?}", stream_id, n, ppi);

        let msg = UserMessage {
            stream_id,
            ppid:    ppi as u32,
            payload: Bytes::copy_from_slice(&buf[..n]),
        };
        if events.send(AssociationEvent::Message(msg)).is_err() {
            break;
        }
    }
}

// ============================================================================
// [SctpConn] — association 하단의 채널 기반 Conn
// ============================================================================

struct SctpConn {
    rx:     tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    events: AssociationEventTx,
}

impl SctpConn {
    fn new(events: AssociationEventTx) -> (Self, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(config::SCTP_INBOUND_QUEUE_SIZE);
        (Self { rx: tokio::sync::Mutex::new(rx), events }, tx)
    }
}

#[async_trait]
impl webrtc_util::Conn for SctpConn {
    async fn connect(&self, _addr: SocketAddr) -> webrtc_util::Result<()> { Ok(()) }

    async fn recv(&self, buf: &mut [u8]) -> webrtc_util::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            None => Err(webrtc_util::Error::Other("sctp inbound channel closed".to_string())),
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc_util::Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, unspecified()))
    }

    async fn send(&self, buf: &[u8]) -> webrtc_util::Result<usize> {
        let packet: Box<dyn SctpPacket> = Box::new(Bytes::copy_from_slice(buf));
        self.events.send(AssociationEvent::Outbound(packet))
            .map_err(|_| webrtc_util::Error::Other("session worker gone".to_string()))?;
        Ok(buf.len())
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc_util::Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> webrtc_util::Result<SocketAddr> { Ok(unspecified()) }

    fn remote_addr(&self) -> Option<SocketAddr> { None }

    async fn close(&self) -> webrtc_util::Result<()> { Ok(()) }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) { self }
}

fn unspecified() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}
