// author: kodeholic (powered by Claude)
//
// 통합 테스트 공용 헬퍼
//
// FramedDtls        : 암호화 없는 가짜 DTLS. 첫 바이트로 레코드 종류 구분
//                       0x16 + 60바이트 keying material → HandshakeComplete
//                       0x17 + payload                  → ApplicationData
// LoopbackAssociation : 가짜 SCTP. user message 를 [u16 stream][u32 ppid][payload] 로 직렬화

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use mini_rtcsession::error::{NetError, NetResult};
use mini_rtcsession::network::{
    Association, AssociationEvent, AssociationFactory, DataChannelEvent, DtlsContext, DtlsEvent,
    DtlsFactory, DtlsTransport, IceConnectionState, PortRegistry, SctpPacket, SessionArgs,
    SessionState, SrtpKeys, UserMessage,
};
use parking_lot::Mutex;
use rtp::packet::Packet;
use stun::agent::TransactionId;
use stun::attributes::ATTR_USERNAME;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::{Message, BINDING_REQUEST};
use stun::textattrs::TextAttribute;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub const ICE_PWD: &str = "JWkoErHflRPGsKEIrqdGfuwEtffHoqRV";
pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(200);

pub const RECORD_HANDSHAKE: u8 = 0x16;
pub const RECORD_APP_DATA:  u8 = 0x17;

pub type CloseLog = Arc<Mutex<Vec<&'static str>>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ----------------------------------------------------------------------------
// [FramedDtls]
// ----------------------------------------------------------------------------

pub struct FramedDtls {
    egress: Arc<PortRegistry>,
    events: mpsc::UnboundedSender<DtlsEvent>,
    log:    CloseLog,
}

#[async_trait]
impl DtlsTransport for FramedDtls {
    async fn handle_record(&self, _remote: SocketAddr, record: Bytes) -> NetResult<()> {
        match record.first() {
            Some(&RECORD_HANDSHAKE) => {
                let keys = SrtpKeys::from_keying_material(&record[1..], false)?;
                let _ = self.events.send(DtlsEvent::HandshakeComplete(keys));
            }
            Some(&RECORD_APP_DATA) => {
                let _ = self.events.send(DtlsEvent::ApplicationData(record.slice(1..)));
            }
            _ => return Err(NetError::Dtls("unsupported record".to_string())),
        }
        Ok(())
    }

    async fn write(&self, data: Bytes) -> NetResult<()> {
        let mut record = BytesMut::with_capacity(data.len() + 1);
        record.put_u8(RECORD_APP_DATA);
        record.put_slice(&data);
        self.egress.transmit(&record).await?;
        Ok(())
    }

    async fn close(&self) -> NetResult<()> {
        self.log.lock().push("dtls");
        Ok(())
    }
}

pub fn framed_dtls(log: CloseLog) -> DtlsFactory {
    Box::new(move |ctx: DtlsContext| -> NetResult<Arc<dyn DtlsTransport>> {
        let dtls: Arc<dyn DtlsTransport> = Arc::new(FramedDtls {
            egress: ctx.egress,
            events: ctx.events,
            log,
        });
        Ok(dtls)
    })
}

// ----------------------------------------------------------------------------
// [LoopbackAssociation]
// ----------------------------------------------------------------------------

pub fn frame(stream_id: u16, ppid: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + payload.len());
    buf.put_u16(stream_id);
    buf.put_u32(ppid);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn unframe(raw: &[u8]) -> Option<UserMessage> {
    if raw.len() < 6 { return None; }
    Some(UserMessage {
        stream_id: u16::from_be_bytes([raw[0], raw[1]]),
        ppid:      u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]),
        payload:   Bytes::copy_from_slice(&raw[6..]),
    })
}

/// 직렬화가 항상 실패하는 패킷
struct BrokenPacket;

impl SctpPacket for BrokenPacket {
    fn marshal(&self) -> NetResult<Bytes> {
        Err(NetError::Sctp("broken packet".to_string()))
    }
}

pub struct LoopbackAssociation {
    events:      mpsc::UnboundedSender<AssociationEvent>,
    log:         CloseLog,
    break_first: AtomicBool,
}

#[async_trait]
impl Association for LoopbackAssociation {
    async fn handle_inbound(&self, data: Bytes) -> NetResult<()> {
        let msg = unframe(&data).ok_or_else(|| NetError::Sctp("short frame".to_string()))?;
        self.events.send(AssociationEvent::Message(msg)).map_err(|_| NetError::Closed)
    }

    async fn send(&self, stream_id: u16, ppid: u32, payload: Bytes) -> NetResult<()> {
        let packet: Box<dyn SctpPacket> = if self.break_first.swap(false, Ordering::AcqRel) {
            Box::new(BrokenPacket)
        } else {
            Box::new(frame(stream_id, ppid, &payload))
        };
        self.events.send(AssociationEvent::Outbound(packet)).map_err(|_| NetError::Closed)
    }

    async fn close(&self) -> NetResult<()> {
        self.log.lock().push("sctp");
        Ok(())
    }
}

pub fn loopback_association(log: CloseLog, break_first: bool) -> AssociationFactory {
    Box::new(move |events: mpsc::UnboundedSender<AssociationEvent>| -> NetResult<Arc<dyn Association>> {
        let assoc: Arc<dyn Association> = Arc::new(LoopbackAssociation {
            events,
            log,
            break_first: AtomicBool::new(break_first),
        });
        Ok(assoc)
    })
}

// ----------------------------------------------------------------------------
// [세션 하네스]
// ----------------------------------------------------------------------------

pub struct Harness {
    pub state:     Arc<SessionState>,
    pub events:    mpsc::UnboundedReceiver<DataChannelEvent>,
    pub media:     mpsc::Receiver<Packet>,
    pub ice:       mpsc::UnboundedReceiver<(SocketAddr, IceConnectionState)>,
    pub close_log: CloseLog,
}

pub fn session_args() -> (
    SessionArgs,
    mpsc::UnboundedReceiver<DataChannelEvent>,
    mpsc::Receiver<Packet>,
    mpsc::UnboundedReceiver<(SocketAddr, IceConnectionState)>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (media_tx, media_rx) = mpsc::channel(16);
    let (ice_tx, ice_rx)     = mpsc::unbounded_channel();

    let args = SessionArgs::new(
        ICE_PWD,
        Arc::new(move |_ssrc: u32| media_tx.clone()),
        Arc::new(move |ev: DataChannelEvent| { let _ = event_tx.send(ev); }),
    )
    .with_ice_notifier(Arc::new(move |addr: SocketAddr, st: IceConnectionState| { let _ = ice_tx.send((addr, st)); }));

    (args, event_rx, media_rx, ice_rx)
}

pub fn fake_session(break_first_packet: bool) -> Harness {
    let close_log: CloseLog = Arc::new(Mutex::new(Vec::new()));
    let (args, events, media, ice) = session_args();
    let args = args
        .with_dtls(framed_dtls(Arc::clone(&close_log)))
        .with_association(loopback_association(Arc::clone(&close_log), break_first_packet));

    let state = SessionState::new(args).expect("세션 생성 실패");
    Harness { state, events, media, ice, close_log }
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().expect("주소 파싱 실패")
}

// ----------------------------------------------------------------------------
// [원격 피어]
// ----------------------------------------------------------------------------

pub fn binding_request(pwd: &str) -> Vec<u8> {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(TextAttribute::new(ATTR_USERNAME, "session:peer".to_owned())),
        Box::new(MessageIntegrity::new_short_term_integrity(pwd.to_owned())),
        Box::new(FINGERPRINT),
    ])
    .expect("STUN 요청 생성 실패");
    m.raw
}

pub fn is_binding_success(raw: &[u8]) -> bool {
    raw.len() >= 20 && raw[0] == 0x01 && raw[1] == 0x01
}

pub struct Peer {
    pub socket: UdpSocket,
}

impl Peer {
    pub async fn new() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("피어 소켓 바인드 실패");
        Self { socket }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("피어 주소 확인 실패")
    }

    pub async fn send(&self, to: SocketAddr, data: &[u8]) {
        self.socket.send_to(data, to).await.expect("피어 송신 실패");
    }

    /// 대기 시간 안에 아무것도 안 오면 None
    pub async fn recv_within(&self, wait: Duration) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 2048];
        match tokio::time::timeout(wait, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => Some(buf[..n].to_vec()),
            _              => None,
        }
    }

    pub async fn recv(&self) -> Vec<u8> {
        self.recv_within(WAIT).await.expect("피어 수신 타임아웃")
    }

    /// Binding Request → Success Response 까지 (포트가 Connected 로 전이)
    pub async fn connect(&self, port_addr: SocketAddr) {
        self.send(port_addr, &binding_request(ICE_PWD)).await;
        let resp = self.recv().await;
        assert!(is_binding_success(&resp), "Binding Success Response 가 와야 합니다.");
    }

    /// 가짜 DTLS 핸드셰이크 완료 레코드 전송
    pub async fn complete_handshake(&self, port_addr: SocketAddr, material: &[u8]) {
        let mut record = vec![RECORD_HANDSHAKE];
        record.extend_from_slice(material);
        self.send(port_addr, &record).await;
    }

    /// 가짜 DTLS application data 로 SCTP user message 전송
    pub async fn send_user_message(&self, port_addr: SocketAddr, stream_id: u16, ppid: u32, payload: &[u8]) {
        let mut record = vec![RECORD_APP_DATA];
        record.extend_from_slice(&frame(stream_id, ppid, payload));
        self.send(port_addr, &record).await;
    }

    /// 0x17 레코드를 받아 user message 로 해석
    pub async fn recv_user_message(&self) -> UserMessage {
        let raw = self.recv().await;
        assert_eq!(raw.first(), Some(&RECORD_APP_DATA), "application data 레코드여야 합니다.");
        unframe(&raw[1..]).expect("프레임 해석 실패")
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<DataChannelEvent>) -> DataChannelEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("이벤트 대기 타임아웃")
        .expect("이벤트 채널 닫힘")
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "조건 대기 타임아웃");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn keying_material() -> Vec<u8> {
    (0..60u8).map(|b| b.wrapping_mul(7).wrapping_add(3)).collect()
}
