// author: kodeholic (powered by Claude)
// 공유 세션 상태 (피어 연결 1개당 1개)
//
// 소유:
//   ice_pwd / notifier / CertPair / DTLS 세션 / SCTP association
//   SRTP 컨텍스트 레지스트리 / SSRC → buffer transport 맵 / 송신 포트 레지스트리
//
// DTLS·SCTP 쪽에서 올라오는 통지는 콜백이 아니라 채널로 받는다:
//   DtlsEvent        ─┐
//                     ├─▶ 세션 워커 태스크 (1개) ─▶ SCTP 주입 / DTLS 송신 / DataChannel 디스패치
//   AssociationEvent ─┘
//
// 종료 순서: SCTP → DTLS → 워커 (부분 초기화 상태에서도 동일)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rtp::packet::Packet;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc_util::marshal::{Marshal, Unmarshal};

use crate::error::{NetError, NetResult};
use crate::network::datachannel::{self, ppid, ChannelFrame, ChannelOpen, DataChannelDispatcher, DataChannelEventHandler};
use crate::network::dtls::{CertPair, DtlsContext, DtlsEvent, DtlsFactory, DtlsSession, DtlsTransport};
use crate::network::ice::IceNotifier;
use crate::network::port::{Port, PortRegistry};
use crate::network::sctp::{Association, AssociationEvent, AssociationFactory, SctpAssociation, UserMessage};
use crate::network::srtp::{self, SrtpContextRegistry};

/// SSRC 하나당 수신 RTP 를 넘겨받을 송신단을 만들어 주는 팩토리
pub type BufferTransportGenerator = Arc<dyn Fn(u32) -> mpsc::Sender<Packet> + Send + Sync>;

// ============================================================================
// [SessionArgs]
// ============================================================================

pub struct SessionArgs {
    ice_pwd:      Vec<u8>,
    generator:    BufferTransportGenerator,
    handler:      DataChannelEventHandler,
    ice_notifier: Option<IceNotifier>,
    cert_pair:    Option<Arc<CertPair>>,
    dtls:         Option<DtlsFactory>,
    association:  Option<AssociationFactory>,
}

impl SessionArgs {
    pub fn new(
        ice_pwd:   impl Into<Vec<u8>>,
        generator: BufferTransportGenerator,
        handler:   DataChannelEventHandler,
    ) -> Self {
        Self {
            ice_pwd: ice_pwd.into(),
            generator,
            handler,
            ice_notifier: None,
            cert_pair:    None,
            dtls:         None,
            association:  None,
        }
    }

    pub fn with_ice_notifier(mut self, notifier: IceNotifier) -> Self {
        self.ice_notifier = Some(notifier);
        self
    }

    /// 생략 시 세션 생성 때 자체서명 인증서를 새로 만든다
    pub fn with_cert_pair(mut self, cert_pair: Arc<CertPair>) -> Self {
        self.cert_pair = Some(cert_pair);
        self
    }

    /// 생략 시 DtlsSession (passive)
    pub fn with_dtls(mut self, factory: DtlsFactory) -> Self {
        self.dtls = Some(factory);
        self
    }

    /// 생략 시 SctpAssociation (server)
    pub fn with_association(mut self, factory: AssociationFactory) -> Self {
        self.association = Some(factory);
        self
    }
}

// ============================================================================
// [SessionState]
// ============================================================================

pub struct SessionState {
    ice_pwd:           Vec<u8>,
    ice_notifier:      Option<IceNotifier>,
    cert_pair:         Arc<CertPair>,
    dtls:              Arc<dyn DtlsTransport>,
    association:       Arc<dyn Association>,
    generator:         BufferTransportGenerator,
    buffer_transports: Mutex<HashMap<u32, mpsc::Sender<Packet>>>,
    srtp:              Arc<SrtpContextRegistry>,
    ports:             Arc<PortRegistry>,
    worker:            Mutex<Option<JoinHandle<()>>>,
    closed:            AtomicBool,
}

impl SessionState {
    /// tokio 런타임 안에서 호출. 생성된 상태를 그대로 돌려준다
    pub fn new(args: SessionArgs) -> NetResult<Arc<Self>> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| NetError::NoRuntime)?;

        let cert_pair = match args.cert_pair {
            Some(c) => c,
            None    => Arc::new(CertPair::generate()?),
        };
        let ports = Arc::new(PortRegistry::new());
        let srtp  = Arc::new(SrtpContextRegistry::new());

        let (dtls_tx, dtls_rx) = mpsc::unbounded_channel();
        let (sctp_tx, sctp_rx) = mpsc::unbounded_channel();

        let ctx = DtlsContext {
            cert_pair: Arc::clone(&cert_pair),
            egress:    Arc::clone(&ports),
            events:    dtls_tx,
        };
        let dtls = match args.dtls {
            Some(factory) => factory(ctx)?,
            None          => DtlsSession::new(ctx)?,
        };

        let association = match args.association {
            Some(factory) => factory(sctp_tx),
            None          => SctpAssociation::new(sctp_tx),
        };
        let association = match association {
            Ok(a)  => a,
            Err(e) => {
                // 이미 만든 DTLS 세션은 정리하고 실패를 돌려준다
                let dtls = Arc::clone(&dtls);
                runtime.spawn(async move { let _ = dtls.close().await; });
                return Err(e);
            }
        };

        let worker = SessionWorker {
            dtls:        Arc::clone(&dtls),
            association: Arc::clone(&association),
            srtp:        Arc::clone(&srtp),
            dispatcher:  DataChannelDispatcher::new(args.handler),
        };
        let worker = runtime.spawn(worker.run(dtls_rx, sctp_rx));

        info!("[session] created. fingerprint={:.47}...", cert_pair.fingerprint);

        Ok(Arc::new(Self {
            ice_pwd:           args.ice_pwd,
            ice_notifier:      args.ice_notifier,
            cert_pair,
            dtls,
            association,
            generator:         args.generator,
            buffer_transports: Mutex::new(HashMap::new()),
            srtp,
            ports,
            worker:            Mutex::new(Some(worker)),
            closed:            AtomicBool::new(false),
        }))
    }

    pub fn ice_pwd(&self) -> &[u8] {
        &self.ice_pwd
    }

    pub fn ice_notifier(&self) -> Option<IceNotifier> {
        self.ice_notifier.clone()
    }

    pub fn cert_pair(&self) -> &CertPair {
        &self.cert_pair
    }

    pub fn srtp_contexts(&self) -> &SrtpContextRegistry {
        &self.srtp
    }

    pub fn ports(&self) -> Vec<Arc<Port>> {
        self.ports.ports()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 송신 후보 포트 등록. 같은 포트 재등록은 무시
    pub fn register_port(&self, port: Arc<Port>) {
        if self.is_closed() {
            debug!("[session] register_port after close ignored");
            return;
        }
        self.ports.register(port);
    }

    // ------------------------------------------------------------------------
    // [수신 경로] — 포트 읽기 루프에서 호출
    // ------------------------------------------------------------------------

    pub(crate) async fn handle_dtls(&self, remote: SocketAddr, record: Bytes) {
        if self.is_closed() { return; }
        if let Err(e) = self.dtls.handle_record(remote, record).await {
            debug!("[session] dtls record from {} dropped: {}", remote, e);
        }
    }

    pub(crate) async fn handle_egress_ready(&self) {
        if self.is_closed() { return; }
        if let Err(e) = self.dtls.on_egress_ready().await {
            debug!("[session] pending dtls records dropped: {}", e);
        }
    }

    pub(crate) fn handle_srtp(&self, remote: SocketAddr, packet: &[u8]) {
        if self.is_closed() { return; }

        let rtcp = srtp::is_rtcp(packet);
        let ssrc = match srtp::packet_ssrc(packet, rtcp) {
            Some(s) => s,
            None    => { debug!("[srtp] short packet from {}", remote); return; }
        };

        let ctx = match self.srtp.get_or_create(remote.ip(), remote.port(), ssrc) {
            Ok(c)  => c,
            Err(e) => { debug!("[srtp] no context ssrc={} from {}: {}", ssrc, remote, e); return; }
        };

        if rtcp {
            match ctx.decrypt_rtcp(packet) {
                Ok(plain) => trace!("[srtp] rtcp {} bytes ssrc={} from {}", plain.len(), ssrc, remote),
                Err(e)    => debug!("[srtp] {}", e),
            }
            return;
        }

        let mut plain = match ctx.decrypt_rtp(packet) {
            Ok(p)  => p,
            Err(e) => { debug!("[srtp] {}", e); return; }
        };
        let rtp_packet = match Packet::unmarshal(&mut plain) {
            Ok(p)  => p,
            Err(e) => { debug!("[srtp] rtp parse failed ssrc={}: {}", ssrc, e); return; }
        };
        self.deliver(ssrc, rtp_packet);
    }

    // ------------------------------------------------------------------------
    // buffer transport 전달
    //
    // bounded 송신단에 try_send:
    //   Full   → 이번 패킷 드롭 (소비자가 느림)
    //   Closed → 드롭 + 맵에서 제거 (다음 패킷에서 generator 재호출)
    // ------------------------------------------------------------------------
    fn deliver(&self, ssrc: u32, packet: Packet) {
        let existing = self.buffer_transports.lock().get(&ssrc).cloned();
        let sender = match existing {
            Some(s) => s,
            None    => {
                let fresh = (self.generator)(ssrc);
                self.buffer_transports.lock().entry(ssrc).or_insert(fresh).clone()
            }
        };

        match sender.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!("[session] buffer transport full ssrc={}, dropping", ssrc);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("[session] buffer transport closed ssrc={}, dropping", ssrc);
                self.buffer_transports.lock().remove(&ssrc);
            }
        }
    }

    // ------------------------------------------------------------------------
    // [송신 경로]
    // ------------------------------------------------------------------------

    /// DataChannel 메시지 송신. 빈 본문은 RFC 8831 §6.6 의 EMPTY PPID 로 보낸다
    pub async fn send_data_channel_message(&self, stream_id: u16, ppid_value: u32, body: Bytes) -> NetResult<()> {
        if self.is_closed() { return Err(NetError::Closed); }

        let (ppid_value, body) = match (ppid_value, body.is_empty()) {
            (ppid::STRING, true) => (ppid::STRING_EMPTY, Bytes::from_static(&[0])),
            (ppid::BINARY, true) => (ppid::BINARY_EMPTY, Bytes::from_static(&[0])),
            _                    => (ppid_value, body),
        };
        self.association.send(stream_id, ppid_value, body).await
    }

    /// DATA_CHANNEL_OPEN 송신 (reliable ordered)
    pub async fn open_data_channel(&self, stream_id: u16, label: &str) -> NetResult<()> {
        if self.is_closed() { return Err(NetError::Closed); }
        let open = ChannelOpen::reliable(label).marshal()?;
        self.association.send(stream_id, ppid::DCEP, open).await
    }

    /// RTP 암호화 후 선택된 포트로 송신
    /// 컨텍스트 키는 (SSRC, 선택된 상대 주소)
    pub async fn write_rtp(&self, packet: &Packet) -> NetResult<()> {
        if self.is_closed() { return Err(NetError::Closed); }

        let raw  = packet.marshal().map_err(|e| NetError::Rtp(e.to_string()))?;
        let port = self.ports.select_connected().ok_or(NetError::NoConnectedPort)?;
        let peer = port.selected_peer().ok_or(NetError::NoConnectedPort)?;

        let ctx    = self.srtp.get_or_create(peer.ip(), peer.port(), packet.header.ssrc)?;
        let cipher = ctx.encrypt_rtp(&raw)?;
        port.send_to_selected(&cipher).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // [종료]
    // ------------------------------------------------------------------------

    /// SCTP → DTLS → 워커 순서로 정리. 아무것도 시작되지 않았어도 Ok, 재호출도 Ok
    pub async fn close(&self) -> NetResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let sctp_result = self.association.close().await;
        if let Err(e) = &sctp_result {
            warn!("[session] sctp close: {}", e);
        }
        let dtls_result = self.dtls.close().await;
        if let Err(e) = &dtls_result {
            warn!("[session] dtls close: {}", e);
        }

        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        self.srtp.clear();
        self.buffer_transports.lock().clear();
        self.ports.clear();

        info!("[session] closed");
        sctp_result.and(dtls_result)
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

// ============================================================================
// [SessionWorker] — DTLS/SCTP 이벤트 단일 소비자
// ============================================================================

struct SessionWorker {
    dtls:        Arc<dyn DtlsTransport>,
    association: Arc<dyn Association>,
    srtp:        Arc<SrtpContextRegistry>,
    dispatcher:  DataChannelDispatcher,
}

impl SessionWorker {
    async fn run(
        self,
        mut dtls_rx: mpsc::UnboundedReceiver<DtlsEvent>,
        mut sctp_rx: mpsc::UnboundedReceiver<AssociationEvent>,
    ) {
        loop {
            tokio::select! {
                Some(ev) = dtls_rx.recv() => self.on_dtls_event(ev).await,
                Some(ev) = sctp_rx.recv() => self.on_association_event(ev).await,
                else => break,
            }
        }
        debug!("[session] worker finished");
    }

    async fn on_dtls_event(&self, event: DtlsEvent) {
        match event {
            DtlsEvent::HandshakeComplete(keys) => {
                info!("[session] dtls established, installing SRTP keys {:?}", keys);
                self.srtp.install_keys(keys);
            }
            DtlsEvent::ApplicationData(data) => {
                if let Err(e) = self.association.handle_inbound(data).await {
                    warn!("[session] sctp inbound dropped: {}", e);
                }
            }
        }
    }

    async fn on_association_event(&self, event: AssociationEvent) {
        match event {
            AssociationEvent::Outbound(packet) => {
                let raw = match packet.marshal() {
                    Ok(r)  => r,
                    Err(e) => { warn!("[session] sctp marshal failed, dropping: {}", e); return; }
                };
                if let Err(e) = self.dtls.write(raw).await {
                    warn!("[session] outbound sctp packet dropped: {}", e);
                }
            }
            AssociationEvent::Message(msg) => self.on_user_message(msg).await,
        }
    }

    async fn on_user_message(&self, msg: UserMessage) {
        let frame = match datachannel::parse(msg.ppid, &msg.payload) {
            Ok(f)  => f,
            Err(e) => { warn!("[datachannel] parse failed stream={}: {}", msg.stream_id, e); return; }
        };

        if let ChannelFrame::Open(_) = &frame {
            if let Err(e) = self.association.send(msg.stream_id, ppid::DCEP, datachannel::ack_frame()).await {
                warn!("[datachannel] ACK failed stream={}: {}", msg.stream_id, e);
            }
        }
        self.dispatcher.dispatch(msg.stream_id, frame);
    }
}
