// author: kodeholic (powered by Claude)
// UDP 포트 + 송신 포트 레지스트리
//
// 패킷 수신 흐름 (포트마다 독립 태스크):
//   recv_from(src_addr)
//     → seen_peers 갱신
//     → 패킷 타입 판별 (STUN / DTLS / SRTP)
//     → STUN : ice_pwd 검증 → selected_peer 지정 → Connected → Binding Response
//     → DTLS : SessionState.handle_dtls()
//     → SRTP : SessionState.handle_srtp()
//
// 포트는 세션을 Weak으로만 참조 — 세션 상태를 소유하거나 변경하지 않는다.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config;
use crate::error::{NetError, NetResult};
use crate::network::ice::{self, IceConnectionState, IceNotifier};
use crate::network::state::SessionState;

// ----------------------------------------------------------------------------
// [패킷 타입 판별]
//
// RFC 7983 §7 demultiplexing:
//   [0,   3]  → STUN
//   [16,  19] → ZRTP  (무시)
//   [20,  63] → DTLS
//   [64, 127] → TURN  (무시)
//   [128,191] → RTP/RTCP
//   [192,255] → 기타
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Stun,
    Dtls,
    Srtp,
    Unknown,
}

#[inline]
pub fn classify(buf: &[u8]) -> PacketKind {
    match buf.first() {
        Some(b) if *b <= 3                => PacketKind::Stun,
        Some(b) if (20..=63).contains(b)  => PacketKind::Dtls,
        Some(b) if (128..=191).contains(b) => PacketKind::Srtp,   // RTP+RTCP 모두
        _                                 => PacketKind::Unknown,
    }
}

// ============================================================================
// [Port]
// ============================================================================

pub struct Port {
    local_addr:    SocketAddr,
    socket:        Mutex<Option<Arc<UdpSocket>>>,
    ice_state:     Mutex<IceConnectionState>,
    seen_peers:    Mutex<HashSet<SocketAddr>>,
    selected_peer: Mutex<Option<SocketAddr>>,
    state:         Weak<SessionState>,
    notifier:      Option<IceNotifier>,
    closed:        AtomicBool,
    shutdown:      watch::Sender<bool>,
}

impl Port {
    /// 소켓 바인드 후 읽기 루프를 즉시 시작
    /// 세션이 없거나(이미 drop) 바인드/주소 확인 실패 시 포트는 만들어지지 않는다
    pub async fn bind(address: SocketAddr, state: Weak<SessionState>) -> NetResult<Arc<Port>> {
        let session = state.upgrade().ok_or(NetError::StateUnavailable)?;

        let socket = UdpSocket::bind(address).await.map_err(NetError::Bind)?;
        let local_addr = socket.local_addr()
            .map_err(|e| NetError::AddressResolution(e.to_string()))?;
        if local_addr.port() == 0 {
            return Err(NetError::AddressResolution(format!("no port assigned for {}", address)));
        }

        let socket = Arc::new(socket);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let port = Arc::new(Port {
            local_addr,
            socket:        Mutex::new(Some(Arc::clone(&socket))),
            ice_state:     Mutex::new(IceConnectionState::New),
            seen_peers:    Mutex::new(HashSet::new()),
            selected_peer: Mutex::new(None),
            notifier:      session.ice_notifier(),
            state,
            closed:        AtomicBool::new(false),
            shutdown,
        });

        tokio::spawn(read_loop(Arc::downgrade(&port), socket, shutdown_rx));
        info!("[port] listening on {}", local_addr);
        Ok(port)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ice_state(&self) -> IceConnectionState {
        *self.ice_state.lock()
    }

    pub fn seen_peers(&self) -> Vec<SocketAddr> {
        self.seen_peers.lock().iter().copied().collect()
    }

    pub fn selected_peer(&self) -> Option<SocketAddr> {
        *self.selected_peer.lock()
    }

    /// 송신 가능: Connected + 상대 주소 확정
    pub fn is_connected(&self) -> bool {
        self.ice_state() == IceConnectionState::Connected && self.selected_peer().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 외부 ICE 에이전트용 상태 전이. Closed 이후로는 바뀌지 않는다
    pub fn set_ice_state(&self, next: IceConnectionState) {
        let changed = {
            let mut current = self.ice_state.lock();
            if *current == next || *current == IceConnectionState::Closed {
                false
            } else {
                *current = next;
                true
            }
        };

        if changed {
            info!("[port] {} ice state -> {}", self.local_addr, next);
            if let Some(notify) = &self.notifier {
                notify(self.local_addr, next);
            }
        }
    }

    /// 소켓 해제 + 읽기 루프 깨우기. 두 번째 호출부터는 아무 일도 하지 않는다
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        self.socket.lock().take();
        self.set_ice_state(IceConnectionState::Closed);
        info!("[port] {} closed", self.local_addr);
    }

    /// selected_peer 로 송신. 보낸 상대 주소 반환
    pub async fn send_to_selected(&self, data: &[u8]) -> NetResult<SocketAddr> {
        let peer   = self.selected_peer().ok_or(NetError::NoConnectedPort)?;
        let socket = self.socket.lock().clone().ok_or(NetError::Closed)?;
        socket.send_to(data, peer).await?;
        trace!("[port] {} sent {} bytes to {}", self.local_addr, data.len(), peer);
        Ok(peer)
    }

    async fn handle_datagram(&self, packet: Bytes, src_addr: SocketAddr) {
        let session = match self.state.upgrade() {
            Some(s) => s,
            None    => { debug!("[port] session gone, dropping datagram from {}", src_addr); return; }
        };

        self.seen_peers.lock().insert(src_addr);

        let kind = classify(&packet);
        trace!("[port] {} bytes from {} kind={:?}", packet.len(), src_addr, kind);

        match kind {
            PacketKind::Stun    => self.handle_stun(&session, &packet, src_addr).await,
            PacketKind::Dtls    => session.handle_dtls(src_addr, packet).await,
            PacketKind::Srtp    => session.handle_srtp(src_addr, &packet),
            PacketKind::Unknown => {
                debug!("[port] unknown packet type from {} byte0={:?}", src_addr, packet.first());
            }
        }
    }

    // ------------------------------------------------------------------------
    // [STUN 핸들러]
    //
    // ICE-lite: 상대의 Binding Request에만 응답한다.
    // 인증 통과한 송신자가 곧 이 포트의 selected_peer
    // ------------------------------------------------------------------------
    async fn handle_stun(&self, session: &SessionState, packet: &[u8], src_addr: SocketAddr) {
        let request = match ice::verify_binding_request(packet, session.ice_pwd()) {
            Ok(r)  => r,
            Err(e) => { debug!("[stun] dropping from {}: {}", src_addr, e); return; }
        };

        let resp = match ice::make_binding_response(packet, src_addr, session.ice_pwd()) {
            Some(r) => r,
            None    => { debug!("[stun] cannot build response for {}", src_addr); return; }
        };

        let previous = self.selected_peer.lock().replace(src_addr);
        if previous != Some(src_addr) {
            debug!("[stun] selected peer {} username={:?}", src_addr, request.username);
        }
        self.set_ice_state(IceConnectionState::Connected);

        let socket = self.socket.lock().clone();
        if let Some(socket) = socket {
            if let Err(e) = socket.send_to(&resp, src_addr).await {
                warn!("[stun] response failed: {}", e);
            } else {
                trace!("[stun] Binding Response sent to {}", src_addr);
            }
        }

        // latch 완료. STUN 보다 먼저 온 DTLS 레코드가 있으면 이제 핸드셰이크 시작
        session.handle_egress_ready().await;
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("local_addr", &self.local_addr)
            .field("ice_state", &self.ice_state())
            .field("selected_peer", &self.selected_peer())
            .finish()
    }
}

async fn read_loop(port: Weak<Port>, socket: Arc<UdpSocket>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; config::UDP_RECV_BUF_SIZE];

    loop {
        let (len, src_addr) = tokio::select! {
            biased;
            // close() 또는 Port drop (sender drop → Err)
            _ = shutdown.changed() => break,
            r = socket.recv_from(&mut buf) => match r {
                Ok(r)  => r,
                Err(e) => {
                    warn!("[port] recv_from failed: {}", e);
                    if let Some(port) = port.upgrade() {
                        port.set_ice_state(IceConnectionState::Failed);
                    }
                    break;
                }
            },
        };

        if len == 0 { continue; }

        let port = match port.upgrade() {
            Some(p) => p,
            None    => break,
        };
        port.handle_datagram(Bytes::copy_from_slice(&buf[..len]), src_addr).await;
    }
    debug!("[port] read loop finished");
}

// ============================================================================
// [PortRegistry] — 송신 가능 포트 집합
//
// 선택 정책: 등록 순서상 첫 번째 is_connected() 포트.
// 없으면 NoConnectedPort — 큐잉하지 않고 호출자가 드롭한다.
// 락은 목록 복사/탐색 동안만 보유, await 전에 해제
// ============================================================================

pub struct PortRegistry {
    ports: RwLock<Vec<Arc<Port>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self { ports: RwLock::new(Vec::new()) }
    }

    /// 같은 포트 재등록은 무시. 새로 추가되면 true
    pub fn register(&self, port: Arc<Port>) -> bool {
        let mut ports = self.ports.write();
        if ports.iter().any(|p| Arc::ptr_eq(p, &port)) {
            return false;
        }
        debug!("[port] registered {} for outbound", port.local_addr());
        ports.push(port);
        true
    }

    pub fn ports(&self) -> Vec<Arc<Port>> {
        self.ports.read().clone()
    }

    pub fn len(&self) -> usize {
        self.ports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.read().is_empty()
    }

    pub fn select_connected(&self) -> Option<Arc<Port>> {
        self.ports.read().iter().find(|p| p.is_connected()).cloned()
    }

    pub fn first_connected_addr(&self) -> Option<SocketAddr> {
        self.select_connected().map(|p| p.local_addr())
    }

    /// 선택된 포트 하나로만 송신
    pub async fn transmit(&self, data: &[u8]) -> NetResult<SocketAddr> {
        let port = self.select_connected().ok_or(NetError::NoConnectedPort)?;
        port.send_to_selected(data).await
    }

    pub fn clear(&self) {
        self.ports.write().clear();
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}
