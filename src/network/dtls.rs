// author: kodeholic (powered by Claude)
// DTLS Passive 세션 모듈
//
// 역할:
//   1. 세션 생성 시 자체서명 인증서 생성 (CertPair, 세션당 1회)
//   2. 첫 DTLS 레코드 수신 → passive 핸드셰이크 태스크 시작, 이후 레코드는 채널 주입
//      연결된 포트가 아직 없으면(STUN 보다 DTLS 가 먼저 도착) pending 큐에 보관했다가
//      on_egress_ready() 에서 꺼내 핸드셰이크를 시작한다
//   3. 핸드셰이크 완료 → RFC 5705 키 도출 → DtlsEvent::HandshakeComplete
//   4. application data 읽기 루프 → DtlsEvent::ApplicationData (SCTP 바이트)
//
// 송신 레코드는 ConnAdapter.send() → PortRegistry 선택 정책으로 나간다.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dtls::conn::DTLSConn;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc_util::KeyingMaterialExporter;

use crate::config;
use crate::error::{NetError, NetResult};
use crate::network::port::PortRegistry;
use crate::network::srtp::{SrtpKeys, SRTP_KEY_MATERIAL_LEN, SRTP_MASTER_KEY_LABEL};

// ============================================================================
// [계약]
// ============================================================================

#[derive(Debug)]
pub enum DtlsEvent {
    /// 핸드셰이크 완료 — SRTP 키 확정
    HandshakeComplete(SrtpKeys),
    /// 복호화된 application data (SCTP 패킷)
    ApplicationData(Bytes),
}

pub type DtlsEventTx = mpsc::UnboundedSender<DtlsEvent>;

#[async_trait]
pub trait DtlsTransport: Send + Sync {
    /// 포트가 DTLS로 분류한 레코드 주입
    async fn handle_record(&self, remote: SocketAddr, record: Bytes) -> NetResult<()>;

    /// application data 암호화 후 송신
    async fn write(&self, data: Bytes) -> NetResult<()>;

    /// 핸드셰이크 전이어도 Ok
    async fn close(&self) -> NetResult<()>;

    /// 송신 가능한 포트가 생김 (STUN latch 직후). 보관해 둔 레코드가 있으면 처리
    async fn on_egress_ready(&self) -> NetResult<()> {
        Ok(())
    }
}

/// DTLS 구현이 세션으로부터 받는 것들
pub struct DtlsContext {
    pub cert_pair: Arc<CertPair>,
    pub egress:    Arc<PortRegistry>,
    pub events:    DtlsEventTx,
}

pub type DtlsFactory = Box<dyn FnOnce(DtlsContext) -> NetResult<Arc<dyn DtlsTransport>> + Send>;

// ============================================================================
// [CertPair]
// ============================================================================

pub struct CertPair {
    pub certificate: dtls::crypto::Certificate,
    pub fingerprint: String,
}

impl CertPair {
    pub fn generate() -> NetResult<Self> {
        let certificate = dtls::crypto::Certificate::generate_self_signed(
            vec![config::CERT_SUBJECT.to_string()]
        ).map_err(|e| NetError::Dtls(format!("certificate generation failed: {}", e)))?;

        let cert_der: Vec<u8> = certificate.certificate
            .first()
            .map(|c| c.to_vec())
            .unwrap_or_default();

        let fingerprint = sha256_fingerprint(&cert_der);
        info!("[dtls] cert generated. fingerprint={:.47}...", fingerprint);

        Ok(Self { certificate, fingerprint })
    }
}

// ============================================================================
// [DtlsSession]
// ============================================================================

pub type DtlsPacketTx = mpsc::Sender<Bytes>;

type ConnSlot = Arc<tokio::sync::Mutex<Option<Arc<DTLSConn>>>>;

// 핸드셰이크 상대 주소 + 레코드 주입 채널 (첫 레코드에서 확정, 핸드셰이크 실패 시 해제)
type InboundSlot = Arc<Mutex<Option<(SocketAddr, DtlsPacketTx)>>>;

pub struct DtlsSession {
    cert_pair: Arc<CertPair>,
    egress:    Arc<PortRegistry>,
    events:    DtlsEventTx,
    inbound:   InboundSlot,
    // 연결된 포트가 생기기 전에 도착한 레코드
    pending:   Mutex<VecDeque<(SocketAddr, Bytes)>>,
    conn:      ConnSlot,
    task:      Mutex<Option<JoinHandle<()>>>,
    closed:    AtomicBool,
}

impl DtlsSession {
    pub fn new(ctx: DtlsContext) -> NetResult<Arc<dyn DtlsTransport>> {
        Ok(Arc::new(Self::from_context(ctx)))
    }

    fn from_context(ctx: DtlsContext) -> Self {
        Self {
            cert_pair: ctx.cert_pair,
            egress:    ctx.egress,
            events:    ctx.events,
            inbound:   Arc::new(Mutex::new(None)),
            pending:   Mutex::new(VecDeque::new()),
            conn:      Arc::new(tokio::sync::Mutex::new(None)),
            task:      Mutex::new(None),
            closed:    AtomicBool::new(false),
        }
    }

    /// 신규 세션: 어댑터 + 핸드셰이크 태스크 생성 후 주입 채널 반환
    fn start_handshake(&self, remote: SocketAddr) -> DtlsPacketTx {
        let (adapter, pkt_tx) = ConnAdapter::new(Arc::clone(&self.egress), remote);

        let task = tokio::spawn(run_session(
            Arc::new(adapter),
            Arc::clone(&self.cert_pair),
            self.events.clone(),
            Arc::clone(&self.conn),
            Arc::clone(&self.inbound),
            pkt_tx.clone(),
            remote,
        ));
        *self.task.lock() = Some(task);

        info!("[dtls] new session for remote={}", remote);
        pkt_tx
    }

    /// 핸드셰이크 응답을 보낼 포트가 없으면 보관. 큐가 차면 새 레코드를 버린다
    fn enqueue_pending(&self, remote: SocketAddr, record: Bytes) {
        let mut pending = self.pending.lock();
        if pending.len() >= config::DTLS_PACKET_QUEUE_SIZE {
            debug!("[dtls] pending queue full, dropping record from {}", remote);
            return;
        }
        pending.push_back((remote, record));
        debug!("[dtls] no connected port yet, queued record from {} (pending={})", remote, pending.len());
    }
}

#[async_trait]
impl DtlsTransport for DtlsSession {
    async fn handle_record(&self, remote: SocketAddr, record: Bytes) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }

        let tx = {
            let mut inbound = self.inbound.lock();
            match inbound.as_ref() {
                Some((peer, tx)) if *peer == remote => tx.clone(),
                Some((peer, _)) => {
                    debug!("[dtls] record from {} while session bound to {}, dropping", remote, peer);
                    return Ok(());
                }
                None if self.egress.select_connected().is_none() => {
                    self.enqueue_pending(remote, record);
                    return Ok(());
                }
                None => {
                    let tx = self.start_handshake(remote);
                    *inbound = Some((remote, tx.clone()));
                    tx
                }
            }
        };

        tx.send(record).await
            .map_err(|_| NetError::Dtls("session task gone".to_string()))
    }

    async fn write(&self, data: Bytes) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }

        let conn = self.conn.lock().await.clone()
            .ok_or_else(|| NetError::Dtls("handshake not complete".to_string()))?;
        conn.write(&data, None).await
            .map_err(|e| NetError::Dtls(format!("write failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> NetResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let conn   = self.conn.lock().await.take();
        let result = match conn {
            Some(conn) => conn.close().await.map_err(|e| NetError::Dtls(format!("close failed: {}", e))),
            None       => {
                debug!("[dtls] close before handshake completed");
                Ok(())
            }
        };

        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inbound.lock().take();
        self.pending.lock().clear();
        info!("[dtls] session closed");
        result
    }

    async fn on_egress_ready(&self) -> NetResult<()> {
        let pending: Vec<(SocketAddr, Bytes)> = self.pending.lock().drain(..).collect();
        if pending.is_empty() {
            return Ok(());
        }

        info!("[dtls] draining {} pending record(s)", pending.len());
        for (remote, record) in pending {
            self.handle_record(remote, record).await?;
        }
        Ok(())
    }
}

async fn run_session(
    adapter:   Arc<ConnAdapter>,
    cert_pair: Arc<CertPair>,
    events:    DtlsEventTx,
    slot:      ConnSlot,
    inbound:   InboundSlot,
    own_tx:    DtlsPacketTx,
    remote:    SocketAddr,
) {
    let timeout = tokio::time::Duration::from_millis(config::DTLS_HANDSHAKE_TIMEOUT_MS);
    let result  = tokio::time::timeout(timeout, do_handshake(adapter, &cert_pair)).await;
    let dtls_conn = match result {
        Ok(Ok(c))  => Arc::new(c),
        Ok(Err(e)) => {
            warn!("[dtls] handshake failed remote={}: {}", remote, e);
            release_inbound(&inbound, &own_tx);
            return;
        }
        Err(_) => {
            warn!("[dtls] handshake timeout remote={}", remote);
            release_inbound(&inbound, &own_tx);
            return;
        }
    };
    drop(own_tx);
    info!("[dtls] handshake complete remote={}", remote);

    match export_srtp_keys(&dtls_conn).await {
        Ok(keys) => { let _ = events.send(DtlsEvent::HandshakeComplete(keys)); }
        Err(e)   => warn!("[dtls] SRTP key export failed remote={}: {}", remote, e),
    }

    *slot.lock().await = Some(Arc::clone(&dtls_conn));

    // application data 읽기 루프
    let mut buf = vec![0u8; config::DTLS_READ_BUF_SIZE];
    loop {
        match dtls_conn.read(&mut buf, None).await {
            Ok(0)  => break,
            Ok(n)  => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if events.send(DtlsEvent::ApplicationData(data)).is_err() { break; }
            }
            Err(e) => { debug!("[dtls] read loop ended remote={}: {}", remote, e); break; }
        }
    }
}

/// 실패한 핸드셰이크의 바인딩 해제. 다음 레코드가 새 핸드셰이크를 시작한다
fn release_inbound(inbound: &InboundSlot, own_tx: &DtlsPacketTx) {
    let mut slot = inbound.lock();
    if matches!(slot.as_ref(), Some((_, tx)) if tx.same_channel(own_tx)) {
        slot.take();
    }
}

async fn do_handshake(conn: Arc<ConnAdapter>, cert_pair: &CertPair) -> NetResult<DTLSConn> {
    use dtls::extension::extension_use_srtp::SrtpProtectionProfile;

    let config = dtls::config::Config {
        certificates: vec![cert_pair.certificate.clone()],
        srtp_protection_profiles: vec![
            SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80,
        ],
        extended_master_secret: dtls::config::ExtendedMasterSecretType::Require,
        insecure_skip_verify: true,
        ..Default::default()
    };

    DTLSConn::new(conn, config, false, None).await
        .map_err(|e| NetError::Dtls(e.to_string()))
}

// ─────────────────────────────────────────────────────────────
// RFC 5705 키 도출
//
// connection_state() 로 State 복사본을 꺼낸 뒤
// KeyingMaterialExporter::export_keying_material() 호출.
// context 파라미터는 반드시 &[] (비어있지 않으면 ContextUnsupported 에러)
// ─────────────────────────────────────────────────────────────
async fn export_srtp_keys(dtls_conn: &DTLSConn) -> NetResult<SrtpKeys> {
    let state = dtls_conn.connection_state().await;
    let material: Vec<u8> = state
        .export_keying_material(SRTP_MASTER_KEY_LABEL, &[], SRTP_KEY_MATERIAL_LEN)
        .await
        .map_err(|e| NetError::Dtls(format!("export_keying_material failed: {e:?}")))?;

    SrtpKeys::from_keying_material(&material, false)
}

// ============================================================================
// [ConnAdapter]
// ============================================================================

pub struct ConnAdapter {
    egress: Arc<PortRegistry>,
    remote: SocketAddr,
    rx:     tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl ConnAdapter {
    pub fn new(egress: Arc<PortRegistry>, remote: SocketAddr) -> (Self, DtlsPacketTx) {
        let (tx, rx) = mpsc::channel(config::DTLS_PACKET_QUEUE_SIZE);
        let adapter = Self { egress, remote, rx: tokio::sync::Mutex::new(rx) };
        (adapter, tx)
    }
}

#[async_trait]
impl webrtc_util::Conn for ConnAdapter {
    async fn connect(&self, _addr: SocketAddr) -> webrtc_util::Result<()> { Ok(()) }

    async fn recv(&self, buf: &mut [u8]) -> webrtc_util::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            None => Err(webrtc_util::Error::Other("dtls rx channel closed".to_string())),
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc_util::Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, self.remote))
    }

    async fn send(&self, buf: &[u8]) -> webrtc_util::Result<usize> {
        self.egress.transmit(buf).await
            .map_err(|e| webrtc_util::Error::Other(e.to_string()))?;
        Ok(buf.len())
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc_util::Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> webrtc_util::Result<SocketAddr> {
        self.egress.first_connected_addr()
            .ok_or_else(|| webrtc_util::Error::Other("no connected port".to_string()))
    }

    fn remote_addr(&self) -> Option<SocketAddr> { Some(self.remote) }

    async fn close(&self) -> webrtc_util::Result<()> { Ok(()) }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) { self }
}

// ============================================================================
// [유틸]
// ============================================================================

fn sha256_fingerprint(der: &[u8]) -> String {
    let hash = Sha256::digest(der);
    let hex: Vec<String> = hash.iter().map(|b| format!("{:02X}", b)).collect();
    format!("sha-256 {}", hex.join(":"))
}
