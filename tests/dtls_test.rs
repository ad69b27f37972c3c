// author: kodeholic (powered by Claude)
//
// 실제 DTLS 클라이언트(dtls 크레이트)로 DtlsSession 핸드셰이크 검증
//   STUN 먼저 → DTLS : 일반 순서
//   DTLS 먼저 → STUN : 레코드 보관 후 latch 시점에 핸드셰이크 시작

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::*;
use dtls::config::{Config, ExtendedMasterSecretType};
use dtls::conn::DTLSConn;
use dtls::crypto::Certificate;
use dtls::extension::extension_use_srtp::SrtpProtectionProfile;
use mini_rtcsession::network::srtp::{SRTP_KEY_MATERIAL_LEN, SRTP_MASTER_KEY_LABEL};
use mini_rtcsession::network::{Port, SessionState, SrtpContextRegistry, SrtpKeys};
use rtp::header::Header;
use rtp::packet::Packet;
use tokio::net::UdpSocket;
use webrtc_util::marshal::Marshal;
use webrtc_util::KeyingMaterialExporter;

const HANDSHAKE_WAIT: Duration = Duration::from_secs(8);

// ----------------------------------------------------------------------------
// [피어 측 DTLS Conn]
// ----------------------------------------------------------------------------

/// 피어 UDP 소켓 위의 Conn. DTLS 레코드(첫 바이트 20..=63)만 올려보낸다
struct PeerConn {
    socket:    Arc<UdpSocket>,
    port_addr: SocketAddr,
}

#[async_trait]
impl webrtc_util::Conn for PeerConn {
    async fn connect(&self, _addr: SocketAddr) -> webrtc_util::Result<()> { Ok(()) }

    async fn recv(&self, buf: &mut [u8]) -> webrtc_util::Result<usize> {
        loop {
            let (n, _) = self.socket.recv_from(buf).await
                .map_err(|e| webrtc_util::Error::Other(e.to_string()))?;
            if n > 0 && (20..=63).contains(&buf[0]) {
                return Ok(n);
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc_util::Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, self.port_addr))
    }

    async fn send(&self, buf: &[u8]) -> webrtc_util::Result<usize> {
        self.socket.send_to(buf, self.port_addr).await
            .map_err(|e| webrtc_util::Error::Other(e.to_string()))
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc_util::Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> webrtc_util::Result<SocketAddr> {
        self.socket.local_addr().map_err(|e| webrtc_util::Error::Other(e.to_string()))
    }

    fn remote_addr(&self) -> Option<SocketAddr> { Some(self.port_addr) }

    async fn close(&self) -> webrtc_util::Result<()> { Ok(()) }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) { self }
}

async fn dtls_client(socket: Arc<UdpSocket>, port_addr: SocketAddr) -> DTLSConn {
    let certificate = Certificate::generate_self_signed(vec!["peer".to_string()]).unwrap();
    let config = Config {
        certificates: vec![certificate],
        srtp_protection_profiles: vec![SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80],
        extended_master_secret: ExtendedMasterSecretType::Require,
        insecure_skip_verify: true,
        ..Default::default()
    };
    let conn = Arc::new(PeerConn { socket, port_addr });

    tokio::time::timeout(HANDSHAKE_WAIT, DTLSConn::new(conn, config, true, None))
        .await
        .expect("DTLS 핸드셰이크 타임아웃")
        .expect("DTLS 핸드셰이크 실패")
}

async fn client_srtp_keys(client: &DTLSConn) -> SrtpKeys {
    let material = client.connection_state().await
        .export_keying_material(SRTP_MASTER_KEY_LABEL, &[], SRTP_KEY_MATERIAL_LEN)
        .await
        .unwrap();
    SrtpKeys::from_keying_material(&material, true).unwrap()
}

async fn real_session() -> (Harness, Arc<Port>) {
    let close_log: CloseLog = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let (args, events, media, ice) = session_args();
    let state = SessionState::new(args).expect("세션 생성 실패");
    let port  = Port::bind(loopback(), Arc::downgrade(&state)).await.expect("포트 바인드 실패");
    state.register_port(Arc::clone(&port));
    (Harness { state, events, media, ice, close_log }, port)
}

async fn peer_socket() -> Arc<UdpSocket> {
    Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("피어 소켓 바인드 실패"))
}

/// 클라이언트 키로 암호화한 RTP 가 세션의 버퍼 트랜스포트까지 도달하는지
async fn assert_srtp_flows(h: &mut Harness, client: &DTLSConn, socket: &UdpSocket, port_addr: SocketAddr) {
    let remote = SrtpContextRegistry::new();
    remote.install_keys(client_srtp_keys(client).await);
    let ctx = remote.get_or_create(port_addr.ip(), port_addr.port(), 3131).unwrap();

    let packet = Packet {
        header: Header { version: 2, payload_type: 111, sequence_number: 1, ssrc: 3131, ..Default::default() },
        payload: Bytes::from_static(b"opus"),
    };
    let cipher = ctx.encrypt_rtp(&packet.marshal().unwrap()).unwrap();
    socket.send_to(&cipher, port_addr).await.unwrap();

    let got = tokio::time::timeout(WAIT, h.media.recv()).await.unwrap().unwrap();
    assert_eq!(got.header.ssrc, 3131);
    assert_eq!(&got.payload[..], b"opus");
}

// ----------------------------------------------------------------------------
// [테스트]
// ----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_after_stun_installs_srtp_keys() {
    init_tracing();

    let (mut h, port) = real_session().await;
    let port_addr = port.local_addr();
    let socket = peer_socket().await;

    socket.send_to(&binding_request(ICE_PWD), port_addr).await.unwrap();
    let p = Arc::clone(&port);
    wait_until(move || p.is_connected()).await;

    let client = dtls_client(Arc::clone(&socket), port_addr).await;
    let state = Arc::clone(&h.state);
    wait_until(move || state.srtp_contexts().is_ready()).await;

    assert_srtp_flows(&mut h, &client, &socket, port_addr).await;

    let _ = client.close().await;
    port.close();
    h.state.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_hello_before_stun_completes_after_latch() {
    init_tracing();

    let (mut h, port) = real_session().await;
    let port_addr = port.local_addr();
    let socket = peer_socket().await;

    // ClientHello 가 먼저 나간다. 응답을 보낼 포트가 아직 없다
    let client_task = tokio::spawn(dtls_client(Arc::clone(&socket), port_addr));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!port.is_connected());
    assert!(!h.state.srtp_contexts().is_ready());

    // latch 되면 보관된 레코드로 핸드셰이크 진행
    socket.send_to(&binding_request(ICE_PWD), port_addr).await.unwrap();
    let client = tokio::time::timeout(HANDSHAKE_WAIT, client_task)
        .await
        .expect("핸드셰이크가 latch 이후 진행되어야 합니다.")
        .unwrap();

    let state = Arc::clone(&h.state);
    wait_until(move || state.srtp_contexts().is_ready()).await;
    assert!(port.is_connected());

    assert_srtp_flows(&mut h, &client, &socket, port_addr).await;

    let _ = client.close().await;
    port.close();
    h.state.close().await.unwrap();
}
