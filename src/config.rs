// author: kodeholic (powered by Claude)
// 매직 넘버를 배제하고 세션 계층 전체의 한계를 제어하는 상수 모음입니다.

/// 포트 수신 버퍼 (UDP 최대 데이터그램)
pub const UDP_RECV_BUF_SIZE: usize = 65535;

// ----------------------------------------------------------------------------
// DTLS
// ----------------------------------------------------------------------------

/// 핸드셰이크 태스크로 주입되는 레코드 큐 사이즈
pub const DTLS_PACKET_QUEUE_SIZE: usize = 128;

/// DTLS 핸드셰이크 최대 허용 시간 (10초)
pub const DTLS_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// application data 읽기 버퍼 (SCTP 패킷 1개 + 여유)
pub const DTLS_READ_BUF_SIZE: usize = 8192;

/// 자체서명 인증서 subject (SAN)
pub const CERT_SUBJECT: &str = "mini-rtcsession";

// ----------------------------------------------------------------------------
// SCTP
// ----------------------------------------------------------------------------

/// DTLS → SCTP 주입 큐 사이즈
pub const SCTP_INBOUND_QUEUE_SIZE: usize = 128;

/// 스트림당 user message 읽기 버퍼 (RFC 8831 권장 최대 메시지 크기 64KB)
pub const SCTP_READ_BUF_SIZE: usize = 65536;

/// WebRTC data channel SCTP 포트 (RFC 8841 기본값, 양쪽 동일)
pub const SCTP_PORT: u16 = 5000;

/// 송신 SCTP 패킷 크기. 0 이면 webrtc-sctp 기본값(1191)
pub const SCTP_MTU: u32 = 0;

// ----------------------------------------------------------------------------
// SRTP
// ----------------------------------------------------------------------------

/// SRTP / SRTCP 수신 replay-protection 윈도우 (패킷 수)
pub const SRTP_REPLAY_WINDOW: usize = 64;
