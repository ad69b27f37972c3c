// author: kodeholic (powered by Claude)
//
// 피어 연결 1개의 세션 조정 계층
//
//   UDP 데이터그램 ─▶ Port (STUN / DTLS / SRTP 판별)
//                     ─▶ SessionState ─▶ DTLS ─▶ SCTP ─▶ DataChannel 이벤트
//   DataChannel 송신 ─▶ SCTP ─▶ DTLS ─▶ Connected 포트 ─▶ UDP
//
// 라이브러리는 tracing subscriber를 설치하지 않는다 (호출자 몫).

pub mod config;
pub mod error;
pub mod network;

pub use error::{NetError, NetResult};
pub use network::{
    DataChannelCreated, DataChannelEvent, DataChannelMessage, IceConnectionState,
    Port, SessionArgs, SessionState,
};
