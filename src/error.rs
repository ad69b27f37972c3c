// author: kodeholic (powered by Claude)

use std::fmt;

#[derive(Debug)]
pub enum NetError {
    /// Port 생성 시점에 공유 세션 상태가 없음
    StateUnavailable,
    Bind(std::io::Error),
    AddressResolution(String),
    NoRuntime,
    /// 연결된(Connected) 포트가 하나도 없음
    NoConnectedPort,
    SrtpKeysNotReady,
    Dtls(String),
    Srtp(String),
    Sctp(String),
    Stun(String),
    DataChannel(String),
    Rtp(String),
    Closed,
    IoError(std::io::Error),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::StateUnavailable       => write!(f, "Session state must not be absent"),
            NetError::Bind(err)              => write!(f, "Failed to bind UDP socket: {}", err),
            NetError::AddressResolution(msg) => write!(f, "Unusable transport address: {}", msg),
            NetError::NoRuntime              => write!(f, "No tokio runtime available"),
            NetError::NoConnectedPort        => write!(f, "No port with connected ICE state"),
            NetError::SrtpKeysNotReady       => write!(f, "SRTP keys not installed (DTLS incomplete)"),
            NetError::Dtls(msg)              => write!(f, "DTLS error: {}", msg),
            NetError::Srtp(msg)              => write!(f, "SRTP error: {}", msg),
            NetError::Sctp(msg)              => write!(f, "SCTP error: {}", msg),
            NetError::Stun(msg)              => write!(f, "STUN error: {}", msg),
            NetError::DataChannel(msg)       => write!(f, "DataChannel error: {}", msg),
            NetError::Rtp(msg)               => write!(f, "RTP error: {}", msg),
            NetError::Closed                 => write!(f, "Already closed"),
            NetError::IoError(err)           => write!(f, "Network I/O error: {}", err),
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetError::Bind(err) | NetError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        NetError::IoError(err)
    }
}

pub type NetResult<T> = Result<T, NetError>;
