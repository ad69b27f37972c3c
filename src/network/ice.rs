// author: kodeholic (powered by Claude)
// ICE-lite 연결 상태 + STUN Binding 처리
//
// 연결성 검사(connectivity check) 자체는 외부 ICE 서브시스템 몫.
// 여기서는 상대가 보낸 Binding Request를 세션 ice_pwd로 인증하고
// Binding Success Response를 만들어 주는 것까지만 담당한다.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use stun::integrity::MessageIntegrity;
use stun::message::{Message, BINDING_REQUEST};
use tracing::trace;

use crate::error::{NetError, NetResult};

/// ICE 연결 상태 (RTCIceConnectionState 와 동일한 열거)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IceConnectionState::New          => "new",
            IceConnectionState::Checking     => "checking",
            IceConnectionState::Connected    => "connected",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed       => "failed",
            IceConnectionState::Closed       => "closed",
        };
        f.write_str(s)
    }
}

/// 상태 전이 통지 콜백 — (포트 로컬 주소, 새 상태)
pub type IceNotifier = Arc<dyn Fn(SocketAddr, IceConnectionState) + Send + Sync>;

/// 인증된 Binding Request
#[derive(Debug)]
pub(crate) struct BindingRequest {
    pub username: Option<String>,
}

// ----------------------------------------------------------------------------
// [Binding Request 검증]
//
// MESSAGE-INTEGRITY 는 short-term credential — key = 로컬 ice_pwd
// integrity가 없거나 틀리면 드롭 대상
// ----------------------------------------------------------------------------

pub(crate) fn verify_binding_request(packet: &[u8], ice_pwd: &[u8]) -> NetResult<BindingRequest> {
    let mut msg = Message::new();
    msg.unmarshal_binary(packet)
        .map_err(|e| NetError::Stun(format!("decode failed: {}", e)))?;

    if msg.typ != BINDING_REQUEST {
        return Err(NetError::Stun(format!("unexpected message type {}", msg.typ)));
    }

    let integrity = MessageIntegrity::new_short_term_integrity(
        String::from_utf8_lossy(ice_pwd).into_owned(),
    );
    integrity.check(&mut msg)
        .map_err(|e| NetError::Stun(format!("integrity check failed: {}", e)))?;

    let username = msg.get(stun::attributes::ATTR_USERNAME)
        .ok()
        .map(|raw| String::from_utf8_lossy(&raw).into_owned());
    trace!("[stun] verified Binding Request username={:?}", username);

    Ok(BindingRequest { username })
}

// ----------------------------------------------------------------------------
// [Binding Response 생성]
//
// XOR-MAPPED-ADDRESS + MESSAGE-INTEGRITY (HMAC-SHA1) + FINGERPRINT (CRC32)
// RFC 5389 필수 속성 — 빠지면 브라우저가 응답을 무시함
// ----------------------------------------------------------------------------

const MAGIC: u32 = 0x2112_A442;

pub(crate) fn make_binding_response(
    request:  &[u8],
    src_addr: SocketAddr,
    ice_pwd:  &[u8],
) -> Option<Vec<u8>> {
    use hmac::{Hmac, Mac};
    use sha1::Sha1;

    if request.len() < 20 { return None; }

    let mut resp = Vec::with_capacity(96);
    resp.extend_from_slice(&[0x01, 0x01]);      // Binding Success Response
    resp.extend_from_slice(&[0x00, 0x00]);      // length placeholder
    resp.extend_from_slice(&MAGIC.to_be_bytes());
    resp.extend_from_slice(&request[8..20]);    // Transaction ID 복사

    // XOR-MAPPED-ADDRESS
    let xor_port = src_addr.port() ^ (MAGIC >> 16) as u16;
    match src_addr {
        SocketAddr::V4(v4) => {
            resp.extend_from_slice(&[0x00, 0x20, 0x00, 0x08]);
            resp.extend_from_slice(&[0x00, 0x01]);     // reserved + family IPv4
            resp.extend_from_slice(&xor_port.to_be_bytes());
            let xor_ip = u32::from(*v4.ip()) ^ MAGIC;
            resp.extend_from_slice(&xor_ip.to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            // IPv6: magic cookie || transaction id 로 XOR
            resp.extend_from_slice(&[0x00, 0x20, 0x00, 0x14]);
            resp.extend_from_slice(&[0x00, 0x02]);     // reserved + family IPv6
            resp.extend_from_slice(&xor_port.to_be_bytes());
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC.to_be_bytes());
            mask[4..].copy_from_slice(&request[8..20]);
            for (b, m) in v6.ip().octets().iter().zip(mask.iter()) {
                resp.push(b ^ m);
            }
        }
    }

    // MESSAGE-INTEGRITY: length 필드를 이 attribute 끝 기준으로 갱신한 뒤 HMAC
    let len = resp.len() - 20 + 24;
    set_length(&mut resp, len);

    let mut mac = Hmac::<Sha1>::new_from_slice(ice_pwd).ok()?;
    mac.update(&resp);
    let hmac_bytes = mac.finalize().into_bytes();

    resp.extend_from_slice(&[0x00, 0x08, 0x00, 0x14]);
    resp.extend_from_slice(&hmac_bytes);

    // FINGERPRINT: CRC32(packet) XOR 0x5354554E
    let len = resp.len() - 20 + 8;
    set_length(&mut resp, len);

    let crc = crc32fast::hash(&resp) ^ 0x5354_554E;
    resp.extend_from_slice(&[0x80, 0x28, 0x00, 0x04]);
    resp.extend_from_slice(&crc.to_be_bytes());

    let len = resp.len() - 20;
    set_length(&mut resp, len);
    Some(resp)
}

fn set_length(msg: &mut [u8], len: usize) {
    let len = len as u16;
    msg[2..4].copy_from_slice(&len.to_be_bytes());
}

// ----------------------------------------------------------------------------
// [테스트]
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use stun::agent::TransactionId;
    use stun::attributes::ATTR_USERNAME;
    use stun::fingerprint::FINGERPRINT;
    use stun::message::{Getter, BINDING_SUCCESS};
    use stun::textattrs::TextAttribute;
    use stun::xoraddr::XorMappedAddress;

    const PWD: &str = "JWkoErHflRPGsKEIrqdGfuwEtffHoqRV";

    fn binding_request(pwd: &str) -> Vec<u8> {
        let mut m = Message::new();
        m.build(&[
            Box::new(BINDING_REQUEST),
            Box::new(TransactionId::new()),
            Box::new(TextAttribute::new(ATTR_USERNAME, "local:remote".to_owned())),
            Box::new(MessageIntegrity::new_short_term_integrity(pwd.to_owned())),
            Box::new(FINGERPRINT),
        ]).unwrap();
        m.raw
    }

    #[test]
    fn accepts_request_signed_with_session_pwd() {
        let req = verify_binding_request(&binding_request(PWD), PWD.as_bytes()).unwrap();
        assert_eq!(req.username.as_deref(), Some("local:remote"));
    }

    #[test]
    fn rejects_request_signed_with_other_pwd() {
        let err = verify_binding_request(&binding_request("wrong"), PWD.as_bytes()).unwrap_err();
        assert!(matches!(err, NetError::Stun(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(verify_binding_request(&[0x00, 0x01, 0x00], PWD.as_bytes()).is_err());
    }

    #[test]
    fn response_is_authenticated_and_maps_ipv4_source() {
        let req  = binding_request(PWD);
        let src: SocketAddr = "192.168.1.70:58257".parse().unwrap();
        let raw  = make_binding_response(&req, src, PWD.as_bytes()).unwrap();

        let mut resp = Message::new();
        resp.unmarshal_binary(&raw).unwrap();
        assert_eq!(resp.typ, BINDING_SUCCESS);
        assert_eq!(&raw[8..20], &req[8..20]);

        MessageIntegrity::new_short_term_integrity(PWD.to_owned()).check(&mut resp).unwrap();
        FINGERPRINT.check(&resp).unwrap();

        let mut mapped = XorMappedAddress::default();
        mapped.get_from(&resp).unwrap();
        assert_eq!(SocketAddr::new(mapped.ip, mapped.port), src);
    }

    #[test]
    fn response_maps_ipv6_source() {
        let req  = binding_request(PWD);
        let src: SocketAddr = "[2001:db8::7]:40000".parse().unwrap();
        let raw  = make_binding_response(&req, src, PWD.as_bytes()).unwrap();

        let mut resp = Message::new();
        resp.unmarshal_binary(&raw).unwrap();
        let mut mapped = XorMappedAddress::default();
        mapped.get_from(&resp).unwrap();
        assert_eq!(SocketAddr::new(mapped.ip, mapped.port), src);
    }

    #[test]
    fn short_request_yields_no_response() {
        let src: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert!(make_binding_response(&[0x00; 8], src, PWD.as_bytes()).is_none());
    }

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(IceConnectionState::Connected.to_string(), "connected");
        assert_eq!(IceConnectionState::Failed.to_string(), "failed");
    }
}
