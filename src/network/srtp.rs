// author: kodeholic (powered by Claude)
// SRTP 컨텍스트 레지스트리
//
// RFC 3711 §3.2.3:
//   A cryptographic context SHALL be uniquely identified by the triplet
//   <SSRC, destination network address, destination transport port number>
//
// 락 규칙:
//   contexts 맵 락   — lookup/insert 동안만 보유. 키 도출(암호 연산)은 락 밖에서
//   컨텍스트 내부 락 — 컨텍스트별 Mutex, 시퀀스/ROC/replay 윈도우 보호
//   레지스트리 락과 컨텍스트 락은 절대 중첩해서 잡지 않는다

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};
use webrtc_srtp::context::Context;
use webrtc_srtp::option::{srtcp_replay_protection, srtp_replay_protection};
use webrtc_srtp::protection_profile::ProtectionProfile;

use crate::config;
use crate::error::{NetError, NetResult};

// RFC 5764 §4.2 — SRTP-DTLS 키 도출 상수 (AES_CM_128_HMAC_SHA1_80)
pub const SRTP_MASTER_KEY_LABEL: &str  = "EXTRACTOR-dtls_srtp";
pub const SRTP_MASTER_KEY_LEN:   usize = 16;
pub const SRTP_MASTER_SALT_LEN:  usize = 14;
// 레이아웃: client_key | server_key | client_salt | server_salt
pub const SRTP_KEY_MATERIAL_LEN: usize = (SRTP_MASTER_KEY_LEN + SRTP_MASTER_SALT_LEN) * 2;

// ============================================================================
// [SrtpKeys]
// ============================================================================

/// DTLS 완료 후 확정되는 마스터 키 쌍
/// local_* = 우리가 송신에 쓰는 키, remote_* = 상대 송신 패킷 복호화 키
#[derive(Clone)]
pub struct SrtpKeys {
    pub profile:     ProtectionProfile,
    pub local_key:   Vec<u8>,
    pub local_salt:  Vec<u8>,
    pub remote_key:  Vec<u8>,
    pub remote_salt: Vec<u8>,
}

impl SrtpKeys {
    /// RFC 5705 exporter 출력 슬라이싱
    /// is_client: DTLS 클라이언트 역할 여부 (client_write 키가 곧 로컬 송신 키)
    pub fn from_keying_material(material: &[u8], is_client: bool) -> NetResult<Self> {
        if material.len() < SRTP_KEY_MATERIAL_LEN {
            return Err(NetError::Srtp(format!(
                "keying material too short: {} < {}", material.len(), SRTP_KEY_MATERIAL_LEN
            )));
        }

        let client_key  = &material[0..SRTP_MASTER_KEY_LEN];
        let server_key  = &material[SRTP_MASTER_KEY_LEN..SRTP_MASTER_KEY_LEN * 2];
        let client_salt = &material[SRTP_MASTER_KEY_LEN * 2..SRTP_MASTER_KEY_LEN * 2 + SRTP_MASTER_SALT_LEN];
        let server_salt = &material[SRTP_MASTER_KEY_LEN * 2 + SRTP_MASTER_SALT_LEN..SRTP_KEY_MATERIAL_LEN];

        let (local_key, local_salt, remote_key, remote_salt) = if is_client {
            (client_key, client_salt, server_key, server_salt)
        } else {
            (server_key, server_salt, client_key, client_salt)
        };

        Ok(Self {
            profile:     ProtectionProfile::Aes128CmHmacSha1_80,
            local_key:   local_key.to_vec(),
            local_salt:  local_salt.to_vec(),
            remote_key:  remote_key.to_vec(),
            remote_salt: remote_salt.to_vec(),
        })
    }
}

impl std::fmt::Debug for SrtpKeys {
    // 키 머티리얼은 로그에 남기지 않는다
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpKeys").field("profile", &self.profile).finish_non_exhaustive()
    }
}

// ============================================================================
// [SrtpContext]
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SrtpContextKey {
    pub ssrc:        u32,
    pub remote_ip:   IpAddr,
    pub remote_port: u16,
}

struct CipherState {
    inbound:  Context,
    outbound: Context,
}

/// 트리플렛 하나에 대응하는 암복호화 상태
/// 내부 Mutex 하나가 inbound/outbound 카운터와 replay 윈도우를 함께 보호
pub struct SrtpContext {
    key:    SrtpContextKey,
    // 생성 당시 키 세대. 레지스트리 세대와 다르면 폐기 대상
    epoch:  u64,
    cipher: Mutex<CipherState>,
}

impl SrtpContext {
    fn new(key: SrtpContextKey, epoch: u64, keys: &SrtpKeys) -> NetResult<Self> {
        let inbound = Context::new(
            &keys.remote_key,
            &keys.remote_salt,
            keys.profile,
            Some(srtp_replay_protection(config::SRTP_REPLAY_WINDOW)),
            Some(srtcp_replay_protection(config::SRTP_REPLAY_WINDOW)),
        ).map_err(|e| NetError::Srtp(format!("inbound context: {}", e)))?;

        let outbound = Context::new(
            &keys.local_key,
            &keys.local_salt,
            keys.profile,
            None,
            None,
        ).map_err(|e| NetError::Srtp(format!("outbound context: {}", e)))?;

        Ok(Self { key, epoch, cipher: Mutex::new(CipherState { inbound, outbound }) })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn key(&self) -> SrtpContextKey {
        self.key
    }

    pub fn decrypt_rtp(&self, packet: &[u8]) -> NetResult<Bytes> {
        self.cipher.lock().inbound.decrypt_rtp(packet)
            .map_err(|e| NetError::Srtp(format!("decrypt ssrc={}: {}", self.key.ssrc, e)))
    }

    pub fn decrypt_rtcp(&self, packet: &[u8]) -> NetResult<Bytes> {
        self.cipher.lock().inbound.decrypt_rtcp(packet)
            .map_err(|e| NetError::Srtp(format!("decrypt rtcp ssrc={}: {}", self.key.ssrc, e)))
    }

    pub fn encrypt_rtp(&self, packet: &[u8]) -> NetResult<Bytes> {
        self.cipher.lock().outbound.encrypt_rtp(packet)
            .map_err(|e| NetError::Srtp(format!("encrypt ssrc={}: {}", self.key.ssrc, e)))
    }

    pub fn encrypt_rtcp(&self, packet: &[u8]) -> NetResult<Bytes> {
        self.cipher.lock().outbound.encrypt_rtcp(packet)
            .map_err(|e| NetError::Srtp(format!("encrypt rtcp ssrc={}: {}", self.key.ssrc, e)))
    }
}

// ============================================================================
// [SrtpContextRegistry]
// ============================================================================

struct KeyState {
    // install_keys / clear 마다 증가. contexts 락 안에서만 바뀐다
    epoch: u64,
    keys:  Option<SrtpKeys>,
}

/// 락 순서: contexts → keys
pub struct SrtpContextRegistry {
    keys:     RwLock<KeyState>,
    contexts: Mutex<HashMap<SrtpContextKey, Arc<SrtpContext>>>,
}

impl SrtpContextRegistry {
    pub fn new() -> Self {
        Self {
            keys:     RwLock::new(KeyState { epoch: 0, keys: None }),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// DTLS 핸드셰이크 완료 시 1회 호출. 재호출(재협상) 시 기존 컨텍스트 폐기
    pub fn install_keys(&self, keys: SrtpKeys) {
        let mut contexts = self.contexts.lock();
        let epoch = {
            let mut state = self.keys.write();
            state.epoch += 1;
            state.keys = Some(keys);
            state.epoch
        };
        let stale = std::mem::take(&mut *contexts);
        debug!("[srtp] keys installed epoch={}, {} stale context(s) dropped", epoch, stale.len());
    }

    pub fn is_ready(&self) -> bool {
        self.keys.read().keys.is_some()
    }

    /// 현재 키 세대
    pub fn epoch(&self) -> u64 {
        self.keys.read().epoch
    }

    /// 트리플렛당 컨텍스트는 정확히 1개
    /// 생성 경합에서 진 쪽은 자신이 만든 컨텍스트를 버리고 승자를 반환한다.
    /// 생성 도중 키가 바뀌면 옛 키로 만든 컨텍스트는 버리고 새 키로 다시 만든다
    pub fn get_or_create(&self, remote_ip: IpAddr, remote_port: u16, ssrc: u32) -> NetResult<Arc<SrtpContext>> {
        let key = SrtpContextKey { ssrc, remote_ip, remote_port };

        loop {
            if let Some(ctx) = self.contexts.lock().get(&key) {
                return Ok(Arc::clone(ctx));
            }

            let (epoch, keys) = {
                let state = self.keys.read();
                (state.epoch, state.keys.clone().ok_or(NetError::SrtpKeysNotReady)?)
            };
            let fresh = Arc::new(SrtpContext::new(key, epoch, &keys)?);

            let mut contexts = self.contexts.lock();
            if self.keys.read().epoch != epoch {
                trace!("[srtp] rekeyed while creating ssrc={}, retrying", ssrc);
                continue;
            }
            let ctx = contexts.entry(key).or_insert_with(|| {
                trace!("[srtp] context created ssrc={} remote={}:{} epoch={}", ssrc, remote_ip, remote_port, epoch);
                fresh
            });
            return Ok(Arc::clone(ctx));
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 세션 종료 시 키 머티리얼 폐기
    pub fn clear(&self) {
        let mut contexts = self.contexts.lock();
        let mut state    = self.keys.write();
        state.epoch += 1;
        state.keys = None;
        contexts.clear();
    }
}

impl Default for SrtpContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// [RTP/RTCP 헤더 유틸]
// ----------------------------------------------------------------------------

/// RFC 5761 §4: RTCP PT 200~207 → 마스킹 후 72~79
/// (byte1 >= 0xC8 판별은 마커 비트가 켜진 RTP PT 72~79와 충돌)
pub(crate) fn is_rtcp(packet: &[u8]) -> bool {
    match packet.get(1) {
        Some(b1) => (72..=79).contains(&(b1 & 0x7F)),
        None     => false,
    }
}

/// RTP: 헤더 8..12 / RTCP: sender SSRC 4..8
pub(crate) fn packet_ssrc(packet: &[u8], rtcp: bool) -> Option<u32> {
    let offset = if rtcp { 4 } else { 8 };
    let raw = packet.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}
