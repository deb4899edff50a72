//! VNC client connection handling and protocol implementation.
//!
//! This module manages individual VNC client sessions, handling:
//! - RFB protocol handshake and security negotiation (None, VNC auth,
//!   VeNCrypt X509Plain, Apple DH, RSA-AES)
//! - Client message processing (input events, encoding requests, clipboard,
//!   continuous updates, fences, desktop resizes)
//! - Framebuffer update scheduling: composite, refine, encode, transmit
//!
//! # Protocol Flow
//!
//! 1. **Handshake**: Version exchange and the chosen security sub-machine
//! 2. **Initialization**: ClientInit/ServerInit
//! 3. **Message Loop**: Incoming messages interleaved with outgoing updates
//!
//! Every received byte lands in a sliding parse buffer; each state's handler
//! consumes whole messages or reports "need more". No client state mutates
//! until a full message is available.
//!
//! # Flow Control
//!
//! Updates are paced by a bandwidth estimate: the server injects a fence
//! carrying `BLOCK_BEFORE` whenever the bytes in flight exceed twice the
//! bandwidth-delay product, and holds further updates until the client's
//! fence response drains the pipe.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use log::{debug, info, warn};

use crate::auth::{apple_dh, rsa_aes, vencrypt, vnc as vnc_auth, SecurityConfig};
use crate::bandwidth::{BandwidthEstimator, BweSample};
use crate::composite::CompositeFb;
use crate::crypto::{AeadCipherType, DhSecret};
use crate::damage::{Rect, Region};
use crate::damage_refinery::DamageRefinery;
use crate::desktop_layout::{parse_set_desktop_size, put_extended_desktop_size_rect};
use crate::encoding::{select_encoding, Encoder};
use crate::error::{Result, VncError};
use crate::events::ServerEvent;
use crate::protocol::*;
use crate::resampler::Resampler;
use crate::server::{FrameUpdate, ServerInner};
use crate::stream::{SendResult, Stream};

/// Parse buffer size messages must normally fit into.
const MSG_BUFFER_SIZE: usize = 4096;

/// Hard cap on the parse buffer; large clipboard transfers stay below it.
const MSG_BUFFER_MAX: usize = MAX_CUT_TEXT_SIZE + 64;

/// Default RTT floor before the first measurement, in microseconds.
const DEFAULT_RTT_MIN: u64 = 20_000;

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    WaitVersion,
    WaitSecurityChoice,
    WaitVencryptVersion,
    WaitVencryptSubtype,
    WaitVencryptPlainAuth,
    WaitVncAuthResponse,
    WaitAppleDhResponse,
    WaitRsaAesPublicKey,
    WaitRsaAesChallenge,
    WaitRsaAesClientHash,
    WaitRsaAesCredentials,
    WaitInit,
    Ready,
    Closed,
}

/// Security-variant scratch state, alive only during the handshake.
#[derive(Default)]
struct AuthScratch {
    vnc_challenge: Option<[u8; vnc_auth::CHALLENGE_LEN]>,
    dh_secret: Option<DhSecret>,
    rsa: Option<rsa_aes::RsaAesState>,
    rsa_client_hash: Option<Vec<u8>>,
}

/// Manages a single VNC client connection.
pub(crate) struct ClientSession {
    id: usize,
    server: Arc<ServerInner>,
    stream: Stream,
    security: SecurityConfig,
    state: ClientState,
    buffer: BytesMut,
    /// RFB minor version: 3, 7 or 8.
    version_minor: u8,
    auth: AuthScratch,
    username: Option<String>,

    pixel_format: PixelFormat,
    formats_changed: bool,
    encodings: Vec<i32>,
    encoder: Option<Encoder>,
    quality: u8,

    resampler: Resampler,
    refinery: DamageRefinery,
    /// Damage owed to this client, in logical coordinates.
    damage: Region,
    latest: Option<CompositeFb>,
    frame_rx: mpsc::UnboundedReceiver<FrameUpdate>,
    n_pending_requests: u32,
    known_width: u32,
    known_height: u32,

    continuous_enabled: bool,
    continuous_area: Rect,
    continuous_notified: bool,

    has_cursor_ext: bool,
    cursor_seq: u64,
    has_led_ext: bool,
    led_state_sent: Option<u8>,
    has_ext_clipboard: bool,
    ext_clipboard_notified: bool,
    has_fence_ext: bool,
    has_qemu_key_ext: bool,
    has_desktop_size: bool,
    has_ext_desktop_size: bool,

    inflight_bytes: Arc<AtomicUsize>,
    bwe: BandwidthEstimator,
    min_rtt_us: u64,
    handshake_sent_at: Option<Instant>,
    fence_sent_at: Option<Instant>,
    /// Bytes the outstanding fence covers: everything sent since the
    /// previous fence went out.
    fence_covered_bytes: u64,
    last_fence_marker: u64,
    bytes_sent_total: u64,
    is_blocked_by_fence: bool,

    epoch: Instant,
}

impl ClientSession {
    pub(crate) fn new(
        id: usize,
        server: Arc<ServerInner>,
        stream: Stream,
        frame_rx: mpsc::UnboundedReceiver<FrameUpdate>,
    ) -> Self {
        let security = server.security_config();
        Self {
            id,
            server,
            stream,
            security,
            state: ClientState::WaitVersion,
            buffer: BytesMut::with_capacity(MSG_BUFFER_SIZE),
            version_minor: 8,
            auth: AuthScratch::default(),
            username: None,
            pixel_format: PixelFormat::rgbx8888(),
            formats_changed: true,
            encodings: vec![ENCODING_RAW],
            encoder: None,
            quality: 0,
            resampler: Resampler::new(),
            refinery: DamageRefinery::new(0, 0),
            damage: Region::new(),
            latest: None,
            frame_rx,
            n_pending_requests: 0,
            known_width: 0,
            known_height: 0,
            continuous_enabled: false,
            continuous_area: Rect::new(0, 0, 0, 0),
            continuous_notified: false,
            has_cursor_ext: false,
            cursor_seq: 0,
            has_led_ext: false,
            led_state_sent: None,
            has_ext_clipboard: false,
            ext_clipboard_notified: false,
            has_fence_ext: false,
            has_qemu_key_ext: false,
            has_desktop_size: false,
            has_ext_desktop_size: false,
            inflight_bytes: Arc::new(AtomicUsize::new(0)),
            bwe: BandwidthEstimator::new(),
            min_rtt_us: DEFAULT_RTT_MIN,
            handshake_sent_at: None,
            fence_sent_at: None,
            fence_covered_bytes: 0,
            last_fence_marker: 0,
            bytes_sent_total: 0,
            is_blocked_by_fence: false,
            epoch: Instant::now(),
        }
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Records an RTT observation from a handshake round-trip.
    fn update_min_rtt(&mut self) {
        if let Some(sent_at) = self.handshake_sent_at.take() {
            let rtt = sent_at.elapsed().as_micros() as u64;
            if rtt > 0 {
                self.min_rtt_us = self.min_rtt_us.min(rtt).max(1);
                self.bwe.update_rtt_min(self.min_rtt_us);
            }
        }
        self.handshake_sent_at = Some(Instant::now());
    }

    /// Drives the connection until it closes.
    pub(crate) async fn run(mut self) {
        info!("client {} connected from {}", self.id, self.stream.peer_name());

        self.stream.send(Bytes::from_static(PROTOCOL_VERSION.as_bytes()), None);
        self.handshake_sent_at = Some(Instant::now());
        if self.stream.flush().await.is_err() {
            self.finish().await;
            return;
        }

        let mut read_chunk = BytesMut::with_capacity(MSG_BUFFER_SIZE);
        let mut tick = tokio::time::interval(tokio::time::Duration::from_millis(16));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.state != ClientState::Closed {
            tokio::select! {
                result = self.stream.read_buf(&mut read_chunk) => {
                    match result {
                        Ok(0) => {
                            debug!("client {}: remote closed", self.id);
                            break;
                        }
                        Ok(_) => {
                            if read_chunk.len() + self.buffer.len() > MSG_BUFFER_MAX {
                                warn!("client {}: message too large to buffer", self.id);
                                break;
                            }
                            self.buffer.put_slice(&read_chunk);
                            read_chunk.clear();
                            if self.process_buffer().await.is_err() {
                                break;
                            }
                            if self.maybe_send_update().await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("client {}: read error: {e}", self.id);
                            break;
                        }
                    }
                }
                Some(update) = self.frame_rx.recv() => {
                    self.latest = Some(update.cfb);
                    self.damage.union(&update.damage);
                    if self.maybe_send_update().await.is_err() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if self.maybe_send_update().await.is_err() {
                        break;
                    }
                }
            }

            if self.stream.flush().await.is_err() {
                break;
            }
        }

        self.finish().await;
    }

    async fn finish(&mut self) {
        self.state = ClientState::Closed;
        self.stream.close();
        self.server.remove_client(self.id);
        self.server.emit(ServerEvent::ClientDisconnected { id: self.id });
        info!("client {} disconnected", self.id);
    }

    /// Dispatches complete messages from the parse buffer.
    async fn process_buffer(&mut self) -> Result<()> {
        loop {
            if self.buffer.is_empty() || self.state == ClientState::Closed {
                return Ok(());
            }

            let before = self.buffer.len();
            let progressed = match self.state {
                ClientState::WaitVersion => self.on_version().await?,
                ClientState::WaitSecurityChoice => self.on_security_choice().await?,
                ClientState::WaitVencryptVersion => self.on_vencrypt_version().await?,
                ClientState::WaitVencryptSubtype => self.on_vencrypt_subtype().await?,
                ClientState::WaitVencryptPlainAuth => self.on_vencrypt_plain_auth().await?,
                ClientState::WaitVncAuthResponse => self.on_vnc_auth_response().await?,
                ClientState::WaitAppleDhResponse => self.on_apple_dh_response().await?,
                ClientState::WaitRsaAesPublicKey => self.on_rsa_aes_public_key().await?,
                ClientState::WaitRsaAesChallenge => self.on_rsa_aes_challenge().await?,
                ClientState::WaitRsaAesClientHash => self.on_rsa_aes_client_hash().await?,
                ClientState::WaitRsaAesCredentials => self.on_rsa_aes_credentials().await?,
                ClientState::WaitInit => self.on_client_init().await?,
                ClientState::Ready => self.on_client_message().await?,
                ClientState::Closed => return Ok(()),
            };

            if !progressed && self.buffer.len() == before {
                return Ok(());
            }
        }
    }

    /// Sends a security failure, optionally with a reason, and closes.
    async fn security_failed(&mut self, reason: &str) -> Result<()> {
        warn!("client {}: security handshake failed: {reason}", self.id);
        let mut msg = BytesMut::new();
        msg.put_u32(SECURITY_RESULT_FAILED);
        if self.version_minor >= 8 {
            put_reason(&mut msg, reason);
        }
        self.stream.send(msg.freeze(), None);
        let _ = self.stream.flush().await;
        self.state = ClientState::Closed;
        Ok(())
    }

    /// Completes security, transitioning to the init phase.
    fn security_ok(&mut self, username: Option<String>, sent_for_none: bool) {
        self.username = username;
        self.auth = AuthScratch::default();
        // RFB 3.3/3.7 skip the SecurityResult for the None type.
        if self.version_minor >= 8 || !sent_for_none {
            let mut msg = BytesMut::new();
            msg.put_u32(SECURITY_RESULT_OK);
            self.stream.send(msg.freeze(), None);
        }
        self.state = ClientState::WaitInit;
    }

    // ------------------------------------------------------------------
    // Handshake states
    // ------------------------------------------------------------------

    async fn on_version(&mut self) -> Result<bool> {
        if self.buffer.len() < 12 {
            return Ok(false);
        }
        let version = self.buffer.split_to(12);
        self.update_min_rtt();

        let minor = match &version[..] {
            v if v == PROTOCOL_VERSION.as_bytes() => 8,
            v if v == PROTOCOL_VERSION_3_7.as_bytes() => 7,
            v if v == PROTOCOL_VERSION_3_3.as_bytes() => 3,
            other => {
                warn!(
                    "client {}: unsupported version {:?}",
                    self.id,
                    String::from_utf8_lossy(other)
                );
                let mut msg = BytesMut::new();
                msg.put_u8(0); // zero security types
                put_reason(&mut msg, "Unsupported protocol version");
                self.stream.send(msg.freeze(), None);
                let _ = self.stream.flush().await;
                self.state = ClientState::Closed;
                return Ok(true);
            }
        };
        self.version_minor = minor;
        debug!("client {}: RFB 3.{minor}", self.id);

        let types = self.security.security_types();
        if minor == 3 {
            // 3.3: the server picks; only None and VncAuth exist there.
            let chosen = if types.contains(&SECURITY_TYPE_VNC_AUTH) {
                SECURITY_TYPE_VNC_AUTH
            } else {
                SECURITY_TYPE_NONE
            };
            let mut msg = BytesMut::new();
            msg.put_u32(u32::from(chosen));
            self.stream.send(msg.freeze(), None);
            self.start_security(chosen).await?;
        } else {
            let mut msg = BytesMut::with_capacity(1 + types.len());
            msg.put_u8(types.len() as u8);
            msg.put_slice(&types);
            self.stream.send(msg.freeze(), None);
            self.state = ClientState::WaitSecurityChoice;
        }
        Ok(true)
    }

    async fn on_security_choice(&mut self) -> Result<bool> {
        if self.buffer.is_empty() {
            return Ok(false);
        }
        let choice = self.buffer.get_u8();
        self.update_min_rtt();

        if !self.security.security_types().contains(&choice) {
            warn!("client {}: invalid security type {choice}", self.id);
            return self.security_failed("Invalid security type").await.map(|()| true);
        }
        self.start_security(choice).await?;
        Ok(true)
    }

    async fn start_security(&mut self, security_type: u8) -> Result<()> {
        match security_type {
            SECURITY_TYPE_NONE => self.security_ok(None, true),
            SECURITY_TYPE_VNC_AUTH => {
                self.auth.vnc_challenge = Some(vnc_auth::begin(&mut self.stream));
                self.state = ClientState::WaitVncAuthResponse;
            }
            SECURITY_TYPE_VENCRYPT => {
                vencrypt::begin(&mut self.stream);
                self.state = ClientState::WaitVencryptVersion;
            }
            SECURITY_TYPE_APPLE_DH => {
                self.auth.dh_secret = Some(apple_dh::begin(&mut self.stream));
                self.state = ClientState::WaitAppleDhResponse;
            }
            SECURITY_TYPE_RSA_AES
            | SECURITY_TYPE_RSA_AES_256
            | SECURITY_TYPE_RSA_AES_UNENCRYPTED
            | SECURITY_TYPE_RSA_AES_256_UNENCRYPTED => {
                let cipher = match security_type {
                    SECURITY_TYPE_RSA_AES | SECURITY_TYPE_RSA_AES_UNENCRYPTED => {
                        AeadCipherType::Aes128Eax
                    }
                    _ => AeadCipherType::Aes256Eax,
                };
                let keys = self.server.rsa_keys()?;
                self.auth.rsa = Some(rsa_aes::begin(&mut self.stream, &keys, cipher));
                self.state = ClientState::WaitRsaAesPublicKey;
            }
            other => {
                return self
                    .security_failed(&format!("Unsupported security type {other}"))
                    .await;
            }
        }
        Ok(())
    }

    async fn on_vnc_auth_response(&mut self) -> Result<bool> {
        let challenge = self.auth.vnc_challenge.ok_or_else(|| {
            VncError::InvalidOperation("VNC auth response without challenge".into())
        })?;
        let password = self.security.password.clone().unwrap_or_default();

        match vnc_auth::handle_response(&mut self.buffer, &challenge, &password) {
            None => Ok(false),
            Some(true) => {
                self.update_min_rtt();
                self.security_ok(None, false);
                Ok(true)
            }
            Some(false) => {
                info!("client {}: VNC authentication failed", self.id);
                self.security_failed("Authentication failed").await.map(|()| true)
            }
        }
    }

    async fn on_vencrypt_version(&mut self) -> Result<bool> {
        match vencrypt::handle_version(&mut self.buffer, &mut self.stream) {
            None => Ok(false),
            Some(Ok(())) => {
                self.update_min_rtt();
                self.state = ClientState::WaitVencryptSubtype;
                Ok(true)
            }
            Some(Err(reason)) => self.security_failed(&reason).await.map(|()| true),
        }
    }

    async fn on_vencrypt_subtype(&mut self) -> Result<bool> {
        match vencrypt::handle_subtype(&mut self.buffer, &mut self.stream) {
            None => Ok(false),
            Some(false) => {
                let _ = self.stream.flush().await;
                self.state = ClientState::Closed;
                Ok(true)
            }
            Some(true) => {
                self.update_min_rtt();
                // Ack must reach the wire before the TLS handshake starts.
                self.stream.flush().await?;
                let acceptor = self.security.tls.clone().ok_or_else(|| {
                    VncError::InvalidOperation("VeNCrypt offered without TLS credentials".into())
                })?;
                self.stream.upgrade_to_tls(&acceptor).await?;
                // Anything buffered belonged to the plaintext phase.
                self.buffer.clear();
                self.state = ClientState::WaitVencryptPlainAuth;
                Ok(true)
            }
        }
    }

    async fn on_vencrypt_plain_auth(&mut self) -> Result<bool> {
        match vencrypt::handle_plain_auth(&mut self.buffer) {
            None => Ok(false),
            Some((username, password)) => {
                self.update_min_rtt();
                self.check_credentials(username, password).await.map(|()| true)
            }
        }
    }

    async fn on_apple_dh_response(&mut self) -> Result<bool> {
        let secret = self.auth.dh_secret.take().ok_or_else(|| {
            VncError::InvalidOperation("Apple DH response without secret".into())
        })?;
        match apple_dh::handle_response(&mut self.buffer, &secret)? {
            None => {
                self.auth.dh_secret = Some(secret);
                Ok(false)
            }
            Some((username, password)) => {
                self.update_min_rtt();
                self.check_credentials(username, password).await.map(|()| true)
            }
        }
    }

    async fn on_rsa_aes_public_key(&mut self) -> Result<bool> {
        let mut state = self.auth.rsa.take().ok_or_else(|| {
            VncError::InvalidOperation("RSA-AES message without state".into())
        })?;
        let result = rsa_aes::handle_public_key(&mut self.buffer, &mut state, &mut self.stream);
        self.auth.rsa = Some(state);

        match result? {
            None => Ok(false),
            Some(()) => {
                self.update_min_rtt();
                self.state = ClientState::WaitRsaAesChallenge;
                Ok(true)
            }
        }
    }

    async fn on_rsa_aes_challenge(&mut self) -> Result<bool> {
        let state = self.auth.rsa.as_ref().ok_or_else(|| {
            VncError::InvalidOperation("RSA-AES message without state".into())
        })?;
        let keys = self.server.rsa_keys()?;

        match rsa_aes::handle_challenge(&mut self.buffer, state, &keys)? {
            None => Ok(false),
            Some(session) => {
                let cipher = state.cipher;
                self.update_min_rtt();
                // Everything from here on travels in AES-EAX records.
                self.stream.flush().await?;
                self.stream
                    .upgrade_to_rsa_aes(cipher, &session.enc_key, &session.dec_key)?;
                self.buffer.clear();
                self.stream.send(Bytes::from(session.server_hash), None);
                self.auth.rsa_client_hash = Some(session.client_hash);
                self.state = ClientState::WaitRsaAesClientHash;
                Ok(true)
            }
        }
    }

    async fn on_rsa_aes_client_hash(&mut self) -> Result<bool> {
        let expected = self.auth.rsa_client_hash.clone().ok_or_else(|| {
            VncError::InvalidOperation("RSA-AES hash without session".into())
        })?;
        match rsa_aes::handle_client_hash(&mut self.buffer, &expected) {
            None => Ok(false),
            Some(false) => {
                info!("client {}: RSA-AES key hash mismatch", self.id);
                self.state = ClientState::Closed;
                Ok(true)
            }
            Some(true) => {
                self.update_min_rtt();
                rsa_aes::request_credentials(&mut self.stream);
                self.state = ClientState::WaitRsaAesCredentials;
                Ok(true)
            }
        }
    }

    async fn on_rsa_aes_credentials(&mut self) -> Result<bool> {
        match rsa_aes::handle_credentials(&mut self.buffer) {
            None => Ok(false),
            Some((username, password)) => {
                self.update_min_rtt();
                self.check_credentials(username, password).await.map(|()| true)
            }
        }
    }

    /// Runs the host's username/password predicate.
    async fn check_credentials(&mut self, username: String, password: String) -> Result<()> {
        let accepted = match &self.security.auth_fn {
            Some(auth_fn) => auth_fn(&username, &password),
            None => false,
        };
        if accepted {
            info!("client {}: authenticated as {username:?}", self.id);
            self.security_ok(Some(username), false);
            Ok(())
        } else {
            info!("client {}: bad credentials for {username:?}", self.id);
            self.security_failed("Invalid username or password").await
        }
    }

    // ------------------------------------------------------------------
    // Init
    // ------------------------------------------------------------------

    async fn on_client_init(&mut self) -> Result<bool> {
        if self.buffer.is_empty() {
            return Ok(false);
        }
        let shared = self.buffer.get_u8() != 0;
        self.update_min_rtt();
        if !shared {
            self.server.disconnect_all_except(self.id);
        }

        let (width, height) = self.server.dimensions();
        self.known_width = u32::from(width);
        self.known_height = u32::from(height);

        let init = ServerInit {
            framebuffer_width: width,
            framebuffer_height: height,
            pixel_format: self.server.server_format(),
            name: self.server.name(),
        };
        let mut msg = BytesMut::new();
        init.write_to(&mut msg);
        self.stream.send(msg.freeze(), None);

        self.pixel_format = self.server.server_format();
        self.formats_changed = true;
        self.latest = self.server.latest_frame();
        // Until SetEncodings arrives, Raw is the one encoding every client
        // accepts.
        if self.encoder.is_none() {
            self.encoder = Encoder::for_encoding(ENCODING_RAW);
        }
        self.state = ClientState::Ready;

        self.server.emit(ServerEvent::ClientConnected {
            id: self.id,
            address: self.stream.peer_name().to_string(),
            username: self.username.clone(),
        });
        info!("client {}: handshake complete ({width}x{height})", self.id);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Steady state
    // ------------------------------------------------------------------

    async fn on_client_message(&mut self) -> Result<bool> {
        match self.buffer[0] {
            CLIENT_MSG_SET_PIXEL_FORMAT => self.on_set_pixel_format(),
            CLIENT_MSG_SET_ENCODINGS => self.on_set_encodings(),
            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => self.on_update_request(),
            CLIENT_MSG_KEY_EVENT => self.on_key_event(),
            CLIENT_MSG_POINTER_EVENT => self.on_pointer_event(),
            CLIENT_MSG_CLIENT_CUT_TEXT => self.on_cut_text(),
            CLIENT_MSG_ENABLE_CONTINUOUS_UPDATES => self.on_enable_continuous_updates(),
            CLIENT_MSG_FENCE => self.on_fence(),
            CLIENT_MSG_SET_DESKTOP_SIZE => self.on_set_desktop_size(),
            CLIENT_MSG_QEMU => self.on_qemu_message(),
            other => {
                warn!("client {}: unknown message type {other}", self.id);
                Err(VncError::Protocol(format!("unknown message type {other}")))
            }
        }
    }

    fn on_set_pixel_format(&mut self) -> Result<bool> {
        if self.buffer.len() < 20 {
            return Ok(false);
        }
        self.buffer.advance(4); // type + padding
        let format = PixelFormat::from_bytes(&mut self.buffer)?;

        if format.true_colour_flag == 0 {
            warn!("client {}: colour-mapped formats are unsupported", self.id);
            return Err(VncError::InvalidPixelFormat);
        }
        if !format.is_valid() {
            warn!(
                "client {}: invalid pixel format (bpp={} depth={})",
                self.id, format.bits_per_pixel, format.depth
            );
            return Err(VncError::InvalidPixelFormat);
        }

        debug!(
            "client {}: pixel format {}bpp depth {}",
            self.id, format.bits_per_pixel, format.depth
        );
        self.pixel_format = format;
        self.formats_changed = true;
        Ok(true)
    }

    fn on_set_encodings(&mut self) -> Result<bool> {
        if self.buffer.len() < 4 {
            return Ok(false);
        }
        let count = usize::from(u16::from_be_bytes([self.buffer[2], self.buffer[3]]));
        if self.buffer.len() < 4 + count * 4 {
            return Ok(false);
        }
        self.buffer.advance(4);

        let mut encodings = Vec::with_capacity(count);
        for _ in 0..count {
            let encoding = self.buffer.get_i32();
            encodings.push(encoding);

            match encoding {
                ENCODING_CURSOR => self.has_cursor_ext = true,
                ENCODING_QEMU_LED_STATE => self.has_led_ext = true,
                ENCODING_QEMU_EXT_KEY_EVENT => self.has_qemu_key_ext = true,
                ENCODING_FENCE => self.has_fence_ext = true,
                ENCODING_CONTINUOUS_UPDATES => {
                    if !self.continuous_notified {
                        self.continuous_notified = true;
                        let mut msg = BytesMut::new();
                        msg.put_u8(SERVER_MSG_END_OF_CONTINUOUS_UPDATES);
                        self.stream.send(msg.freeze(), None);
                    }
                }
                ENCODING_DESKTOP_SIZE => self.has_desktop_size = true,
                ENCODING_EXTENDED_DESKTOP_SIZE => self.has_ext_desktop_size = true,
                ENCODING_EXTENDED_CLIPBOARD => {
                    self.has_ext_clipboard = true;
                    if !self.ext_clipboard_notified {
                        self.ext_clipboard_notified = true;
                        self.send_ext_clipboard_caps();
                    }
                }
                q if (ENCODING_QUALITY_LEVEL_0..=ENCODING_QUALITY_LEVEL_9).contains(&q) => {
                    // Level 0..9 maps onto the encoder scale where 0 stays
                    // lossless and 1..10 grade the lossy paths upward.
                    let level = (q - ENCODING_QUALITY_LEVEL_0) as u8;
                    self.quality = level + 1;
                }
                c if (ENCODING_COMPRESS_LEVEL_0..=ENCODING_COMPRESS_LEVEL_9).contains(&c) => {
                    // Compression levels are accepted but the encoders pick
                    // their own deflate levels.
                }
                _ => {}
            }
        }

        self.encodings = encodings;
        let chosen = select_encoding(&self.encodings);
        let rebuild = self.encoder.as_ref().map(Encoder::encoding) != Some(chosen);
        if rebuild {
            self.encoder = Encoder::for_encoding(chosen);
            self.formats_changed = true;
        }
        debug!(
            "client {}: {} encodings, using {}",
            self.id,
            count,
            chosen
        );
        Ok(true)
    }

    fn on_update_request(&mut self) -> Result<bool> {
        if self.buffer.len() < 10 {
            return Ok(false);
        }
        self.buffer.advance(1);
        let incremental = self.buffer.get_u8() != 0;
        let x = i32::from(self.buffer.get_u16());
        let y = i32::from(self.buffer.get_u16());
        let width = i32::from(self.buffer.get_u16());
        let height = i32::from(self.buffer.get_u16());

        self.n_pending_requests += 1;
        if !incremental {
            self.damage.union_rect(&Rect::new(x, y, width, height));
        }
        Ok(true)
    }

    fn on_key_event(&mut self) -> Result<bool> {
        if self.buffer.len() < 8 {
            return Ok(false);
        }
        self.buffer.advance(1);
        let pressed = self.buffer.get_u8() != 0;
        self.buffer.advance(2);
        let keysym = self.buffer.get_u32();

        self.server.emit(ServerEvent::KeyEvent { client_id: self.id, keysym, pressed });
        Ok(true)
    }

    fn on_pointer_event(&mut self) -> Result<bool> {
        if self.buffer.len() < 6 {
            return Ok(false);
        }
        self.buffer.advance(1);
        let button_mask = self.buffer.get_u8();
        let x = self.buffer.get_u16();
        let y = self.buffer.get_u16();

        self.server.emit(ServerEvent::PointerEvent { client_id: self.id, x, y, button_mask });
        Ok(true)
    }

    fn on_cut_text(&mut self) -> Result<bool> {
        if self.buffer.len() < 8 {
            return Ok(false);
        }
        let length = i32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]);

        if length < 0 {
            if !self.has_ext_clipboard {
                return Err(VncError::Protocol(
                    "extended clipboard message without negotiation".into(),
                ));
            }
            return self.on_ext_cut_text(length.unsigned_abs() as usize);
        }

        let length = length as usize;
        if length > MAX_CUT_TEXT_SIZE {
            warn!("client {}: cut text of {length} bytes rejected", self.id);
            return Err(VncError::MessageTooLarge);
        }
        if self.buffer.len() < 8 + length {
            return Ok(false);
        }
        self.buffer.advance(8);
        let text_bytes = self.buffer.split_to(length);
        let text = String::from_utf8_lossy(&text_bytes).into_owned();
        self.server.emit(ServerEvent::ClipboardReceived { client_id: self.id, text });
        Ok(true)
    }

    /// Extended clipboard message: a flags word, then for provide actions a
    /// zlib-compressed block of per-format `u32 length + data`.
    fn on_ext_cut_text(&mut self, length: usize) -> Result<bool> {
        if length > MAX_CUT_TEXT_SIZE {
            return Err(VncError::MessageTooLarge);
        }
        if self.buffer.len() < 8 + length {
            return Ok(false);
        }
        self.buffer.advance(8);
        let body = self.buffer.split_to(length);
        if body.len() < 4 {
            return Ok(true);
        }
        let flags = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);

        if flags & EXT_CLIPBOARD_ACTION_CAPS != 0 {
            debug!("client {}: ext clipboard caps {flags:#010x}", self.id);
            return Ok(true);
        }

        if flags & EXT_CLIPBOARD_ACTION_PROVIDE != 0 && flags & EXT_CLIPBOARD_FORMAT_TEXT != 0 {
            match inflate_ext_clipboard(&body[4..]) {
                Ok(text) => {
                    self.server
                        .emit(ServerEvent::ClipboardReceived { client_id: self.id, text });
                }
                Err(e) => warn!("client {}: bad ext clipboard payload: {e}", self.id),
            }
        }
        Ok(true)
    }

    fn send_ext_clipboard_caps(&mut self) {
        let mut msg = BytesMut::new();
        msg.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
        msg.put_bytes(0, 3);
        msg.put_i32(-8);
        msg.put_u32(
            EXT_CLIPBOARD_ACTION_CAPS
                | EXT_CLIPBOARD_ACTION_PROVIDE
                | EXT_CLIPBOARD_ACTION_REQUEST
                | EXT_CLIPBOARD_ACTION_NOTIFY
                | EXT_CLIPBOARD_FORMAT_TEXT,
        );
        msg.put_u32(MAX_CUT_TEXT_SIZE as u32);
        self.stream.send(msg.freeze(), None);
    }

    fn on_enable_continuous_updates(&mut self) -> Result<bool> {
        if self.buffer.len() < 10 {
            return Ok(false);
        }
        self.buffer.advance(1);
        let enable = self.buffer.get_u8() != 0;
        let x = i32::from(self.buffer.get_u16());
        let y = i32::from(self.buffer.get_u16());
        let width = i32::from(self.buffer.get_u16());
        let height = i32::from(self.buffer.get_u16());

        self.continuous_enabled = enable;
        self.continuous_area = Rect::new(x, y, width, height);
        debug!(
            "client {}: continuous updates {} ({x},{y} {width}x{height})",
            self.id,
            if enable { "on" } else { "off" }
        );

        if !enable {
            let mut msg = BytesMut::new();
            msg.put_u8(SERVER_MSG_END_OF_CONTINUOUS_UPDATES);
            self.stream.send(msg.freeze(), None);
        }
        Ok(true)
    }

    fn on_fence(&mut self) -> Result<bool> {
        if self.buffer.len() < 9 {
            return Ok(false);
        }
        let payload_len = usize::from(self.buffer[8]);
        if payload_len > FENCE_MAX_PAYLOAD {
            return Err(VncError::Protocol("oversized fence payload".into()));
        }
        if self.buffer.len() < 9 + payload_len {
            return Ok(false);
        }
        self.buffer.advance(4);
        let flags = self.buffer.get_u32();
        self.buffer.advance(1);
        let payload = self.buffer.split_to(payload_len);

        if flags & FENCE_REQUEST != 0 {
            // Echo back the supported subset without the request bit.
            let mut msg = BytesMut::new();
            msg.put_u8(SERVER_MSG_FENCE);
            msg.put_bytes(0, 3);
            msg.put_u32(flags & FENCE_FLAGS_SUPPORTED);
            msg.put_u8(payload.len() as u8);
            msg.put_slice(&payload);
            self.stream.send(msg.freeze(), None);
        } else {
            self.on_fence_response();
        }
        Ok(true)
    }

    fn on_fence_response(&mut self) {
        let Some(sent_at) = self.fence_sent_at.take() else {
            debug!("client {}: unsolicited fence response", self.id);
            return;
        };
        let now = Instant::now();
        let rtt = now.duration_since(sent_at).as_micros() as u64;
        self.min_rtt_us = self.min_rtt_us.min(rtt.max(1));
        self.bwe.update_rtt_min(self.min_rtt_us);

        let bytes = self.fence_covered_bytes;
        if bytes > 0 {
            let arrival = self.now_us();
            let departure = arrival.saturating_sub(rtt);
            self.bwe.feed(BweSample { bytes, departure_time: departure, arrival_time: arrival });
        }
        self.is_blocked_by_fence = false;
    }

    fn on_set_desktop_size(&mut self) -> Result<bool> {
        let Some(layout) = parse_set_desktop_size(&mut self.buffer) else {
            return Ok(false);
        };

        let status = if self.has_ext_desktop_size && layout.is_valid() {
            EXT_DESKTOP_SIZE_STATUS_OK
        } else {
            EXT_DESKTOP_SIZE_STATUS_INVALID
        };

        // Reply: an update with one ExtendedDesktopSize rect, reason 1
        // (this client asked).
        let mut msg = BytesMut::new();
        msg.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        msg.put_u8(0);
        msg.put_u16(1);
        put_extended_desktop_size_rect(&mut msg, 1, status, &layout);
        self.stream.send(msg.freeze(), None);

        if status == EXT_DESKTOP_SIZE_STATUS_OK {
            self.server
                .emit(ServerEvent::DesktopLayoutRequested { client_id: self.id, layout });
        }
        Ok(true)
    }

    fn on_qemu_message(&mut self) -> Result<bool> {
        if self.buffer.len() < 2 {
            return Ok(false);
        }
        match self.buffer[1] {
            QEMU_MSG_EXTENDED_KEY_EVENT => {
                if self.buffer.len() < 12 {
                    return Ok(false);
                }
                self.buffer.advance(2);
                let pressed = self.buffer.get_u16() != 0;
                let keysym = self.buffer.get_u32();
                let keycode = self.buffer.get_u32();
                if self.has_qemu_key_ext {
                    self.server.emit(ServerEvent::KeyCodeEvent {
                        client_id: self.id,
                        keysym,
                        keycode,
                        pressed,
                    });
                } else {
                    // Not negotiated: degrade to the plain key event.
                    self.server.emit(ServerEvent::KeyEvent {
                        client_id: self.id,
                        keysym,
                        pressed,
                    });
                }
                Ok(true)
            }
            other => {
                warn!("client {}: unknown QEMU subtype {other}", self.id);
                Err(VncError::Protocol(format!("unknown QEMU message {other}")))
            }
        }
    }

    // ------------------------------------------------------------------
    // Update pipeline
    // ------------------------------------------------------------------

    /// True when the pacing rule says the pipe is full.
    fn over_bandwidth_budget(&self) -> bool {
        let estimate = self.bwe.estimate();
        if estimate == 0 {
            return false;
        }
        let budget = bandwidth_budget(estimate, self.min_rtt_us);
        self.inflight_bytes.load(Ordering::Acquire) as u64 > budget.max(1)
    }

    /// Tells the client about a server-side desktop size change.
    fn maybe_notify_resize(&mut self) {
        if self.state != ClientState::Ready {
            return;
        }
        let (width, height) = self.server.dimensions();
        if u32::from(width) == self.known_width && u32::from(height) == self.known_height {
            return;
        }
        self.known_width = u32::from(width);
        self.known_height = u32::from(height);

        if self.has_ext_desktop_size {
            let layout = self.server.desktop_layout();
            let mut msg = BytesMut::new();
            msg.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
            msg.put_u8(0);
            msg.put_u16(1);
            put_extended_desktop_size_rect(&mut msg, 0, EXT_DESKTOP_SIZE_STATUS_OK, &layout);
            self.stream.send(msg.freeze(), None);
        } else if self.has_desktop_size {
            let mut msg = BytesMut::new();
            msg.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
            msg.put_u8(0);
            msg.put_u16(1);
            msg.put_u16(0);
            msg.put_u16(0);
            msg.put_u16(width);
            msg.put_u16(height);
            msg.put_i32(ENCODING_DESKTOP_SIZE);
            self.stream.send(msg.freeze(), None);
        }

        // Either way the client repaints from scratch.
        self.damage
            .union_rect(&Rect::new(0, 0, i32::from(width), i32::from(height)));
        debug!("client {}: desktop resized to {width}x{height}", self.id);
    }

    async fn maybe_send_update(&mut self) -> Result<()> {
        self.maybe_notify_resize();
        if self.state != ClientState::Ready || self.encoder.is_none() {
            return Ok(());
        }
        if self.damage.is_empty() || self.latest.is_none() {
            return Ok(());
        }
        if self.n_pending_requests == 0 && !self.continuous_enabled {
            return Ok(());
        }
        if self.is_blocked_by_fence {
            return Ok(());
        }
        if self.has_fence_ext && self.over_bandwidth_budget() {
            self.send_blocking_fence();
            return Ok(());
        }

        // Frame damage is bounded by what the client knows about, and by the
        // continuous-updates area when that mode is active.
        let mut wanted = self.damage.clone();
        wanted.intersect_rect(&Rect::new(
            0,
            0,
            self.known_width as i32,
            self.known_height as i32,
        ));
        if self.continuous_enabled {
            wanted.intersect_rect(&self.continuous_area);
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let Some(latest) = self.latest.clone() else {
            return Ok(());
        };
        let (out_cfb, out_damage) = self.resampler.compose(&latest, &wanted).await?;

        let ignores_damage = self
            .encoder
            .as_ref()
            .is_some_and(Encoder::ignores_damage);

        // Hash refinement needs a single plain buffer to walk. The buffer is
        // held so producers keep out while it is being hashed.
        let refined = if !ignores_damage && out_cfb.len() == 1 {
            let fb = &out_cfb.fbs()[0].fb;
            if fb.width() == out_cfb.width() && fb.height() == out_cfb.height() {
                self.refinery.resize(fb.width(), fb.height());
                fb.hold();
                let refined = self.refinery.refine(&out_damage, fb);
                fb.release();
                refined
            } else {
                out_damage
            }
        } else {
            out_damage
        };

        self.damage.clear();
        if refined.is_empty() && !ignores_damage {
            return Ok(());
        }

        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        if self.formats_changed {
            encoder.set_output_format(&self.pixel_format);
            self.formats_changed = false;
        }
        encoder.set_quality(self.quality);

        let frame = encoder.encode(out_cfb, refined).await?;
        self.n_pending_requests = self.n_pending_requests.saturating_sub(1);

        if frame.n_rects == 0 && !self.pending_pseudo_rects() {
            return Ok(());
        }
        self.send_update_message(frame)?;

        if self.has_fence_ext && self.fence_sent_at.is_none() {
            self.send_blocking_fence();
        }
        Ok(())
    }

    /// True when a cursor or LED rectangle is waiting to ride along.
    fn pending_pseudo_rects(&self) -> bool {
        (self.has_cursor_ext && self.server.cursor_seq() > self.cursor_seq)
            || (self.has_led_ext && self.led_state_sent != Some(self.server.led_state()))
    }

    fn send_update_message(&mut self, frame: crate::encoding::EncodedFrame) -> Result<()> {
        let mut extra_rects = 0u32;
        let mut extras = BytesMut::new();

        if self.has_cursor_ext {
            let (seq, cursor) = self.server.cursor();
            if seq > self.cursor_seq {
                if let Some(cursor) = cursor {
                    crate::cursor::encode_cursor_rect(&mut extras, &cursor, &self.pixel_format)?;
                    extra_rects += 1;
                }
                self.cursor_seq = seq;
            }
        }

        if self.has_led_ext {
            let led = self.server.led_state();
            if self.led_state_sent != Some(led) {
                extras.put_u16(0);
                extras.put_u16(0);
                extras.put_u16(0);
                extras.put_u16(0);
                extras.put_i32(ENCODING_QEMU_LED_STATE);
                extras.put_u8(led);
                extra_rects += 1;
                self.led_state_sent = Some(led);
            }
        }

        let n_rects = frame.n_rects + extra_rects;
        if n_rects > u32::from(u16::MAX) {
            return Err(VncError::Encoding("rectangle count overflow".into()));
        }

        let mut msg = BytesMut::with_capacity(4 + extras.len() + frame.buf.len());
        msg.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        msg.put_u8(0);
        msg.put_u16(n_rects as u16);
        msg.put_slice(&extras);
        msg.put_slice(&frame.buf);

        let len = msg.len();
        self.bytes_sent_total += len as u64;
        self.inflight_bytes.fetch_add(len, Ordering::AcqRel);
        let inflight = self.inflight_bytes.clone();
        self.stream.send(
            msg.freeze(),
            Some(Box::new(move |_result: SendResult| {
                inflight.fetch_sub(len, Ordering::AcqRel);
            })),
        );
        Ok(())
    }

    /// Injects a fence the client must answer before more data flows.
    fn send_blocking_fence(&mut self) {
        if self.fence_sent_at.is_some() {
            return;
        }
        let mut msg = BytesMut::new();
        msg.put_u8(SERVER_MSG_FENCE);
        msg.put_bytes(0, 3);
        msg.put_u32(FENCE_REQUEST | FENCE_BLOCK_BEFORE);
        msg.put_u8(0);
        self.stream.send(msg.freeze(), None);

        self.fence_sent_at = Some(Instant::now());
        self.fence_covered_bytes = self.bytes_sent_total - self.last_fence_marker;
        self.last_fence_marker = self.bytes_sent_total;
        if self.over_bandwidth_budget() {
            self.is_blocked_by_fence = true;
        }
    }
}

/// Pending bytes allowed before a blocking fence: twice the
/// bandwidth-delay product.
fn bandwidth_budget(estimate_bps: u64, rtt_min_us: u64) -> u64 {
    estimate_bps.saturating_mul(2).saturating_mul(rtt_min_us) / 1_000_000
}

/// Decompresses an extended-clipboard provide payload and extracts the
/// UTF-8 text entry.
fn inflate_ext_clipboard(data: &[u8]) -> Result<String> {
    use flate2::{Decompress, FlushDecompress};

    let mut z = Decompress::new(true);
    let mut out = vec![0u8; MAX_CUT_TEXT_SIZE.min(1 << 20)];
    let mut total = 0usize;
    let mut pos = 0usize;

    while pos < data.len() && total < out.len() {
        let before_in = z.total_in();
        let before_out = z.total_out();
        z.decompress(&data[pos..], &mut out[total..], FlushDecompress::Sync)
            .map_err(|e| VncError::Protocol(format!("clipboard inflate failed: {e}")))?;
        pos += (z.total_in() - before_in) as usize;
        total += (z.total_out() - before_out) as usize;
        if z.total_in() == before_in && z.total_out() == before_out {
            break;
        }
    }

    if total < 4 {
        return Err(VncError::Protocol("clipboard payload too short".into()));
    }
    let len = u32::from_be_bytes([out[0], out[1], out[2], out[3]]) as usize;
    let end = (4 + len).min(total);
    Ok(String::from_utf8_lossy(&out[4..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacing_budget_is_twice_the_bdp() {
        // 1 MB/s at a 20 ms floor: at most ~40 kB may be pending.
        assert_eq!(bandwidth_budget(1_000_000, 20_000), 40_000);
        assert_eq!(bandwidth_budget(0, 20_000), 0);
        assert_eq!(bandwidth_budget(u64::MAX, u64::MAX), u64::MAX / 1_000_000);
    }

    #[test]
    fn ext_clipboard_payload_round_trips() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let text = b"clipboard contents";
        let mut raw = Vec::new();
        raw.extend_from_slice(&(text.len() as u32).to_be_bytes());
        raw.extend_from_slice(text);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(inflate_ext_clipboard(&compressed).unwrap(), "clipboard contents");
    }
}
