// Copyright 2026 The prismvnc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The VNC server: listening sockets, client registry and the producer API.
//!
//! A [`VncServer`] owns any number of listeners (TCP, Unix-domain,
//! WebSocket-over-TCP, or externally accepted sockets), the display slots
//! producers feed, and the shared state sessions read: desktop name,
//! security configuration, cursor, and keyboard LED state. Each accepted
//! connection runs as its own task; the server only passes messages.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use log::{error, info, warn};

use crate::auth::{AuthFn, SecurityConfig};
use crate::client::ClientSession;
use crate::composite::{CompositeFb, PlacedFb};
use crate::crypto::RsaKeyPair;
use crate::cursor::Cursor;
use crate::damage::Region;
use crate::display::Display;
use crate::error::Result;
use crate::events::ServerEvent;
use crate::fb::Framebuffer;
use crate::pixels::{pixfmt_from_fourcc, FOURCC_XRGB8888};
use crate::protocol::PixelFormat;
use crate::stream::{tls, Stream};

/// A frame handed to a client session: the current composite plus damage.
pub(crate) struct FrameUpdate {
    pub cfb: CompositeFb,
    pub damage: Region,
}

struct DisplayState {
    x_pos: i32,
    y_pos: i32,
    fb: Option<Arc<Framebuffer>>,
}

struct ClientHandle {
    frame_tx: mpsc::UnboundedSender<FrameUpdate>,
    abort: AbortHandle,
}

pub(crate) struct ServerInner {
    name: Mutex<String>,
    displays: Mutex<Vec<DisplayState>>,
    clients: Mutex<HashMap<usize, ClientHandle>>,
    listeners: Mutex<Vec<AbortHandle>>,
    next_client_id: AtomicUsize,
    security: Mutex<SecurityConfig>,
    rsa_keys: Mutex<Option<Arc<RsaKeyPair>>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    cursor: Mutex<Option<Cursor>>,
    cursor_seq: AtomicU64,
    led_state: AtomicU8,
    is_closing: AtomicBool,
}

impl ServerInner {
    pub(crate) fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub(crate) fn security_config(&self) -> SecurityConfig {
        self.security.lock().unwrap().clone()
    }

    /// The server RSA key, generated on first use when none was installed.
    pub(crate) fn rsa_keys(&self) -> Result<Arc<RsaKeyPair>> {
        let mut slot = self.rsa_keys.lock().unwrap();
        if let Some(keys) = slot.as_ref() {
            return Ok(keys.clone());
        }
        warn!("no RSA key set; generating an ephemeral one");
        let keys = Arc::new(RsaKeyPair::generate()?);
        *slot = Some(keys.clone());
        Ok(keys)
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Extent of the composite desktop.
    pub(crate) fn dimensions(&self) -> (u16, u16) {
        let displays = self.displays.lock().unwrap();
        let mut width = 0i32;
        let mut height = 0i32;
        for display in displays.iter() {
            if let Some(fb) = &display.fb {
                width = width.max(display.x_pos + fb.logical_width() as i32);
                height = height.max(display.y_pos + fb.logical_height() as i32);
            }
        }
        (width.clamp(0, i32::from(u16::MAX)) as u16, height.clamp(0, i32::from(u16::MAX)) as u16)
    }

    /// The native wire format, following the first display's buffer.
    pub(crate) fn server_format(&self) -> PixelFormat {
        let displays = self.displays.lock().unwrap();
        displays
            .iter()
            .find_map(|d| d.fb.as_ref())
            .and_then(|fb| pixfmt_from_fourcc(fb.fourcc()))
            .unwrap_or_else(|| {
                pixfmt_from_fourcc(FOURCC_XRGB8888).expect("static format")
            })
    }

    /// The current composite, if any display holds a buffer.
    pub(crate) fn latest_frame(&self) -> Option<CompositeFb> {
        let displays = self.displays.lock().unwrap();
        let placed: Vec<PlacedFb> = displays
            .iter()
            .filter_map(|d| {
                d.fb.as_ref().map(|fb| PlacedFb {
                    fb: fb.clone(),
                    x_off: d.x_pos,
                    y_off: d.y_pos,
                })
            })
            .collect();
        drop(displays);

        match CompositeFb::new(placed) {
            Ok(cfb) => Some(cfb),
            Err(_) => None,
        }
    }

    /// The current layout: one screen per display holding a buffer.
    pub(crate) fn desktop_layout(&self) -> crate::desktop_layout::DesktopLayout {
        let (width, height) = self.dimensions();
        let displays = self.displays.lock().unwrap();
        let screens = displays
            .iter()
            .enumerate()
            .filter_map(|(id, d)| {
                d.fb.as_ref().map(|fb| crate::protocol::Screen {
                    id: id as u32,
                    x: d.x_pos.clamp(0, i32::from(u16::MAX)) as u16,
                    y: d.y_pos.clamp(0, i32::from(u16::MAX)) as u16,
                    width: fb.logical_width().min(u32::from(u16::MAX)) as u16,
                    height: fb.logical_height().min(u32::from(u16::MAX)) as u16,
                    flags: 0,
                })
            })
            .collect();
        crate::desktop_layout::DesktopLayout { width, height, screens }
    }

    pub(crate) fn set_display_position(&self, id: usize, x: i32, y: i32) {
        let mut displays = self.displays.lock().unwrap();
        if let Some(display) = displays.get_mut(id) {
            display.x_pos = x;
            display.y_pos = y;
        }
    }

    /// Accepts a producer frame and fans damage out to every session.
    pub(crate) fn feed_display(&self, id: usize, fb: Arc<Framebuffer>, damage: &Region) {
        let (x_pos, y_pos) = {
            let mut displays = self.displays.lock().unwrap();
            let Some(display) = displays.get_mut(id) else {
                warn!("feed on unknown display {id}");
                return;
            };
            display.fb = Some(fb);
            (display.x_pos, display.y_pos)
        };

        let Some(cfb) = self.latest_frame() else {
            error!("display {id}: buffers no longer form a valid composite");
            return;
        };

        let mut translated = damage.clone();
        translated.translate(x_pos, y_pos);

        let clients = self.clients.lock().unwrap();
        for handle in clients.values() {
            let _ = handle.frame_tx.send(FrameUpdate {
                cfb: cfb.clone(),
                damage: translated.clone(),
            });
        }
    }

    pub(crate) fn remove_client(&self, id: usize) {
        self.clients.lock().unwrap().remove(&id);
    }

    /// Implements the ClientInit `shared = 0` semantics.
    pub(crate) fn disconnect_all_except(&self, id: usize) {
        let clients = self.clients.lock().unwrap();
        for (&other, handle) in clients.iter() {
            if other != id {
                handle.abort.abort();
            }
        }
    }

    pub(crate) fn cursor(&self) -> (u64, Option<Cursor>) {
        (
            self.cursor_seq.load(Ordering::Acquire),
            self.cursor.lock().unwrap().clone(),
        )
    }

    pub(crate) fn cursor_seq(&self) -> u64 {
        self.cursor_seq.load(Ordering::Acquire)
    }

    pub(crate) fn led_state(&self) -> u8 {
        self.led_state.load(Ordering::Acquire)
    }

    fn install_client(self: &Arc<Self>, stream: Stream) {
        if self.is_closing.load(Ordering::Acquire) {
            return;
        }
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let session = ClientSession::new(id, self.clone(), stream, frame_rx);
        let task = tokio::spawn(session.run());

        self.clients.lock().unwrap().insert(
            id,
            ClientHandle { frame_tx, abort: task.abort_handle() },
        );
    }
}

/// A VNC (RFB) server instance.
///
/// ```no_run
/// use prismvnc::{VncServer, Framebuffer, Region, Rect};
/// use prismvnc::pixels::FOURCC_XRGB8888;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = VncServer::new("my desktop");
///     let display = server.add_display(0, 0);
///     server.listen("127.0.0.1:5900").await?;
///
///     let fb = Framebuffer::new(1280, 720, FOURCC_XRGB8888, 1280)?;
///     // ... draw into fb ...
///     display.feed(fb, &Region::from_rect(Rect::new(0, 0, 1280, 720)));
///     Ok(())
/// }
/// ```
pub struct VncServer {
    inner: Arc<ServerInner>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
}

impl VncServer {
    /// Creates a server with the given desktop name and no listeners.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ServerInner {
                name: Mutex::new(name.to_string()),
                displays: Mutex::new(Vec::new()),
                clients: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_client_id: AtomicUsize::new(0),
                security: Mutex::new(SecurityConfig::open()),
                rsa_keys: Mutex::new(None),
                event_tx,
                cursor: Mutex::new(None),
                cursor_seq: AtomicU64::new(0),
                led_state: AtomicU8::new(0),
                is_closing: AtomicBool::new(false),
            }),
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Takes the event receiver. Call once, before serving.
    ///
    /// # Panics
    ///
    /// Panics when called twice.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        self.event_rx
            .lock()
            .unwrap()
            .take()
            .expect("event receiver already taken")
    }

    /// Changes the advertised desktop name.
    pub fn set_name(&self, name: &str) {
        *self.inner.name.lock().unwrap() = name.to_string();
    }

    /// Adds a display slot at a position on the composite desktop.
    pub fn add_display(&self, x: i32, y: i32) -> Display {
        let mut displays = self.inner.displays.lock().unwrap();
        let id = displays.len();
        displays.push(DisplayState { x_pos: x, y_pos: y, fb: None });
        Display::new(id, Arc::downgrade(&self.inner))
    }

    /// Replaces the security configuration.
    pub fn set_security(&self, config: SecurityConfig) {
        *self.inner.security.lock().unwrap() = config;
    }

    /// Enables classic VNC authentication with a password, or disables it
    /// with `None`.
    pub fn set_password(&self, password: Option<String>) {
        let mut security = self.inner.security.lock().unwrap();
        security.password = password;
        security.allow_none = security.password.is_none();
    }

    /// Installs the username/password predicate used by VeNCrypt, Apple DH
    /// and RSA-AES.
    pub fn set_auth_fn(&self, auth_fn: AuthFn) {
        let mut security = self.inner.security.lock().unwrap();
        security.auth_fn = Some(auth_fn);
        security.allow_none = false;
    }

    /// Loads TLS credentials, enabling VeNCrypt X509Plain.
    ///
    /// # Errors
    ///
    /// Fails when the certificate or key cannot be loaded.
    pub fn set_tls_credentials(&self, cert: &Path, key: &Path) -> Result<()> {
        let acceptor = tls::acceptor_from_pem_files(cert, key)?;
        self.inner.security.lock().unwrap().tls = Some(acceptor);
        Ok(())
    }

    /// Loads a PKCS#1 PEM RSA private key for the RSA-AES security types.
    ///
    /// # Errors
    ///
    /// Fails on malformed PEM content.
    pub fn set_rsa_credentials(&self, pem: &str) -> Result<()> {
        let keys = Arc::new(RsaKeyPair::from_pkcs1_pem(pem)?);
        *self.inner.rsa_keys.lock().unwrap() = Some(keys.clone());
        self.inner.security.lock().unwrap().rsa_keys = Some(keys);
        Ok(())
    }

    /// Sets the cursor image; the next update per client carries it.
    pub fn set_cursor(&self, fb: Arc<Framebuffer>, hotspot_x: u16, hotspot_y: u16) {
        *self.inner.cursor.lock().unwrap() = Some(Cursor { fb, hotspot_x, hotspot_y });
        self.inner.cursor_seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Updates the keyboard LED state mirrored to clients that negotiated
    /// the LED pseudo-encoding.
    pub fn set_led_state(&self, state: u8) {
        self.inner.led_state.store(state, Ordering::Release);
    }

    /// Listens for plain RFB connections on a TCP address.
    ///
    /// # Errors
    ///
    /// Fails when the address cannot be bound.
    pub async fn listen(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {addr}");
        self.spawn_tcp_acceptor(listener, false);
        Ok(())
    }

    /// Listens for RFB-over-WebSocket connections on a TCP address.
    ///
    /// # Errors
    ///
    /// Fails when the address cannot be bound.
    pub async fn listen_websocket(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {addr} (websocket)");
        self.spawn_tcp_acceptor(listener, true);
        Ok(())
    }

    fn spawn_tcp_acceptor(&self, listener: TcpListener, websocket: bool) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        let stream = if websocket {
                            Stream::from_tcp_websocket(socket)
                        } else {
                            Stream::from_tcp(socket)
                        };
                        inner.install_client(stream);
                    }
                    Err(e) => {
                        error!("accept failed: {e}");
                        break;
                    }
                }
            }
        });
        self.inner.listeners.lock().unwrap().push(task.abort_handle());
    }

    /// Listens on a Unix-domain socket path.
    ///
    /// # Errors
    ///
    /// Fails when the path cannot be bound.
    #[cfg(unix)]
    pub async fn listen_unix(&self, path: &Path) -> Result<()> {
        let listener = UnixListener::bind(path)?;
        info!("listening on {}", path.display());

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => inner.install_client(Stream::from_unix(socket)),
                    Err(e) => {
                        error!("accept failed: {e}");
                        break;
                    }
                }
            }
        });
        self.inner.listeners.lock().unwrap().push(task.abort_handle());
        Ok(())
    }

    /// Installs an already accepted TCP connection (e.g. an inherited fd).
    pub fn attach(&self, socket: TcpStream) {
        self.inner.install_client(Stream::from_tcp(socket));
    }

    /// Installs an already accepted Unix-domain connection.
    #[cfg(unix)]
    pub fn attach_unix(&self, socket: UnixStream) {
        self.inner.install_client(Stream::from_unix(socket));
    }

    /// Shuts the server down: stops listeners and asks every client task to
    /// finish. Safe to call from event handlers; teardown completes on the
    /// runtime, not inside the call.
    pub fn close(&self) {
        self.inner.is_closing.store(true, Ordering::Release);
        for listener in self.inner.listeners.lock().unwrap().drain(..) {
            listener.abort();
        }
        let clients = self.inner.clients.lock().unwrap();
        for handle in clients.values() {
            handle.abort.abort();
        }
    }
}

impl Drop for VncServer {
    fn drop(&mut self) {
        self.close();
    }
}
