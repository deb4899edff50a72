//! Server events that can be received by the application.

use crate::desktop_layout::DesktopLayout;

/// Events emitted by the VNC server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client has connected and completed the handshake.
    ClientConnected {
        /// Unique client identifier.
        id: usize,
        /// Peer address, or "unix" for Unix-domain connections.
        address: String,
        /// Authenticated username, when the security type carries one.
        username: Option<String>,
    },

    /// A client has disconnected from the server.
    ClientDisconnected {
        /// Unique client identifier.
        id: usize,
    },

    /// Pointer movement or button event from a client.
    PointerEvent {
        /// Client identifier.
        client_id: usize,
        /// X coordinate.
        x: u16,
        /// Y coordinate.
        y: u16,
        /// Button mask (bit 0 = left, bit 1 = middle, bit 2 = right).
        button_mask: u8,
    },

    /// Key press or release event from a client.
    KeyEvent {
        /// Client identifier.
        client_id: usize,
        /// Key symbol (X11 keysym).
        keysym: u32,
        /// True if pressed, false if released.
        pressed: bool,
    },

    /// Key event carrying a raw XT keycode next to the keysym (QEMU
    /// extended key event).
    KeyCodeEvent {
        /// Client identifier.
        client_id: usize,
        /// Key symbol (X11 keysym), zero when unknown.
        keysym: u32,
        /// XT scancode.
        keycode: u32,
        /// True if pressed, false if released.
        pressed: bool,
    },

    /// Clipboard text received from a client.
    ClipboardReceived {
        /// Client identifier.
        client_id: usize,
        /// Clipboard text content.
        text: String,
    },

    /// A client asked for a new desktop layout (SetDesktopSize).
    DesktopLayoutRequested {
        /// Client identifier.
        client_id: usize,
        /// The requested layout.
        layout: DesktopLayout,
    },
}
