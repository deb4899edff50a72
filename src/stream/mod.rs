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

//! Duplex byte transport with a unified send queue.
//!
//! Every client connection talks through a [`Stream`]: plain TCP or Unix at
//! the bottom, optionally upgraded to TLS (VeNCrypt) or wrapped in WebSocket
//! framing or RSA-AES records. TCP is the leaf; TLS replaces the I/O object
//! while WebSocket and RSA-AES decorate it, all behind the same contract:
//!
//! - Outbound payloads join a FIFO and are delivered whole, in order,
//!   exactly once, or fail. Each request may carry a completion callback
//!   which fires exactly once with [`SendResult::Done`] or
//!   [`SendResult::Failed`].
//! - `read_buf` returning 0 means the peer closed.
//! - `close` is idempotent and fails everything still queued.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

use crate::crypto::{AeadCipher, AeadCipherType};
use crate::error::{Result, VncError};

pub mod rsa_aes;
pub mod tcp;
pub mod tls;
pub mod ws;

use rsa_aes::RecordCodec;
use tcp::Socket;
use ws::{FrameEvent, FrameParser, HandshakeProgress};

/// Outcome reported to a send request's completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The payload was handed to the transport in full.
    Done,
    /// The stream failed or closed before the payload went out.
    Failed,
}

/// Completion callback attached to a send request.
pub type OnDone = Box<dyn FnOnce(SendResult) + Send>;

/// Lazily produced payload for [`Stream::exec_and_send`].
pub type PayloadFn = Box<dyn FnOnce() -> Bytes + Send>;

enum Payload {
    Ready(Bytes),
    Deferred(PayloadFn),
}

struct StreamRequest {
    payload: Payload,
    on_done: Option<OnDone>,
}

impl StreamRequest {
    fn complete(mut self, result: SendResult) {
        if let Some(f) = self.on_done.take() {
            f(result);
        }
    }
}

enum Transport {
    Plain(Socket),
    Tls(Box<tokio_rustls::server::TlsStream<Socket>>),
    Ws {
        socket: Socket,
        handshake_done: bool,
        raw: BytesMut,
        parser: FrameParser,
        inbox: BytesMut,
    },
    RsaAes {
        socket: Socket,
        codec: RecordCodec,
        raw: BytesMut,
        inbox: BytesMut,
    },
    Closed,
}

/// A duplex byte stream with an ordered send queue.
pub struct Stream {
    transport: Transport,
    queue: VecDeque<StreamRequest>,
    remote_closed: bool,
    peer: String,
}

impl Stream {
    /// Wraps an accepted TCP connection.
    #[must_use]
    pub fn from_tcp(stream: tokio::net::TcpStream) -> Self {
        let socket = Socket::from_tcp(stream);
        let peer = socket.peer_name();
        Self::from_transport(Transport::Plain(socket), peer)
    }

    /// Wraps an accepted Unix-domain connection.
    #[cfg(unix)]
    #[must_use]
    pub fn from_unix(stream: tokio::net::UnixStream) -> Self {
        let socket = Socket::from_unix(stream);
        let peer = socket.peer_name();
        Self::from_transport(Transport::Plain(socket), peer)
    }

    /// Wraps an accepted TCP connection that speaks WebSocket.
    ///
    /// The stream is corked until the HTTP upgrade completes; queued payloads
    /// flush after the `101` response.
    #[must_use]
    pub fn from_tcp_websocket(stream: tokio::net::TcpStream) -> Self {
        let socket = Socket::from_tcp(stream);
        let peer = socket.peer_name();
        Self::from_transport(
            Transport::Ws {
                socket,
                handshake_done: false,
                raw: BytesMut::with_capacity(4096),
                parser: FrameParser::default(),
                inbox: BytesMut::with_capacity(4096),
            },
            peer,
        )
    }

    fn from_transport(transport: Transport, peer: String) -> Self {
        Self {
            transport,
            queue: VecDeque::new(),
            remote_closed: false,
            peer,
        }
    }

    /// Peer address for log messages.
    #[must_use]
    pub fn peer_name(&self) -> &str {
        &self.peer
    }

    /// True after [`Stream::close`] or a fatal transport error.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.transport, Transport::Closed)
    }

    /// Closes the stream, failing every queued request. Idempotent.
    pub fn close(&mut self) {
        for request in self.queue.drain(..) {
            request.complete(SendResult::Failed);
        }
        if !matches!(self.transport, Transport::Closed) {
            log::debug!("stream to {} closed", self.peer);
        }
        self.transport = Transport::Closed;
    }

    /// Appends a payload to the send FIFO.
    ///
    /// The callback fires exactly once, after the payload was written in full
    /// (`Done`) or the stream failed (`Failed`). Call [`Stream::flush`] to
    /// drive the queue.
    pub fn send(&mut self, payload: Bytes, on_done: Option<OnDone>) {
        if self.is_closed() {
            if let Some(f) = on_done {
                f(SendResult::Failed);
            }
            return;
        }
        self.queue.push_back(StreamRequest { payload: Payload::Ready(payload), on_done });
    }

    /// Front-of-queue insertion. Only used to prepend a handshake reply.
    pub fn send_first(&mut self, payload: Bytes) {
        if self.is_closed() {
            return;
        }
        self.queue.push_front(StreamRequest { payload: Payload::Ready(payload), on_done: None });
    }

    /// Enqueues a request whose payload is produced at flush time, so the
    /// bytes are built against the latest state.
    pub fn exec_and_send(&mut self, producer: PayloadFn, on_done: Option<OnDone>) {
        if self.is_closed() {
            if let Some(f) = on_done {
                f(SendResult::Failed);
            }
            return;
        }
        self.queue.push_back(StreamRequest { payload: Payload::Deferred(producer), on_done });
    }

    /// Number of requests waiting in the send FIFO.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Drives the send FIFO until empty or blocked.
    ///
    /// # Errors
    ///
    /// A write failure fails all queued requests and closes the stream.
    pub async fn flush(&mut self) -> Result<()> {
        // A corked WebSocket holds everything back until the handshake
        // response has been written.
        if let Transport::Ws { handshake_done: false, .. } = self.transport {
            return Ok(());
        }

        while !self.queue.is_empty() {
            // Plain sockets drain several payloads with one vectored write;
            // the wrapped transports frame payload by payload.
            if matches!(self.transport, Transport::Plain(_)) && self.queue.len() > 1 {
                self.flush_vectored().await?;
                continue;
            }

            let Some(request) = self.queue.pop_front() else {
                break;
            };
            let bytes = match request.payload {
                Payload::Ready(bytes) => bytes,
                Payload::Deferred(producer) => producer(),
            };

            match self.write_payload(&bytes).await {
                Ok(()) => {
                    if let Some(f) = request.on_done {
                        f(SendResult::Done);
                    }
                }
                Err(e) => {
                    if let Some(f) = request.on_done {
                        f(SendResult::Failed);
                    }
                    self.close();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Writes a batch of queued payloads with vectored I/O, trimming the
    /// head payload on partial writes and re-issuing until the batch is on
    /// the wire. Completion callbacks fire in enqueue order.
    async fn flush_vectored(&mut self) -> Result<()> {
        const MAX_IOV: usize = 64;

        let n = self.queue.len().min(MAX_IOV);
        let mut batch: Vec<(Bytes, Option<OnDone>)> = Vec::with_capacity(n);
        for request in self.queue.drain(..n) {
            let bytes = match request.payload {
                Payload::Ready(bytes) => bytes,
                Payload::Deferred(producer) => producer(),
            };
            batch.push((bytes, request.on_done));
        }

        let mut completed = 0usize;
        let mut head_offset = 0usize;

        let result: Result<()> = 'write: {
            let Transport::Plain(socket) = &mut self.transport else {
                break 'write Err(VncError::ConnectionClosed);
            };

            while completed < batch.len() {
                // Zero-length payloads complete without touching the wire.
                while completed < batch.len() && batch[completed].0.len() == head_offset {
                    head_offset = 0;
                    if let Some(f) = batch[completed].1.take() {
                        f(SendResult::Done);
                    }
                    completed += 1;
                }
                if completed == batch.len() {
                    break;
                }

                let mut slices = Vec::with_capacity(batch.len() - completed);
                slices.push(std::io::IoSlice::new(&batch[completed].0[head_offset..]));
                for (bytes, _) in &batch[completed + 1..] {
                    slices.push(std::io::IoSlice::new(bytes));
                }

                let written = match socket.write_vectored(&slices).await {
                    Ok(0) => {
                        break 'write Err(VncError::Io(std::io::Error::from(
                            std::io::ErrorKind::WriteZero,
                        )));
                    }
                    Ok(written) => written,
                    Err(e) => break 'write Err(e.into()),
                };

                let mut remaining = written;
                while remaining > 0 {
                    let head_len = batch[completed].0.len() - head_offset;
                    if remaining >= head_len {
                        remaining -= head_len;
                        head_offset = 0;
                        if let Some(f) = batch[completed].1.take() {
                            f(SendResult::Done);
                        }
                        completed += 1;
                    } else {
                        head_offset += remaining;
                        remaining = 0;
                    }
                }
            }
            Ok(())
        };

        if let Err(e) = result {
            for (_, on_done) in batch.iter_mut().skip(completed) {
                if let Some(f) = on_done.take() {
                    f(SendResult::Failed);
                }
            }
            self.close();
            return Err(e);
        }
        Ok(())
    }

    async fn write_payload(&mut self, bytes: &Bytes) -> Result<()> {
        match &mut self.transport {
            Transport::Plain(socket) => socket.write_all(bytes).await?,
            Transport::Tls(tls) => tls.write_all(bytes).await?,
            Transport::Ws { socket, .. } => {
                let framed = ws::frame_binary(bytes);
                socket.write_all(&framed).await?;
            }
            Transport::RsaAes { socket, codec, .. } => {
                let sealed = codec.seal(bytes)?;
                socket.write_all(&sealed).await?;
            }
            Transport::Closed => return Err(VncError::ConnectionClosed),
        }
        Ok(())
    }

    /// Reads available bytes into `dst`.
    ///
    /// Returns the number of bytes read; `0` means the peer closed the
    /// connection (including a WebSocket CLOSE frame).
    ///
    /// # Errors
    ///
    /// Fatal transport errors close the stream.
    pub async fn read_buf(&mut self, dst: &mut BytesMut) -> Result<usize> {
        let result = self.read_buf_inner(dst).await;
        if result.is_err() {
            self.close();
        }
        result
    }

    async fn read_buf_inner(&mut self, dst: &mut BytesMut) -> Result<usize> {
        loop {
            match &mut self.transport {
                Transport::Plain(socket) => return Ok(socket.read_buf(dst).await?),
                Transport::Tls(tls) => return Ok(tls.read_buf(dst).await?),
                Transport::Ws { socket, handshake_done, raw, parser, inbox } => {
                    if !inbox.is_empty() {
                        let n = inbox.len();
                        dst.put_slice(&inbox.split_to(n));
                        return Ok(n);
                    }
                    if self.remote_closed {
                        return Ok(0);
                    }

                    if socket.read_buf(raw).await? == 0 {
                        return Ok(0);
                    }

                    if !*handshake_done {
                        match ws::handle_handshake(raw)? {
                            HandshakeProgress::NeedMore => continue,
                            HandshakeProgress::Done { response, consumed } => {
                                raw.advance(consumed);
                                socket.write_all(&response).await?;
                                *handshake_done = true;
                                log::debug!("WebSocket handshake complete with {}", self.peer);
                            }
                        }
                    }

                    for event in parser.parse(raw)? {
                        match event {
                            FrameEvent::Data(payload) => inbox.put_slice(&payload),
                            FrameEvent::Pong(frame) => socket.write_all(&frame).await?,
                            FrameEvent::RemoteClosed => {
                                self.remote_closed = true;
                            }
                        }
                    }
                }
                Transport::RsaAes { socket, codec, raw, inbox } => {
                    if !inbox.is_empty() {
                        let n = inbox.len();
                        dst.put_slice(&inbox.split_to(n));
                        return Ok(n);
                    }
                    if socket.read_buf(raw).await? == 0 {
                        return Ok(0);
                    }
                    codec.open(raw, inbox)?;
                }
                Transport::Closed => return Err(VncError::ConnectionClosed),
            }
        }
    }

    /// Switches a plain stream to TLS, driving the server-side handshake.
    ///
    /// # Errors
    ///
    /// Only valid on a plain TCP/Unix stream; a failed handshake closes the
    /// stream.
    pub async fn upgrade_to_tls(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        let transport = std::mem::replace(&mut self.transport, Transport::Closed);
        let Transport::Plain(socket) = transport else {
            self.transport = transport;
            return Err(VncError::InvalidOperation(
                "TLS upgrade requires a plain stream".into(),
            ));
        };

        match acceptor.accept(socket).await {
            Ok(tls) => {
                self.transport = Transport::Tls(Box::new(tls));
                log::debug!("TLS established with {}", self.peer);
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(VncError::Tls(format!("handshake failed: {e}")))
            }
        }
    }

    /// Wraps a plain stream in authenticated RSA-AES records.
    ///
    /// # Errors
    ///
    /// Only valid on a plain TCP/Unix stream.
    pub fn upgrade_to_rsa_aes(
        &mut self,
        kind: AeadCipherType,
        enc_key: &[u8],
        dec_key: &[u8],
    ) -> Result<()> {
        let transport = std::mem::replace(&mut self.transport, Transport::Closed);
        let Transport::Plain(socket) = transport else {
            self.transport = transport;
            return Err(VncError::InvalidOperation(
                "RSA-AES upgrade requires a plain stream".into(),
            ));
        };

        let cipher = AeadCipher::new(kind, enc_key, dec_key)?;
        self.transport = Transport::RsaAes {
            socket,
            codec: RecordCodec::new(cipher),
            raw: BytesMut::with_capacity(4096),
            inbox: BytesMut::with_capacity(4096),
        };
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn payloads_flush_in_fifo_order() {
        let (server, mut client) = tcp_pair().await;
        let mut stream = Stream::from_tcp(server);

        let completions = Arc::new(AtomicUsize::new(0));
        for i in 0..3u8 {
            let counter = completions.clone();
            stream.send(
                Bytes::from(vec![i; 4]),
                Some(Box::new(move |result| {
                    assert_eq!(result, SendResult::Done);
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }
        stream.flush().await.unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 3);

        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[tokio::test]
    async fn deferred_payload_is_built_at_flush_time() {
        let (server, mut client) = tcp_pair().await;
        let mut stream = Stream::from_tcp(server);

        let value = Arc::new(AtomicUsize::new(1));
        let at_flush = value.clone();
        stream.exec_and_send(
            Box::new(move || Bytes::from(vec![at_flush.load(Ordering::SeqCst) as u8])),
            None,
        );
        value.store(42, Ordering::SeqCst);
        stream.flush().await.unwrap();

        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 42);
    }

    #[tokio::test]
    async fn close_fails_queued_requests() {
        let (server, _client) = tcp_pair().await;
        let mut stream = Stream::from_tcp(server);

        let failed = Arc::new(AtomicUsize::new(0));
        let counter = failed.clone();
        stream.send(
            Bytes::from_static(b"data"),
            Some(Box::new(move |result| {
                assert_eq!(result, SendResult::Failed);
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        stream.close();
        stream.close(); // idempotent
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn websocket_stream_handshakes_and_frames() {
        let (server, mut client) = tcp_pair().await;
        let mut stream = Stream::from_tcp_websocket(server);

        // Banner is queued before the handshake: must stay corked.
        stream.send(Bytes::from_static(b"RFB 003.008\n"), None);
        stream.flush().await.unwrap();

        client
            .write_all(
                b"GET /rfb HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
                  Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        // Client sends a masked binary frame with the version reply.
        let payload = b"RFB 003.008\n";
        let mask = [1u8, 2, 3, 4];
        let mut frame = vec![0x82, 0x80 | payload.len() as u8];
        frame.extend_from_slice(&mask);
        for (i, &b) in payload.iter().enumerate() {
            frame.push(b ^ mask[i % 4]);
        }
        client.write_all(&frame).await.unwrap();

        let mut inbound = BytesMut::new();
        let n = stream.read_buf(&mut inbound).await.unwrap();
        assert_eq!(&inbound[..n], payload);

        // Handshake done: the corked banner flushes as one binary frame.
        stream.flush().await.unwrap();

        let mut response = vec![0u8; 4096];
        let mut total = 0;
        // Read until the banner frame has arrived after the HTTP response.
        loop {
            let n = client.read(&mut response[total..]).await.unwrap();
            assert!(n > 0);
            total += n;
            if response[..total].windows(2).any(|w| w == [0x82, 12]) {
                break;
            }
        }
        let text = String::from_utf8_lossy(&response[..total]);
        assert!(text.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        let frame_at = response[..total]
            .windows(2)
            .position(|w| w == [0x82, 12])
            .unwrap();
        assert_eq!(&response[frame_at + 2..frame_at + 14], b"RFB 003.008\n");
    }

    #[tokio::test]
    async fn rsa_aes_upgrade_round_trips() {
        let (server, client) = tcp_pair().await;
        let mut server_stream = Stream::from_tcp(server);
        let mut client_stream = Stream::from_tcp(client);

        let server_key = [3u8; 16];
        let client_key = [4u8; 16];
        server_stream
            .upgrade_to_rsa_aes(AeadCipherType::Aes128Eax, &server_key, &client_key)
            .unwrap();
        // The test peer encrypts with the server's decryption key.
        client_stream
            .upgrade_to_rsa_aes(AeadCipherType::Aes128Eax, &client_key, &server_key)
            .unwrap();

        server_stream.send(Bytes::from_static(b"encrypted update"), None);
        server_stream.flush().await.unwrap();

        let mut buf = BytesMut::new();
        let n = client_stream.read_buf(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"encrypted update");
    }

    #[tokio::test]
    async fn read_zero_signals_remote_close() {
        let (server, client) = tcp_pair().await;
        let mut stream = Stream::from_tcp(server);
        drop(client);

        let mut buf = BytesMut::new();
        assert_eq!(stream.read_buf(&mut buf).await.unwrap(), 0);
    }
}
