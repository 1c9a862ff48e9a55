// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Binary API socket transport
//!
//! Maintains one duplex byte stream (plain TCP or TLS). A dedicated reader
//! task accumulates inbound bytes, decodes words with the frame codec, and
//! forwards them as events. Writes are serialized at sentence granularity:
//! interleaving two sentences' bytes corrupts framing irrecoverably.

use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::{encode_word, FrameDecoder};

use super::tls::{build_connector, server_name, TlsOptions};

/// TCP keep-alive probe interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Default connect handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Signals raised by the reader task.
#[derive(Debug)]
pub enum SocketEvent {
    /// One decoded word (possibly the empty sentence terminator).
    Word(String),
    /// Peer closed the stream.
    Closed,
    /// I/O or framing failure; the stream is unusable afterwards.
    Error(Error),
}

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub host: String,
    pub port: u16,
    pub tls: TlsOptions,
    pub connect_timeout: Duration,
}

impl SocketConfig {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: TlsOptions::Disabled,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// One duplex connection with a background reader.
pub struct SocketTransport {
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    cancel: CancellationToken,
}

impl SocketTransport {
    /// Connect, apply TCP options, and spawn the reader task.
    ///
    /// Returns the transport and the event stream its reader feeds.
    pub async fn connect(
        config: &SocketConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SocketEvent>)> {
        let addr = format!("{}:{}", config.host, config.port);
        tracing::debug!("Connecting to {}", addr);
        let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("connect to {addr}"),
                elapsed: config.connect_timeout,
            })??;

        stream.set_nodelay(true)?;
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_INTERVAL)
            .with_interval(KEEPALIVE_INTERVAL);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

        if config.tls.is_enabled() {
            let connector = build_connector(&config.tls)?;
            let name = server_name(&config.host)?;
            let tls_stream = timeout(config.connect_timeout, connector.connect(name, stream))
                .await
                .map_err(|_| Error::Timeout {
                    operation: format!("TLS handshake with {addr}"),
                    elapsed: config.connect_timeout,
                })?
                .map_err(|e| Error::Tls(format!("handshake failed: {e}")))?;
            tracing::debug!("TLS established with {}", addr);
            Ok(Self::from_stream(tls_stream))
        } else {
            Ok(Self::from_stream(stream))
        }
    }

    /// Wrap an already-established duplex stream.
    ///
    /// Used by `connect` and by tests running over in-memory pipes.
    pub fn from_stream<S>(stream: S) -> (Self, mpsc::UnboundedReceiver<SocketEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            read_loop(read_half, event_tx, reader_cancel).await;
        });

        (
            Self {
                writer: Arc::new(Mutex::new(Box::new(write_half))),
                cancel,
            },
            event_rx,
        )
    }

    /// Write one sentence's words plus the empty terminator as a single
    /// atomic write.
    pub async fn write_sentence(&self, words: &[String]) -> Result<()> {
        let mut frame = Vec::with_capacity(words.iter().map(|w| w.len() + 2).sum::<usize>() + 1);
        for word in words {
            frame.extend_from_slice(&encode_word(word));
        }
        frame.push(0);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Half-close: flush and shut down the write side. The reader keeps
    /// draining until the peer closes.
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    /// Immediate teardown of both directions.
    pub async fn destroy(&self) {
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop<R>(
    mut reader: tokio::io::ReadHalf<R>,
    events: mpsc::UnboundedSender<SocketEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead,
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = tokio::select! {
            read = reader.read(&mut chunk) => read,
            () = cancel.cancelled() => {
                tracing::trace!("Socket reader cancelled");
                return;
            }
        };
        match read {
            Ok(0) => {
                tracing::debug!("Socket closed by peer");
                let _ = events.send(SocketEvent::Closed);
                return;
            }
            Ok(n) => {
                decoder.push(&chunk[..n]);
                loop {
                    match decoder.next_word() {
                        Ok(Some(word)) => {
                            if events.send(SocketEvent::Word(word)).is_err() {
                                // Receiver gone; nothing left to feed
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!("Framing error: {}", e);
                            let _ = events.send(SocketEvent::Error(e));
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!("Socket read error: {}", e);
                let _ = events.send(SocketEvent::Error(e.into()));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_words(rx: &mut mpsc::UnboundedReceiver<SocketEvent>, n: usize) -> Vec<String> {
        let mut words = Vec::new();
        while words.len() < n {
            match rx.recv().await.expect("event stream ended") {
                SocketEvent::Word(w) => words.push(w),
                other => panic!("unexpected event {other:?}"),
            }
        }
        words
    }

    #[tokio::test]
    async fn test_words_decoded_from_peer() {
        let (local, mut remote) = tokio::io::duplex(256);
        let (_transport, mut events) = SocketTransport::from_stream(local);

        let mut bytes = Vec::new();
        for word in ["!done", ".tag=t1", ""] {
            bytes.extend_from_slice(&encode_word(word));
        }
        remote.write_all(&bytes).await.unwrap();

        let words = next_words(&mut events, 3).await;
        assert_eq!(words, vec!["!done", ".tag=t1", ""]);
    }

    #[tokio::test]
    async fn test_write_sentence_is_terminated() {
        let (local, mut remote) = tokio::io::duplex(256);
        let (transport, _events) = SocketTransport::from_stream(local);

        transport
            .write_sentence(&["/login".to_string(), "=name=admin".to_string()])
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = remote.read(&mut buf).await.unwrap();
        let expected = {
            let mut v = encode_word("/login");
            v.extend_from_slice(&encode_word("=name=admin"));
            v.push(0);
            v
        };
        assert_eq!(&buf[..n], &expected[..]);
    }

    #[tokio::test]
    async fn test_peer_close_emits_closed() {
        let (local, remote) = tokio::io::duplex(256);
        let (_transport, mut events) = SocketTransport::from_stream(local);
        drop(remote);

        match events.recv().await.unwrap() {
            SocketEvent::Closed => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_framing_emits_error() {
        let (local, mut remote) = tokio::io::duplex(256);
        let (_transport, mut events) = SocketTransport::from_stream(local);
        remote.write_all(&[0xFF]).await.unwrap();

        match events.recv().await.unwrap() {
            SocketEvent::Error(Error::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }
}
