// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Multiplexed request/response router over the binary API socket
//!
//! One connection carries arbitrary interleaved operations, each identified
//! by a short client-generated tag. A dispatch task consumes the socket's
//! word stream, assembles sentences, and routes each reply to its pending
//! operation: requests accumulate rows until `!done`, streams deliver every
//! `!re` immediately through an unbounded channel so a slow consumer can
//! never stall dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::auth;
use crate::error::{Error, Result};
use crate::limits::RateLimiter;
use crate::protocol::{
    build_sentence_words, ReplyType, Row, Sentence, SentenceAssembler, TAG_PREFIX,
};
use crate::transport::{SocketEvent, SocketTransport};

/// Reply from one completed request: the accumulated `!re` rows plus the
/// attributes of the terminal `!done` sentence (`ret` during login).
pub struct CommandReply {
    pub rows: Vec<Row>,
    pub done: Row,
}

enum OpKind {
    Request {
        rows: Vec<Row>,
        done: oneshot::Sender<Result<CommandReply>>,
    },
    Stream {
        sink: mpsc::UnboundedSender<Result<Row>>,
    },
}

struct PendingOp {
    kind: OpKind,
    started: Instant,
}

/// A follow-mode stream may be started from a command plus parameters, or
/// from a preformed word list. The preformed form preserves the
/// query-vs-attribute distinction that key/value form erases.
pub enum StreamRequest {
    Command {
        command: String,
        params: Vec<(String, String)>,
    },
    Words(Vec<String>),
}

/// Tagged multiplexer over one socket transport.
pub struct Router {
    transport: Arc<SocketTransport>,
    pending: Arc<Mutex<HashMap<String, PendingOp>>>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    limiter: Option<Arc<RateLimiter>>,
}

impl Router {
    /// Take ownership of a connected transport and start dispatching its
    /// word stream. Round-trips of completed commands are fed to `limiter`.
    #[must_use]
    pub fn new(
        transport: SocketTransport,
        events: mpsc::UnboundedReceiver<SocketEvent>,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            transport: Arc::new(transport),
            pending: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(true)),
            closing: Arc::new(AtomicBool::new(false)),
            limiter,
        });
        let dispatcher = router.clone();
        tokio::spawn(async move {
            dispatcher.dispatch_loop(events).await;
        });
        router
    }

    /// Whether the underlying connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Submit one request and wait for its terminal reply.
    pub async fn submit(&self, command: &str, params: &[(String, String)]) -> Result<Vec<Row>> {
        Ok(self.submit_raw(command, params).await?.rows)
    }

    /// Submit one request, keeping the `!done` attributes visible.
    pub async fn submit_raw(
        &self,
        command: &str,
        params: &[(String, String)],
    ) -> Result<CommandReply> {
        if !self.is_connected() {
            return Err(Error::ConnectionLost);
        }
        let (done_tx, done_rx) = oneshot::channel();
        let tag = self
            .register(OpKind::Request {
                rows: Vec::new(),
                done: done_tx,
            })
            .await;

        let words = build_sentence_words(command, params, &tag);
        if let Err(e) = self.transport.write_sentence(&words).await {
            self.pending.lock().await.remove(&tag);
            return Err(e);
        }

        done_rx.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Open a follow-mode stream. Rows arrive on the returned handle until
    /// the stream terminates or is cancelled.
    pub async fn open_stream(self: &Arc<Self>, request: StreamRequest) -> Result<StreamHandle> {
        if !self.is_connected() {
            return Err(Error::ConnectionLost);
        }
        let (sink, rows) = mpsc::unbounded_channel();
        let tag = self.register(OpKind::Stream { sink }).await;

        let words = match request {
            StreamRequest::Command { command, params } => {
                build_sentence_words(&command, &params, &tag)
            }
            StreamRequest::Words(mut words) => {
                words.push(format!(".tag={tag}"));
                words
            }
        };
        if let Err(e) = self.transport.write_sentence(&words).await {
            self.pending.lock().await.remove(&tag);
            return Err(e);
        }

        Ok(StreamHandle {
            tag,
            rows,
            router: self.clone(),
            stopped: false,
        })
    }

    /// Cancel a running stream: `/cancel tag=<id>` as a new tagged request.
    ///
    /// Exempt from the rate limiter and circuit breaker by construction; the
    /// follow-up `!trap interrupted` on the stream's own tag is absorbed by
    /// dispatch.
    pub async fn cancel(&self, tag: &str) -> Result<()> {
        self.submit("/cancel", &[("tag".to_string(), tag.to_string())])
            .await?;
        Ok(())
    }

    /// Run the login sequence. Modern routers accept the password directly;
    /// pre-6.43 routers answer with a `ret` challenge that gets the MD5
    /// response in a second `/login`.
    ///
    /// Exempt from the rate limiter and circuit breaker by construction.
    pub async fn login(&self, username: &str, password: &SecretString) -> Result<()> {
        let reply = self
            .submit_raw(
                "/login",
                &[
                    ("name".to_string(), username.to_string()),
                    ("password".to_string(), password.expose_secret().to_string()),
                ],
            )
            .await
            .map_err(auth_error)?;

        if let Some(challenge) = reply.done.get("ret") {
            tracing::debug!("Router presented legacy login challenge");
            let response = auth::legacy_response(password.expose_secret(), challenge)?;
            self.submit_raw(
                "/login",
                &[
                    ("name".to_string(), username.to_string()),
                    ("response".to_string(), response),
                ],
            )
            .await
            .map_err(auth_error)?;
        }
        tracing::debug!("Login successful for user {}", username);
        Ok(())
    }

    /// Half-close the connection. Pending operations are dropped without
    /// resolution; callers observe the close through their channels.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        let _ = self.transport.close().await;
    }

    /// Tear the connection down immediately.
    pub async fn destroy(&self) {
        self.closing.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        self.transport.destroy().await;
        self.pending.lock().await.clear();
    }

    async fn register(&self, kind: OpKind) -> String {
        let mut pending = self.pending.lock().await;
        let tag = loop {
            let candidate = random_tag();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(
            tag.clone(),
            PendingOp {
                kind,
                started: Instant::now(),
            },
        );
        tag
    }

    async fn dispatch_loop(&self, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
        let mut assembler = SentenceAssembler::new();
        loop {
            let Some(event) = events.recv().await else {
                self.on_disconnect().await;
                return;
            };
            match event {
                SocketEvent::Word(word) => {
                    if let Some(sentence) = assembler.push_word(&word) {
                        self.route_sentence(sentence).await;
                    }
                }
                SocketEvent::Closed => {
                    self.on_disconnect().await;
                    return;
                }
                SocketEvent::Error(e) => {
                    tracing::debug!("Socket failed: {}", e);
                    self.on_disconnect().await;
                    return;
                }
            }
        }
    }

    async fn route_sentence(&self, sentence: Sentence) {
        if sentence.reply == Some(ReplyType::Fatal) {
            tracing::error!(
                "Fatal reply from router: {}",
                sentence.message().unwrap_or("unknown")
            );
            self.on_disconnect().await;
            return;
        }

        let Some(tag) = sentence.tag.clone() else {
            tracing::trace!("Dropping untagged reply {:?}", sentence.reply);
            return;
        };

        let mut pending = self.pending.lock().await;
        match sentence.reply {
            Some(ReplyType::Data) => match pending.get_mut(&tag) {
                Some(op) => match &mut op.kind {
                    OpKind::Request { rows, .. } => rows.push(sentence.attributes),
                    OpKind::Stream { sink } => {
                        let _ = sink.send(Ok(sentence.attributes));
                    }
                },
                None => tracing::trace!("Dropping row for unknown tag {}", tag),
            },
            Some(ReplyType::Done) => {
                let Some(op) = pending.remove(&tag) else {
                    tracing::trace!("Dropping done for unknown tag {}", tag);
                    return;
                };
                drop(pending);
                self.feedback(op.started).await;
                match op.kind {
                    OpKind::Request { rows, done } => {
                        let _ = done.send(Ok(CommandReply {
                            rows,
                            done: sentence.attributes,
                        }));
                    }
                    // Stream ended by the router; dropping the sink closes
                    // the consumer side
                    OpKind::Stream { .. } => {}
                }
            }
            Some(ReplyType::Trap) => {
                let Some(op) = pending.remove(&tag) else {
                    tracing::trace!("Dropping trap for unknown tag {}", tag);
                    return;
                };
                drop(pending);
                self.feedback(op.started).await;
                let message = sentence.message().unwrap_or("trap").to_string();
                if message.contains("interrupted") {
                    // Normal reply to a stream cancel
                    tracing::trace!("Stream {} interrupted", tag);
                    return;
                }
                match op.kind {
                    OpKind::Request { done, .. } => {
                        let _ = done.send(Err(Error::trap(message)));
                    }
                    OpKind::Stream { sink } => {
                        let _ = sink.send(Err(Error::trap(message)));
                    }
                }
            }
            Some(ReplyType::Fatal) => unreachable!("handled above"),
            None => tracing::trace!("Dropping reply without type for tag {}", tag),
        }
    }

    async fn feedback(&self, started: Instant) {
        if let Some(limiter) = &self.limiter {
            limiter.submit_feedback(started.elapsed()).await;
        }
    }

    /// Unexpected close fails every pending operation with `ConnectionLost`;
    /// an application-initiated close drops them silently.
    async fn on_disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        let mut pending = self.pending.lock().await;
        let explicit = self.closing.load(Ordering::Acquire);
        if !pending.is_empty() && !explicit {
            tracing::warn!(
                "Connection lost with {} operation(s) pending",
                pending.len()
            );
        }
        for (_, op) in pending.drain() {
            if explicit {
                continue;
            }
            match op.kind {
                OpKind::Request { done, .. } => {
                    let _ = done.send(Err(Error::ConnectionLost));
                }
                OpKind::Stream { sink } => {
                    let _ = sink.send(Err(Error::ConnectionLost));
                }
            }
        }
    }
}

fn auth_error(e: Error) -> Error {
    match e {
        Error::Router { detail, .. } => Error::Auth(detail),
        other => other,
    }
}

/// Allocate a tag: `t` followed by six base-36 characters.
fn random_tag() -> String {
    const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let mut tag = String::with_capacity(7);
    tag.push_str(TAG_PREFIX);
    for _ in 0..6 {
        tag.push(BASE36[rng.gen_range(0..BASE36.len())] as char);
    }
    tag
}

/// Consumer side of one follow-mode stream.
pub struct StreamHandle {
    tag: String,
    rows: mpsc::UnboundedReceiver<Result<Row>>,
    router: Arc<Router>,
    stopped: bool,
}

impl StreamHandle {
    /// Next row, or `None` once the stream has terminated.
    pub async fn recv(&mut self) -> Option<Result<Row>> {
        self.rows.recv().await
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Cancel the stream. Idempotent; a dead connection makes this a no-op.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if self.router.is_connected() {
            if let Err(e) = self.router.cancel(&self.tag).await {
                tracing::debug!("Stream cancel for {} failed: {}", self.tag, e);
            }
        }
    }
}
