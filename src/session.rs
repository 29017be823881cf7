//! One client's session: handshake, join, rate-limited chat loop, leave.
//!
//! The read half runs in its own task and the write half drains the
//! connection's outbound queue in another. Whichever finishes first ends the
//! session, after which teardown runs exactly once: deregister, leave
//! notice, roster, release the socket. Panics in either task surface as a
//! [`JoinError`] and go through the same teardown.

use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::SessionSettings;
use crate::protocol::{CHAT_SUBPROTOCOL, FrameKind, Payload};
use crate::rate_limiter::{RateLimitError, RateLimiter};

type WsStream = WebSocketStream<TcpStream>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error("no message within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("peer closed with status {code}: {reason:?}")]
    Closed { code: u16, reason: String },
    #[error("connection ended without a close frame")]
    Eof,
    #[error("outbound write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("server shutting down")]
    ShuttingDown,
    #[error("handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("session task failed: {0}")]
    Task(#[from] JoinError),
}

impl SessionError {
    fn closed(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(frame) => SessionError::Closed {
                code: frame.code.into(),
                reason: frame.reason.as_str().to_owned(),
            },
            None => SessionError::Closed {
                code: CloseCode::Status.into(),
                reason: String::new(),
            },
        }
    }

    /// Peer-initiated clean shutdown, which ends a session silently
    pub fn is_normal_closure(&self) -> bool {
        matches!(self, SessionError::Closed { code, .. } if *code == u16::from(CloseCode::Normal))
    }

    /// Whether the operator log should see this failure
    pub fn is_reportable(&self) -> bool {
        !self.is_normal_closure() && !matches!(self, SessionError::ShuttingDown)
    }
}

/// What the client asked for during the upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
struct Handshake {
    nickname: String,
    offered: Option<String>,
    speaks_chat: bool,
}

/// Handle a single WebSocket connection until it is fully torn down
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    broadcaster: Broadcaster,
    settings: SessionSettings,
    shutdown: watch::Receiver<bool>,
) {
    let (mut ws_stream, handshake) = match timeout(settings.handshake_timeout, accept(stream))
        .await
        .map_err(|_| SessionError::HandshakeTimeout(settings.handshake_timeout))
        .and_then(|accepted| accepted.map_err(SessionError::from))
    {
        Ok(accepted) => accepted,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    info!("New connection {} from {}", handshake.nickname, addr);

    if !handshake.speaks_chat {
        warn!(
            "Wrong subprotocol from {}: {}",
            addr,
            handshake.offered.as_deref().unwrap_or("<none>")
        );
        reject(&mut ws_stream, settings.write_timeout).await;
        return;
    }

    run(
        ws_stream,
        addr,
        handshake.nickname,
        broadcaster,
        settings,
        shutdown,
    )
    .await;
}

async fn accept(stream: TcpStream) -> Result<(WsStream, Handshake), tungstenite::Error> {
    let mut handshake = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let (negotiated, response) = negotiate(request, response);
            handshake = Some(negotiated);
            Ok(response)
        },
    )
    .await?;

    match handshake {
        Some(handshake) => Ok((ws_stream, handshake)),
        None => Err(tungstenite::Error::Protocol(
            ProtocolError::HandshakeIncomplete,
        )),
    }
}

/// Take the nickname from the percent-decoded path and select the chat
/// subprotocol if offered
fn negotiate(request: &Request, mut response: Response) -> (Handshake, Response) {
    let path = request.uri().path();
    let nickname = percent_decode_str(path.strip_prefix('/').unwrap_or(path))
        .decode_utf8_lossy()
        .into_owned();

    let offered: Vec<&str> = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let speaks_chat = offered
        .iter()
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == CHAT_SUBPROTOCOL);

    if speaks_chat {
        response.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(CHAT_SUBPROTOCOL),
        );
    }

    let handshake = Handshake {
        nickname,
        offered: (!offered.is_empty()).then(|| offered.join(", ")),
        speaks_chat,
    };
    (handshake, response)
}

/// Close with a policy violation and wait briefly for the peer to acknowledge
async fn reject(ws_stream: &mut WsStream, write_timeout: Duration) {
    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: "client must speak the chat subprotocol".into(),
    };
    if let Err(e) = ws_stream.close(Some(frame)).await {
        debug!("Failed to send policy close: {}", e);
        return;
    }
    let _ = timeout(write_timeout, async {
        while ws_stream.next().await.is_some() {}
    })
    .await;
}

async fn run(
    ws_stream: WsStream,
    addr: SocketAddr,
    nickname: String,
    broadcaster: Broadcaster,
    settings: SessionSettings,
    shutdown: watch::Receiver<bool>,
) {
    let (sink, stream) = ws_stream.split();
    let (tx, rx) = mpsc::channel(settings.outbound_queue);
    let mut writer = tokio::spawn(write_loop(sink, rx, settings.write_timeout));

    let id = broadcaster.registry().register(nickname.clone(), tx).await;
    announce(&broadcaster, &Payload::joined(&nickname)).await;

    let mut session = tokio::spawn(chat_loop(stream, broadcaster.clone(), settings, shutdown));
    let mut writer_done = false;
    let outcome = tokio::select! {
        joined = &mut session => flatten(joined),
        written = &mut writer => {
            writer_done = true;
            session.abort();
            flatten(written)
        }
    };

    if let Some(member) = broadcaster.registry().deregister(id).await {
        info!("Delete connection {}", member.nickname);
        if matches!(outcome, Err(SessionError::ShuttingDown)) {
            let goodbye = CloseFrame {
                code: CloseCode::Away,
                reason: "server shutting down".into(),
            };
            let _ = member.sender.try_send(Message::Close(Some(goodbye)));
        }
        drop(member);
        announce(&broadcaster, &Payload::left(&nickname)).await;
    }

    if !writer_done && timeout(settings.write_timeout, &mut writer).await.is_err() {
        writer.abort();
    }

    match outcome {
        Ok(()) => {}
        Err(SessionError::Task(e)) if e.is_panic() => {
            error!("Session for {} panicked: {}", addr, e);
        }
        Err(e) if e.is_reportable() => warn!("failed to chat with {}: {}", addr, e),
        Err(e) => debug!("Session for {} ended: {}", addr, e),
    }
}

/// Broadcast a membership notice followed by the roster
async fn announce(broadcaster: &Broadcaster, notice: &Payload) {
    if let Err(e) = broadcaster.broadcast(notice).await {
        warn!("Notice broadcast incomplete: {}", e);
    }
    if let Err(e) = broadcaster.broadcast_roster().await {
        warn!("Roster broadcast incomplete: {}", e);
    }
}

fn flatten(joined: Result<Result<(), SessionError>, JoinError>) -> Result<(), SessionError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(e.into()),
    }
}

async fn chat_loop(
    mut stream: SplitStream<WsStream>,
    broadcaster: Broadcaster,
    settings: SessionSettings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SessionError> {
    let limiter = RateLimiter::new(settings.message_quota);

    loop {
        let deadline = Instant::now() + settings.session_deadline;
        let (text, kind) = tokio::select! {
            body = next_chat_message(&mut stream, &limiter, deadline, settings.session_deadline) => body?,
            _ = stopped(&mut shutdown) => return Err(SessionError::ShuttingDown),
        };

        if let Err(e) = broadcaster.broadcast_as(&Payload::message(text), kind).await {
            warn!("Message broadcast incomplete: {}", e);
        }
    }
}

/// Take a token, then read frames until one carries a chat body
async fn next_chat_message(
    stream: &mut SplitStream<WsStream>,
    limiter: &RateLimiter,
    deadline: Instant,
    ceiling: Duration,
) -> Result<(String, FrameKind), SessionError> {
    limiter.acquire(deadline).await?;

    loop {
        let frame = match timeout_at(deadline, stream.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => return Err(SessionError::Eof),
            Err(_) => return Err(SessionError::DeadlineExceeded(ceiling)),
        };

        match frame {
            Message::Text(text) => return Ok((text.as_str().to_owned(), FrameKind::Text)),
            Message::Binary(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                return Ok((text, FrameKind::Binary));
            }
            Message::Close(frame) => return Err(SessionError::closed(frame)),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stopping = *shutdown.borrow_and_update();
        if stopping || shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Message>,
    write_timeout: Duration,
) -> Result<(), SessionError> {
    while let Some(frame) = outbound.recv().await {
        match timeout(write_timeout, sink.send(frame)).await {
            Ok(sent) => sent?,
            Err(_) => return Err(SessionError::WriteTimeout(write_timeout)),
        }
    }

    // Queue closed: the connection was deregistered
    let _ = timeout(write_timeout, sink.close()).await;
    Ok(())
}
