use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{user_channel, Subscription};
use crate::error::{ErrorClass, RegistryError};
use crate::registry::ConnectionHandle;
use crate::server::ChatServer;
use crate::service::auth::extract_token;
use crate::ws::frames::{reject, send_error, send_json};

/// 会话结束后等待写任务发完剩余帧的上限 / How long teardown waits for the writer to flush
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// 处理新连接 / Handle new connection
///
/// 顺序：鉴权 -> 订阅自身频道 -> 注册 -> 上线快照 -> 补发离线消息 -> 转发循环 -> 读循环
/// Order: authenticate, subscribe, register, presence snapshot, drain pending,
/// then the forward loop and the read loop
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    server: ChatServer,
    shutdown: CancellationToken,
) -> Result<()> {
    debug!("📨 New connection from: {}", peer_addr);

    let mut token: Option<String> = None;
    let ws_stream = accept_hdr_async(stream, |req: &Request, resp: Response| {
        let cookie = req
            .headers()
            .get("cookie")
            .and_then(|v| v.to_str().ok());
        token = extract_token(req.uri().query(), cookie);
        Ok(resp)
    })
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session_id = Uuid::new_v4().to_string();

    // 唯一写者：两个循环的帧按入队顺序写出 / Single writer, frames leave in enqueue order
    let writer_session = session_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(&msg, Message::Close(_));
            if let Err(e) = ws_sender.send(msg).await {
                debug!(session_id = %writer_session, "writer stopped: {}", e);
                break;
            }
            if is_close {
                let _ = ws_sender.close().await;
                break;
            }
        }
    });

    let user = match server
        .authenticator
        .validate(token.as_deref().unwrap_or_default())
        .await
    {
        Ok(user) => user,
        Err(e) => {
            warn!("🔐 rejected connection from {}: {}", peer_addr, e);
            reject(&tx, CloseCode::Policy, e.client_message());
            drop(tx);
            finish_writer(&mut send_task).await;
            return Ok(());
        }
    };
    let user_id = user.user_id.clone();
    let username = user.username.as_deref();

    let subscription = match server.broker.pubsub.subscribe(&user_channel(&user_id)).await {
        Ok(subscription) => subscription,
        Err(e) => {
            error!(user_id = %user_id, "❌ failed to subscribe user channel: {}", e);
            reject(&tx, CloseCode::Again, "Service unavailable");
            drop(tx);
            finish_writer(&mut send_task).await;
            return Ok(());
        }
    };

    let cancel = shutdown.child_token();
    let handle = ConnectionHandle::new(session_id.clone(), Some(peer_addr), tx.clone(), cancel.clone());
    match server.registry.add(&user_id, handle) {
        Ok(Some(evicted)) => {
            info!(user_id = %user_id, evicted = %evicted.session_id, "🔁 previous session replaced");
            evicted.close("replaced by a new session");
        }
        Ok(None) => {}
        Err(RegistryError::AlreadyConnected { .. }) => {
            warn!(user_id = %user_id, "🚫 duplicate connection rejected");
            reject(&tx, CloseCode::Policy, "already connected");
            drop(tx);
            finish_writer(&mut send_task).await;
            return Ok(());
        }
    }

    let snapshot = server.presence.announce_online(&user_id, username).await;
    send_json(&tx, &snapshot);

    match server.broker.pending.drain_all(&user_id).await {
        Ok(queued) => {
            if !queued.is_empty() {
                info!(user_id = %user_id, count = queued.len(), "📬 delivering pending messages");
            }
            for payload in queued {
                let _ = tx.send(Message::Text(payload));
            }
        }
        Err(e) => warn!(user_id = %user_id, "⚠️ failed to drain pending queue: {}", e),
    }

    let forward = tokio::spawn(forward_loop(subscription, tx.clone(), cancel.clone()));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = server.chat.handle_frame(&user_id, &text).await {
                        match e.class() {
                            ErrorClass::Protocol => debug!(user_id = %user_id, "frame rejected: {}", e),
                            ErrorClass::Authorization | ErrorClass::Lookup => {
                                warn!(user_id = %user_id, "⚠️ frame rejected: {}", e)
                            }
                            ErrorClass::Internal => error!(user_id = %user_id, "❌ frame failed: {}", e),
                        }
                        send_error(&tx, e.client_message());
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    send_error(&tx, "Invalid message format");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(user_id = %user_id, "WebSocket error: {}", e);
                    break;
                }
            }
        }
    }

    // 先取消再清理，确保注册表与在线状态最后清除 / Cancel first, registry and presence are cleared last
    cancel.cancel();
    if let Err(e) = forward.await {
        warn!(user_id = %user_id, "forward loop ended abnormally: {}", e);
    }
    if server.registry.remove_session(&user_id, &session_id) {
        server.presence.announce_offline(&user_id, username).await;
    }
    drop(tx);
    finish_writer(&mut send_task).await;
    info!(user_id = %user_id, session_id = %session_id, "👋 Client disconnected");
    Ok(())
}

/// 频道消息转发到客户端 / Forward channel payloads to the client
async fn forward_loop(
    mut subscription: Subscription,
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            payload = subscription.next() => match payload {
                Some(payload) => {
                    if tx.send(Message::Text(payload)).is_err() {
                        break;
                    }
                }
                None => {
                    warn!("⚠️ user channel subscription ended, closing session");
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

async fn finish_writer(send_task: &mut tokio::task::JoinHandle<()>) {
    if tokio::time::timeout(WRITER_DRAIN, &mut *send_task).await.is_err() {
        send_task.abort();
    }
}
