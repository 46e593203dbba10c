use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::server::ChatServer;

/// 关闭时等待会话收尾的上限 / Upper bound on waiting for session teardown at shutdown
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 启动WS监听 / Start WS listener
impl ChatServer {
    pub async fn serve(&self, host: &str, port: u16, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr).await?;
        self.run(listener, shutdown).await
    }

    /// 接收循环；关闭信号触发后取消所有会话 / Accept loop, cancels every session on shutdown
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("🚀 v-connect-chat WebSocket Server starting on {}", listener.local_addr()?);
        info!("📡 Waiting for connections...");

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                // 回收已结束的会话任务 / reap finished session tasks
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let server = self.clone();
                        let shutdown = shutdown.clone();
                        sessions.spawn(async move {
                            if let Err(e) = crate::ws::handle_connection(stream, peer_addr, server, shutdown).await {
                                error!("Connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("⚠️ accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        self.registry.close_all("server shutting down");
        // 会话收尾会清理注册表与在线集合，必须等它们跑完
        // Session teardown clears the registry and the online set, wait for it
        let live = sessions.len();
        let drained = tokio::time::timeout(SESSION_DRAIN_TIMEOUT, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = sessions.len(), "⚠️ sessions still running after drain timeout, aborting");
            sessions.shutdown().await;
        }
        info!(sessions = live, "🛑 WebSocket server stopped");
        Ok(())
    }
}
