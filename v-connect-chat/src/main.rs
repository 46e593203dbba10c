use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use v::HealthCheck;

use v_connect_chat::broker::{Broker, RedisBroker};
use v_connect_chat::config::{BrokerBackend, ChatConfig};
use v_connect_chat::service::{AuthCenterClient, Authenticator, DevAuthenticator};
use v_connect_chat::storage::{
    ConversationStore, MemoryConversationStore, MemoryMessageSink, MessageSink,
    PgConversationStore, PgMessageRepository,
};
use v_connect_chat::worker::PersistenceWorker;
use v_connect_chat::ChatServer;

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "v-connect-chat WebSocket chat server", long_about = None)]
pub struct Args {
    /// 指定配置文件路径（TOML/JSON/YAML自动识别）
    /// Specify config file path (auto-detect TOML/JSON/YAML)
    #[arg(short = 'c', long = "config", default_value = "config/default.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cm = v::init_global_config_with_file(&args.config)?;
    let cfg = ChatConfig::load(&cm)?;

    // 初始化日志 / Initialize logging
    v::init_tracing(&cfg.log_level)?;
    info!("🎯 Starting v-connect-chat (node={})...", cfg.server.node_id);
    info!("🔧 Loaded config file: {}", args.config);
    cm.log_sources();

    let broker = match cfg.broker.backend {
        BrokerBackend::Redis => {
            let redis = RedisBroker::connect(&cfg.broker.redis_url).await?;
            redis.ping().await?;
            info!("🔌 Connected to redis at {}", cfg.broker.redis_url);
            Broker::from_backend(Arc::new(redis), "redis")
        }
        BrokerBackend::Memory => {
            warn!("⚠️ Using in-process broker, state is lost on restart and not shared between nodes");
            Broker::memory().0
        }
    };

    let (conversations, sink): (Arc<dyn ConversationStore>, Arc<dyn MessageSink>) =
        match &cfg.database {
            Some(settings) => {
                let pool = v::connect_pg(settings)
                    .await
                    .map_err(|e| anyhow::anyhow!(v::describe_error(&e)))?;
                let status = pool.check_health().await;
                info!(healthy = status.healthy, "🗄️ {}: {:?}", status.component, status.message);
                (
                    Arc::new(PgConversationStore::new(pool.clone())),
                    Arc::new(PgMessageRepository::new(pool)),
                )
            }
            None => {
                warn!("⚠️ database.url not set, conversations and messages are kept in memory");
                let store = MemoryConversationStore::new();
                for seed in &cfg.seed_conversations {
                    store.insert_conversation(
                        &seed.id,
                        seed.kind,
                        seed.name.as_deref(),
                        &seed.members_with_roles(),
                    );
                }
                if cfg.seed_conversations.is_empty() {
                    warn!("⚠️ no [[memory.conversations]] configured, every message will be rejected");
                } else {
                    info!(count = cfg.seed_conversations.len(), "🌱 memory conversations seeded");
                }
                (Arc::new(store), Arc::new(MemoryMessageSink::new()))
            }
        };

    let authenticator: Arc<dyn Authenticator> = if cfg.auth.enabled {
        info!("🔐 Auth center enabled: {}", cfg.auth.center_url);
        Arc::new(AuthCenterClient::new(&cfg.auth)?)
    } else {
        warn!("🔓 Auth disabled, tokens are taken as user ids");
        Arc::new(DevAuthenticator)
    };

    let server = ChatServer::new(broker.clone(), conversations)
        .with_node_id(cfg.server.node_id.clone())
        .with_duplicate_policy(cfg.duplicate_policy)
        .with_authenticator(authenticator);

    let status = server.check_health().await;
    info!(healthy = status.healthy, "🩺 {}: {:?}", status.component, status.message);

    let shutdown = CancellationToken::new();
    let (stop_tx, stop_rx) = watch::channel(false);

    let worker_handle = if cfg.worker.enabled {
        let worker = Arc::new(PersistenceWorker::new(
            broker.intake.clone(),
            sink,
            cfg.worker.clone(),
        ));
        Some(tokio::spawn(worker.run(stop_rx)))
    } else {
        info!("⏸️ Persistence worker disabled on this node");
        None
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("❌ Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("🛑 Shutdown signal received");
            shutdown.cancel();
        });
    }

    info!("🚀 Starting WebSocket server on {}:{}", cfg.server.host, cfg.server.ws_port);
    if let Err(e) = server
        .serve(&cfg.server.host, cfg.server.ws_port, shutdown.clone())
        .await
    {
        error!("❌ WebSocket server error: {}", e);
        shutdown.cancel();
    }
    let _ = stop_tx.send(true);

    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            warn!("persistence worker task failed: {}", e);
        }
    }

    info!("✅ Server shutdown successfully");
    Ok(())
}
