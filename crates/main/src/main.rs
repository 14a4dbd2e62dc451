//! 主应用程序入口
//!
//! 加载配置、组装广播引擎并启动 Axum Web 服务。

use std::sync::Arc;

use anyhow::Context;
use application::{
    BroadcastEngine, BroadcastEngineDependencies, ContentPolicy, EngineSettings, SystemClock,
};
use config::AppConfig;
use infrastructure::{build_store, JwtIdentityProvider};
use tracing_subscriber::EnvFilter;
use web_api::{cors_layer, router, AppState};

const DEFAULT_LOG_FILTER: &str = "info,roomchat=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    tracing::info!(config = %config.sanitize(), "配置已加载");

    let store = build_store(config.database.as_ref())
        .await
        .context("初始化持久化存储失败")?;
    let identity_provider = Arc::new(JwtIdentityProvider::new(&config.jwt));
    let policy = ContentPolicy::new(
        config.chat.banned_words.iter(),
        config.chat.max_message_length.max_chars(),
    )?;

    let engine = BroadcastEngine::new(BroadcastEngineDependencies {
        store,
        identity_provider: identity_provider.clone(),
        policy,
        clock: Arc::new(SystemClock),
        settings: EngineSettings::from_config(&config.chat)?,
    });
    engine.spawn_typing_sweeper();

    let app = router(AppState::new(engine.clone(), identity_provider))
        .layer(cors_layer(&config.server.cors_origins));
    let address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("无法监听 {address}"))?;

    tracing::info!(address = %address, "聊天室服务器已启动");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown();
    tracing::info!("聊天室服务器已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "无法监听退出信号");
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号，开始优雅关闭");
}
