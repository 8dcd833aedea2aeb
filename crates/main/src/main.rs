//! 主应用程序入口
//!
//! 启动 Axum Web API 服务与后台过期消息清扫任务。

use std::sync::Arc;
use std::time::Duration;

use application::{
    ConnectionRegistry, ConversationService, DeliveryReadTracker, EventGateway,
    MessageLifecycleDependencies, MessageLifecycleEngine, PresenceBroadcaster,
    RoomMembershipController, RoomMembershipDependencies, SystemClock,
};
use config::AppConfig;
use infrastructure::{create_pg_pool, PgConversationRepository, PgMessageRepository};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env();

    tracing::info!(
        "连接数据库: {}",
        config.database.url.split('@').last().unwrap_or("unknown")
    );
    let pg_pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;

    // 运行迁移
    sqlx::migrate!("../../migrations").run(&pg_pool).await?;

    // 持久化适配器
    let conversations: Arc<dyn application::ConversationRepository> =
        Arc::new(PgConversationRepository::new(pg_pool.clone()));
    let messages: Arc<dyn application::MessageRepository> =
        Arc::new(PgMessageRepository::new(pg_pool));

    let clock: Arc<dyn application::Clock> = Arc::new(SystemClock);
    let registry = Arc::new(ConnectionRegistry::new());
    let gateway = EventGateway::new(registry.clone());

    // 应用层用例服务
    let membership = Arc::new(RoomMembershipController::new(RoomMembershipDependencies {
        registry: registry.clone(),
        gateway: gateway.clone(),
        conversations: conversations.clone(),
        clock: clock.clone(),
        disconnect_fanout_limit: config.websocket.disconnect_fanout_limit,
    }));
    let presence = Arc::new(PresenceBroadcaster::new(registry.clone()));
    let lifecycle = Arc::new(MessageLifecycleEngine::new(MessageLifecycleDependencies {
        conversations: conversations.clone(),
        messages: messages.clone(),
        clock: clock.clone(),
    }));
    let receipts = Arc::new(DeliveryReadTracker::new(
        conversations.clone(),
        messages,
        clock.clone(),
    ));
    let conversation_service = Arc::new(ConversationService::new(conversations, clock));

    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));

    // 后台任务：周期性把到期消息转换为墓碑
    let sweep_interval = Duration::from_secs(config.sweep.interval_secs.max(1));
    tokio::spawn({
        let lifecycle = lifecycle.clone();
        async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                if let Err(error) = lifecycle.sweep_expired().await {
                    tracing::warn!(error = %error, "expired message sweep failed");
                }
            }
        }
    });

    let state = AppState {
        registry,
        gateway,
        membership,
        presence,
        lifecycle,
        receipts,
        conversations: conversation_service,
        jwt_service,
        websocket: config.websocket.clone(),
    };

    // 启动 Web 服务器
    let app = router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("聊天服务器启动在 http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
