use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use message_push::api::{self, ApiState};
use message_push::config::AppConfig;
use message_push::logging;
use message_push::registry::ConnectionRegistry;
use message_push::service::delivery::DeliveryEngine;
use message_push::service::identify::{HttpIdentityService, IdentityService};
use message_push::service::message::MessageService;
use message_push::storage;
use message_push::ws::server::{run_listener, ListenerKind};
use message_push::ws::WsContext;

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "message-push WebSocket & HTTP Server", long_about = None)]
struct Args {
    /// 指定配置文件路径 / Config file path
    #[arg(short = 'c', long = "config", default_value = "config/default.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = AppConfig::load(&args.config)?;
    logging::init_tracing(&cfg.logging.level)?;

    info!("🎯 Starting message-push server (WebSocket + HTTP)...");
    info!("🔧 Loaded config file: {}", args.config);

    // 存储不可达属致命启动错误 / unreachable storage is fatal at startup
    let store = storage::build(&cfg.storage).await?;
    info!("💾 Storage backend: {}", cfg.storage.backend);

    // 显式装配，无全局单例 / explicit wiring, no ambient singletons
    let service = Arc::new(MessageService::new(store, &cfg.delivery));
    let registry = Arc::new(ConnectionRegistry::new());
    let identity: Arc<dyn IdentityService> = Arc::new(HttpIdentityService::new(&cfg.identify)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = DeliveryEngine::start(
        service.clone(),
        registry.clone(),
        &cfg.delivery,
        shutdown_rx.clone(),
    );

    let ctx = Arc::new(WsContext {
        registry: registry.clone(),
        service: service.clone(),
        engine: engine.clone(),
        connection: cfg.connection.clone(),
    });

    let public_listener = run_listener(
        ListenerKind::Public,
        cfg.server.public_addr.clone(),
        identity.clone(),
        ctx.clone(),
        shutdown_rx.clone(),
    );
    let private_listener = run_listener(
        ListenerKind::Private,
        cfg.server.private_addr.clone(),
        identity.clone(),
        ctx.clone(),
        shutdown_rx.clone(),
    );

    let api_state = web::Data::new(ApiState {
        service: service.clone(),
        engine: engine.clone(),
        registry: registry.clone(),
    });
    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(api_state.clone())
            .configure(api::configure)
    })
    .bind(&cfg.server.http_addr)?
    .run();
    info!("🌐 HTTP API on {}", cfg.server.http_addr);

    // 任一服务退出或收到Ctrl-C即进入停机 / first exit or Ctrl-C starts the shutdown
    tokio::select! {
        res = public_listener => {
            if let Err(e) = res {
                error!("❌ public WebSocket listener error: {}", e);
            }
        }
        res = private_listener => {
            if let Err(e) = res {
                error!("❌ private WebSocket listener error: {}", e);
            }
        }
        res = http_server => {
            if let Err(e) = res {
                error!("❌ HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    // 通知工作协程退出并关闭全部连接 / stop the workers and close every actor
    shutdown_tx.send_replace(true);
    registry.close_all();
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("✅ Server shutdown successfully");
    Ok(())
}
