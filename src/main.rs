use actix_web::{middleware::Logger, web, App, HttpServer};
use dotenv::dotenv;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aiface_relay::config::{self, AppSettings};
use aiface_relay::db::{create_pool, verify_connection, TerminalRecordRepository};
use aiface_relay::routes::{configure_admin_routes, configure_terminal_routes};
use aiface_relay::security::AdminCredential;
use aiface_relay::services::{
    ChannelKeys, DisabledLogSink, DispatchBridge, LogSink, RelayQueue, SessionRegistry, SessionServices,
    TraceLogger,
};

async fn build_queue(settings: &AppSettings) -> RelayQueue {
    let keys = ChannelKeys::from_config(&settings.relay);

    match &settings.relay.redis_url {
        Some(url) => match RelayQueue::new_redis(url, keys, settings.dispatch.poll_interval).await {
            Ok(queue) => queue,
            Err(e) => {
                error!("Failed to connect to Redis for the relay queue: {}", e);
                error!("Cannot start server without a working relay queue");
                std::process::exit(1);
            }
        },
        None => {
            warn!("REDIS_URL not set, relay queue is in-process and will not survive restarts");
            RelayQueue::new_memory(keys)
        }
    }
}

async fn build_log_sink(settings: &AppSettings) -> Arc<dyn LogSink> {
    if !settings.log_sink.enabled {
        info!("Log sink disabled, terminal records will not be persisted");
        return Arc::new(DisabledLogSink);
    }

    // Presence is checked when settings are loaded
    let database_url = settings.log_sink.database_url.as_deref().unwrap_or_default();

    let pool = match create_pool(database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to create database connection pool: {}", e);
            error!("Cannot start server without a working log sink database");
            std::process::exit(1);
        }
    };
    if let Err(e) = verify_connection(&pool).await {
        error!("Database connection verification failed: {}", e);
        std::process::exit(1);
    }

    info!("Log sink writing to table {}", settings.log_sink.table);
    Arc::new(TerminalRecordRepository::new(pool, settings.log_sink.table.clone()))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Initialize logging; log records from actix are forwarded here too
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load application settings
    let app_settings = match config::init_config() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load application settings: {}", e);
            error!("Cannot start server without valid settings");
            std::process::exit(1);
        }
    };

    let queue = build_queue(&app_settings).await;
    let log_sink = build_log_sink(&app_settings).await;
    let registry = SessionRegistry::new();
    let trace = Arc::new(TraceLogger::new(&app_settings.trace));
    let bridge = DispatchBridge::new(queue.clone(), &app_settings.dispatch);

    if !app_settings.relay.enabled {
        warn!("Relay disabled, sessions will neither forward replies nor deliver queued commands");
    }

    let session_services = web::Data::new(SessionServices {
        queue: queue.clone(),
        log_sink,
        trace,
        registry: registry.clone(),
        config: app_settings.session.clone(),
        relay_enabled: app_settings.relay.enabled,
    });

    let terminal_addr = format!("{}:{}", app_settings.terminal.host, app_settings.terminal.port);
    let admin_addr = format!(
        "{}:{}",
        app_settings.admin.listener.host, app_settings.admin.listener.port
    );
    info!(
        relay_backend = queue.backend_name(),
        "Starting terminal listener at ws://{} and admin listener at http://{}",
        terminal_addr,
        admin_addr
    );

    let terminal_server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(session_services.clone())
            .configure(configure_terminal_routes)
    })
    .listen(TcpListener::bind(&terminal_addr)?)?
    .run();

    let credential = web::Data::new(AdminCredential::new(app_settings.admin.authorization_key.clone()));
    let bridge = web::Data::new(bridge);
    let registry = web::Data::new(registry);
    let queue = web::Data::new(queue);

    let admin_server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(credential.clone())
            .app_data(bridge.clone())
            .app_data(registry.clone())
            .app_data(queue.clone())
            .configure(configure_admin_routes)
    })
    .listen(TcpListener::bind(&admin_addr)?)?
    .run();

    // Either listener stopping ends the process
    tokio::select! {
        result = terminal_server => result,
        result = admin_server => result,
    }
}
