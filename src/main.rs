use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mantle::alarm_engine::AlarmEngine;
use mantle::cli::Cli;
use mantle::delete_cascade::DeleteCascade;
use mantle::engine::Engine;
use mantle::hidden::HiddenStore;
use mantle::hot_cache::{CacheDrain, HotCache};
use mantle::properties::PropertyStore;
use mantle::pubsub::PubSub;
use mantle::sparkplug::ingress::{run_ingress, subscribe_sparkplug_topics};
use mantle::storage::Storage;
use mantle::topology::Topology;
use mantle::{handlers, migrations, validators};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("mantle={},tower_http=info", cli.log_level))),
        )
        .init();

    validators::validate_host(&cli.db_host)?;
    validators::validate_port(cli.db_port)?;
    if let Some(ca) = &cli.db_ssl_ca {
        validators::validate_ssl_ca(ca)?;
    }

    ensure_database_exists(&cli).await?;

    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&cli.db_url())
        .await?;

    migrations::run_migrations(&pool).await?;
    if cli.migrate {
        info!("migrations applied, exiting (--migrate)");
        return Ok(());
    }

    let pubsub = Arc::new(PubSub::new());
    let topology = Arc::new(Topology::new());
    let storage = Arc::new(Storage::new(pool.clone()));
    let properties = Arc::new(PropertyStore::new(pool.clone()));
    let hidden = Arc::new(HiddenStore::new(pool.clone()));

    let hot_cache = match &cli.redis_url {
        Some(url) => {
            let drain = Arc::new(CacheDrain::new());
            drain.clone().spawn_drain_loop(pubsub.clone());
            HotCache::connect(url, 5, drain).await.map(Arc::new)
        }
        None => None,
    };

    let alarms = AlarmEngine::load(
        pool.clone(),
        pubsub.clone(),
        cli.webhook_url.clone(),
        cli.webhook_secret.clone(),
        cli.space_short_id.clone(),
    )
    .await?;

    let (broker_host, broker_port) = parse_broker_host_port(&cli.broker_url);
    let mut mqtt_options = rumqttc::MqttOptions::new(&cli.client_id, broker_host, broker_port);
    if let (Some(user), Some(pass)) = (&cli.username, &cli.password) {
        mqtt_options.set_credentials(user, pass);
    }
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    let (mqtt_client, eventloop) = rumqttc::AsyncClient::new(mqtt_options, 100);
    subscribe_sparkplug_topics(&mqtt_client, cli.shared_group.as_deref()).await?;

    let delete_cascade = Arc::new(DeleteCascade {
        topology: topology.clone(),
        storage: storage.clone(),
        hot_cache: hot_cache.clone(),
    });

    let engine = Arc::new(Engine {
        topology,
        storage,
        properties,
        hidden,
        hot_cache,
        pubsub,
        alarms,
        delete_cascade,
        mqtt: mqtt_client,
        historian_enabled: cli.historian_enabled,
        pool,
    });

    tokio::spawn(run_ingress(engine.clone(), eventloop));

    let app = handlers::mantle::router(engine)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = cli.listen_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "mantle listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Connects to the admin database and creates `cli.db_name` if it doesn't
/// exist yet. Postgres has no `CREATE DATABASE IF NOT EXISTS`, so existence
/// is checked against `pg_database` first.
async fn ensure_database_exists(cli: &Cli) -> anyhow::Result<()> {
    if cli.db_name.contains('"') {
        anyhow::bail!("invalid database name: {}", cli.db_name);
    }
    let admin_pool = PgPoolOptions::new().max_connections(1).connect(&cli.admin_db_url()).await?;
    let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&cli.db_name)
        .fetch_one(&admin_pool)
        .await?;
    if !exists {
        sqlx::query(&format!("CREATE DATABASE \"{}\"", cli.db_name)).execute(&admin_pool).await?;
        info!(db = %cli.db_name, "created database");
    }
    admin_pool.close().await;
    Ok(())
}

/// Strips the `mqtt://`/`mqtts://` scheme and splits `host:port`, defaulting
/// to the standard Sparkplug broker port when none is given.
fn parse_broker_host_port(url: &str) -> (String, u16) {
    let without_scheme = url.split("://").next_back().unwrap_or(url);
    match without_scheme.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(1883)),
        None => (without_scheme.to_string(), 1883),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining");
}
