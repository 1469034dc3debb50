use crate::config::Config;
use crate::decoder;
use crate::engine::SyncEngine;
use crate::router;
use crate::store::ClientCaches;
use crate::transport::WsConnector;
use std::io::Read;
use std::net::SocketAddr;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

const COMMAND_QUEUE: usize = 64;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "route" {
            return handle_route();
        }
    }

    let config = Config::load()?;
    let endpoint = config.push_endpoint()?;

    let mut engine = SyncEngine::new(
        WsConnector::new(config.connect_timeout()),
        endpoint.clone(),
        config.reconnect_interval(),
        &config.console.initial_path,
    );
    tracing::info!(
        endpoint = %endpoint,
        retry_interval_ms = config.reconnect.interval_ms,
        "console sync starting"
    );

    if let (Some(account_id), Some(token)) = (
        config.session.account_id.clone(),
        config.session.token.clone(),
    ) {
        engine.login(token, Some(account_id))?;
    }

    let snapshots = engine.subscribe();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut engine_task = tokio::spawn(engine.run(command_rx, shutdown_rx.clone()));

    let server_task = if config.status.enable {
        let addr: SocketAddr = format!("127.0.0.1:{}", config.status.port).parse()?;
        let token = config
            .status
            .token
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        println!("Status surface: http://{}/status?token={}", addr, token);
        let shutdown = shutdown_rx.clone();
        let command_tx = command_tx.clone();
        Some(tokio::spawn(async move {
            if let Err(err) =
                crate::server::start(addr, token, snapshots, command_tx, shutdown).await
            {
                tracing::error!(error = %err, "status surface failed");
            }
        }))
    } else {
        None
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            if let Err(err) = engine_task.await {
                tracing::warn!(error = %err, "sync engine task ended abnormally");
            }
        }
        res = &mut engine_task => {
            if let Err(err) = res {
                tracing::warn!(error = %err, "sync engine task ended abnormally");
            }
            let _ = shutdown_tx.send(true);
        }
    }

    if let Some(server_task) = server_task {
        let _ = server_task.await;
    }
    drop(command_tx);
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

/// Routes one raw frame from stdin against a path with empty caches.
fn handle_route() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(2)
        .ok_or("missing path (usage: route <path> < frame.json)")?;
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)?;

    let notification = decoder::decode_or_fallback(raw.trim());
    let commands = router::route(&notification, &path, &ClientCaches::new());
    println!("{}", serde_json::to_string_pretty(&commands)?);
    Ok(())
}
