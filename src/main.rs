use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use voicelink::node::NodeConnection;
use voicelink::{Config, DetachedGateway, NodeState, PlayerManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voicelink=debug".parse()?)
                .add_directive("tokio_tungstenite=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando voicelink v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    let manager = PlayerManager::new(
        config.nodes.clone(),
        config.manager_options()?,
        Arc::new(DetachedGateway),
    );

    let mut status = tokio::time::interval(config.status_interval);
    status.tick().await;

    info!("🚀 Control plane iniciado con {} nodos", config.nodes.len());
    loop {
        tokio::select! {
            _ = status.tick() => log_status(&manager).await,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("⚠️ No se pudo escuchar Ctrl+C: {}", e);
                }
                info!("⚠️ Señal de shutdown recibida, cerrando...");
                break;
            }
        }
    }

    manager.shutdown().await?;
    info!("👋 voicelink detenido");
    Ok(())
}

async fn log_status(manager: &PlayerManager) {
    let nodes = match manager.nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!("⚠️ Estado de nodos no disponible: {}", e);
            return;
        }
    };
    let sessions = manager.players().await.map(|p| p.len()).unwrap_or(0);

    info!("📊 {} sesiones activas", sessions);
    for node in nodes {
        let (players, load) = node.stats.as_ref().map_or((0, 0.0), |stats| {
            (stats.playing_players, stats.cpu_load())
        });
        let icon = match node.state {
            NodeState::Ready if node.draining => "🚰",
            NodeState::Ready => "🟢",
            NodeState::Connecting => "🟡",
            NodeState::Disconnected => "🔴",
        };
        info!(
            "{} {} [{}] {:?} · {} reproduciendo · CPU {:.1}% · reintentos {}",
            icon,
            node.key,
            node.region.as_deref().unwrap_or("-"),
            node.state,
            players,
            load,
            node.retries
        );
    }
}

async fn health_check(config: &Config) -> Result<()> {
    let options = config.manager_options()?;

    for address in &config.nodes {
        let node = address
            .clone()
            .into_options(&options.password, options.user_id, options.num_shards);

        match tokio::time::timeout(Duration::from_secs(5), NodeConnection::probe(&node)).await {
            Ok(Ok(())) => {
                info!("✅ {} responde", node.key());
                println!("OK");
                return Ok(());
            }
            Ok(Err(e)) => warn!("❌ Handshake fallido con {}: {}", node.key(), e),
            Err(_) => warn!("⏱️ {} no respondió a tiempo", node.key()),
        }
    }

    anyhow::bail!("Ningún nodo respondió");
}
