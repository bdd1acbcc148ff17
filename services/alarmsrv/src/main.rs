//! Alarm service entry point

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use alarmsrv::board::{HardwareLink, MemoryLink};
use alarmsrv::config::DEFAULT_CONFIG_PATH;
use alarmsrv::messaging::{InboundHandler, MemoryMessaging, Messaging, RedisMessaging};
use alarmsrv::storage::{AlarmPersistence, MemoryAlarmStore, SqliteAlarmStore};
use alarmsrv::virtual_board::VirtualBoard;
use alarmsrv::{AlarmConfig, AlarmService};

#[derive(Parser, Debug)]
#[command(author, version, about = "Alarm lifecycle manager")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "ALARMSRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Drive the board with the scripted local alarms regime
    #[arg(long)]
    simulate: bool,

    /// Run without Redis and SQLite
    #[arg(long)]
    offline: bool,

    /// Override logging.level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AlarmConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    common::logging::init(common::LogConfig {
        service_name: config.service.name.clone(),
        level: config.logging.level.clone(),
        log_dir: config.logging.dir.clone(),
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("logging init failed: {}", e))?;

    info!("Starting alarm service {}", config.service.name);

    let cancel = common::shutdown_token();

    let mut redis = None;
    let messaging: Arc<dyn Messaging> = if args.offline || !config.messaging.enabled {
        let memory = MemoryMessaging::new(&config.service.name);
        memory.set_ready(true);
        Arc::new(memory)
    } else {
        let client = Arc::new(
            RedisMessaging::connect(
                &config.messaging.url,
                &config.messaging.prefix,
                &config.service.name,
            )
            .await
            .context("connecting to messaging")?,
        );
        redis = Some(client.clone());
        client
    };

    let store: Arc<dyn AlarmPersistence> = if args.offline || !config.storage.enabled {
        Arc::new(MemoryAlarmStore::new())
    } else {
        Arc::new(
            SqliteAlarmStore::connect(&config.storage.url)
                .await
                .context("opening alarm store")?,
        )
    };

    // The serial board driver reports through the same link contract
    let link: Arc<dyn HardwareLink> = Arc::new(MemoryLink::new());

    let service = AlarmService::bootstrap(config.clone(), messaging, store, Some(link))
        .await
        .context("bootstrapping alarm service")?;

    let listener = redis.map(|client| {
        let handler: Arc<dyn InboundHandler> = service.clone();
        client.spawn_listener(handler, cancel.clone())
    });

    service.on_board_ready(true).await;

    let regime = if args.simulate {
        service.board().cloned().map(|board| {
            let sids: Vec<String> = board.local_alarms().iter().map(|a| a.sid.clone()).collect();
            let regime = VirtualBoard::local_alarms_regime(
                &sids,
                Duration::from_millis(config.board.regime_interval_ms),
            );
            let cancel = cancel.clone();
            tokio::spawn(async move { regime.play(&board, &cancel).await })
        })
    } else {
        None
    };

    let result = service.run(cancel.clone()).await;

    if let Some(regime) = regime {
        regime.abort();
    }
    if let Some(listener) = listener {
        let _ = listener.await;
    }

    if let Err(e) = &result {
        error!("Alarm service failed: {}", e);
    }
    info!("Status at exit: {:?}", service.status());
    result.context("running alarm service")
}
