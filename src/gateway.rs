use std::sync::Arc;

use clap::{App, Arg};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::boards::BoardRegistry;
use crate::catalog::FirmwareCatalog;
use crate::device::{DeviceDirectory, StaticDeviceDirectory};
use crate::networking::filters::api_routes;
use crate::ota::orchestrator::UploadOrchestrator;
use crate::progress::BroadcastProgressSink;
use crate::settings::GatewaySettings;
use crate::signals::signal_for_shutdown;
use crate::storage::FirmwareBlobStore;

/// Events buffered per websocket listener before it starts skipping.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 256;

///
/// The entry point to the gateway runtime
///
pub async fn run() -> crate::Result<()> {
    //
    // handle command-line arguments
    //
    let matches = App::new("OTA Gateway")
        .about("Serves the firmware catalog and pushes firmware to devices")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .default_value("config")
                .takes_value(true)
                .help("config file name"),
        )
        .get_matches();
    let config_name = matches.value_of("config").unwrap_or("config");
    let settings = GatewaySettings::load(config_name)?;

    let mut gateway = Gateway::new(settings)?;

    //
    // run until the server fails or we are told to stop
    //
    tokio::select! {
        res = gateway.run() => {
            if let Err(err) = res {
                error!("gateway err {:?}", err);
            }
        },
        _ = signal_for_shutdown() => {
            info!("Shutting down!")
        }
    }
    gateway.shutdown();

    Ok(())
}

//
// Long-lived gateway components. Everything which needs shared write
// access is wrapped in a tokio RwLock and handed out as an Arc clone.
//
struct Gateway {
    settings: GatewaySettings,
    catalog_lock: Arc<RwLock<FirmwareCatalog>>,
    orchestrator: Arc<UploadOrchestrator>,
    sink: BroadcastProgressSink,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl Gateway {
    fn new(settings: GatewaySettings) -> crate::Result<Gateway> {
        //
        // load the catalog from disk
        //
        let blobs = FirmwareBlobStore::open(&settings.storage.firmware_dir)?;
        let catalog = FirmwareCatalog::open(&settings.storage.metadata_dir, blobs)?;
        let catalog_lock = Arc::new(RwLock::new(catalog));

        let directory: Arc<dyn DeviceDirectory> =
            Arc::new(StaticDeviceDirectory::new(settings.devices.clone()));
        let boards = BoardRegistry::with_overrides(&settings.ota.boards);
        let sink = BroadcastProgressSink::new(PROGRESS_CHANNEL_CAPACITY);
        let orchestrator = Arc::new(UploadOrchestrator::new(
            catalog_lock.clone(),
            directory,
            boards,
            Arc::new(sink.clone()),
            settings.ota.transfer_settings(),
            settings.ota.workers,
        ));

        Ok(Gateway {
            settings,
            catalog_lock,
            orchestrator,
            sink,
            sweeper: None,
        })
    }

    async fn run(&mut self) -> crate::Result<()> {
        self.sweeper = Some(
            self.orchestrator
                .spawn_sweeper(self.settings.ota.sweep_interval()),
        );

        let routes = api_routes(
            self.catalog_lock.clone(),
            self.orchestrator.clone(),
            self.sink.clone(),
        );
        let host = self.settings.server.host;
        let port = self.settings.server.port;
        let (address, server) = warp::serve(routes).try_bind_ephemeral((host, port))?;
        info!(
            "gateway listening on {} with {} devices configured",
            address,
            self.settings.devices.len()
        );
        server.await;
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
