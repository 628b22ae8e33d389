use p1reader::{ApiManager, AppState, Config, P1Manager, PipelineStats, SerialDevice, SnapshotPublisher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use log::{error, info, warn};


#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let (config, config_path) = match Config::load() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()));
        }
    };

    // Initialize logging
    let default_filter = std::env::var("P1_LOG_LEVEL").unwrap_or(config.default_log_filter().to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    match config_path {
        Some(path) => info!("Using config {}", path.display()),
        None => warn!("No config file found, using defaults"),
    }

    let data_dir = PathBuf::from(&config.storage.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        warn!("Could not create data directory {}: {}", data_dir.display(), e);
    }

    let publisher = Arc::new(SnapshotPublisher::new());
    let stats = Arc::new(PipelineStats::default());
    let shutdown = Arc::new(AtomicBool::new(false));

    /* The acquisition loop blocks on the serial port, it gets its own thread */
    let manager = P1Manager::new(&config, publisher.clone(), stats.clone(), shutdown.clone());
    let device = SerialDevice::new(config.serial.clone());
    let (done_tx, mut acquisition) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("p1-acquisition".to_string())
        .spawn(move || {
            let _ = done_tx.send(manager.run(&device));
        })?;

    /* Run our api now, it only ever reads the publisher */
    let api = ApiManager::new(AppState::new(publisher, stats), config.httpd.clone(), data_dir);
    let server = api.start()?;
    let server_handle = server.handle();
    let mut server_task = actix_web::rt::spawn(server);

    info!("All modules started, now waiting for a signal to exit");
    let mut exit_code = Ok(());
    let mut acquisition_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Stopping...");
        }
        result = &mut acquisition => {
            acquisition_done = true;
            match result {
                Ok(Ok(())) => info!("Acquisition finished"),
                Ok(Err(e)) => {
                    error!("Acquisition stopped: {}", e);
                    exit_code = Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
                }
                Err(e) => {
                    error!("Acquisition thread died: {}", e);
                    exit_code = Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
                }
            }
        }
        result = &mut server_task => {
            error!("HTTP server stopped: {:?}", result);
        }
    }

    shutdown.store(true, Ordering::SeqCst);
    server_handle.stop(true).await;

    /* A blocked read only returns with the next line from the meter */
    if !acquisition_done && tokio::time::timeout(Duration::from_secs(2), acquisition).await.is_err() {
        warn!("Serial read still blocked, exiting anyway");
    }

    exit_code
}
