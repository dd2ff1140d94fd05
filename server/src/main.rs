mod access;
mod camera;
mod context;
mod qr;
mod routes;
mod stream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use access::AllowedNetwork;
use camera::{CameraError, CameraStream};
use context::AppContext;
use pi_rover_common::config::Config;
use pi_rover_common::frame::FrameRelay;
use pi_rover_common::motor::{GpioMotorDriver, MotorDriver, MotorError, Speed};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid allowed_network: {0}")]
    Network(#[from] access::NetworkParseError),
    #[error("GPIO initialization failed: {0}")]
    Motor(#[from] MotorError),
    #[error("camera initialization failed: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        port = config.server.port,
        motors = config.motors.enabled,
        qr = config.qr.enabled,
        "starting pi-rover"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    let allowed: AllowedNetwork = config.server.allowed_network.parse()?;

    // GPIO first, then the camera; released in reverse order below.
    let motors: Option<Arc<GpioMotorDriver>> = if config.motors.enabled {
        Some(Arc::new(GpioMotorDriver::open(&config.motors)?))
    } else {
        info!("motors disabled");
        None
    };

    let cameras = camera::list_cameras(&config.camera).await?;
    let camera_model = cameras
        .first()
        .map(|c| c.model.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let relay = Arc::new(FrameRelay::new());
    let mut camera = CameraStream::start(&config.camera, Arc::clone(&relay)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(AppContext::new(
        Arc::clone(&relay),
        motors.clone().map(|m| m as Arc<dyn MotorDriver>),
        config.qr.enabled,
        camera_model,
        Speed::from(config.motors.default_speed),
        shutdown_rx,
    ));
    let app = routes::router(Arc::clone(&ctx), allowed);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            camera.stop().await;
            return Err(StartupError::Bind(addr, e));
        }
    };
    info!(addr, allowed = %allowed, "server listening (loopback always allowed)");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutting down server");
        // Ends every open video stream so graceful shutdown can complete.
        let _ = shutdown_tx.send(true);
    })
    .await;
    if let Err(e) = served {
        error!(error = %e, "server error");
    }

    camera.stop().await;
    drop(ctx);
    if let Some(motors) = motors {
        if let Err(e) = motors.stop() {
            warn!(error = %e, "failed to stop motors");
        }
        // Last reference releases the GPIO pins.
        drop(motors);
        info!("motors stopped, GPIO released");
    }
    info!("server stopped");
    Ok(())
}
