use std::{process, sync::Arc, time::Duration};

use skylink::{
    config::Config,
    core::{
        commands::{self, CommandHandler, INTERVAL_PROPERTY},
        join_task,
        readiness::Readiness,
        telemetry::{IntervalControl, Simulator, TelemetryLoop},
    },
    logger::LoggerManager,
    print_error,
};
use skylink_client::{ConnectionStatusInfo, DeviceInstance, DeviceManager, IncomingRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on draining sends and disconnecting at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let cfg = Config::new().unwrap_or_else(|e| {
        print_error!("{}", e);
        process::exit(1);
    });

    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting skylink version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!(host = %cfg.device.host, client_id = %cfg.device.client_id(), "Device settings loaded");

    let device = DeviceManager::from_config(cfg.device.clone())
        .and_then(|manager| {
            manager
                .on_connection_status(Arc::new(|status: ConnectionStatusInfo| info!("Connection status: {}", status)))
                .build()
        })
        .unwrap_or_else(|e| {
            error!("Failed to build the device client: {}", e);
            process::exit(1);
        });
    let device = Arc::new(device);
    let client = device.client();

    let readiness = Readiness::default();
    readiness.start_listening(client.subscribe_status());

    let cancel = CancellationToken::new();
    let interval = IntervalControl::new(cfg.telemetry.interval());
    let handler = CommandHandler::new(client.clone(), interval.clone());

    tokio::select! {
        result = connect(&device, &handler, &cancel) => {
            if let Err(e) = result {
                error!("Failed to connect: {}", e);
                process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted while connecting");
            cancel.cancel();
            return;
        }
    }

    let telemetry = tokio::spawn(
        TelemetryLoop::new(
            device.clone(),
            Simulator::new(cfg.telemetry.clone()),
            readiness,
            interval,
        )
        .run(cancel.child_token()),
    );
    let requests = tokio::spawn(commands::serve(device.clone(), handler, cancel.child_token()));

    info!(
        seconds = cfg.telemetry.interval,
        "Publishing telemetry, press Ctrl+C to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, initiating graceful shutdown...");
    cancel.cancel();

    if let Some(sent) = join_task("telemetry", telemetry).await {
        info!(sent, "Telemetry stopped");
    }
    join_task("requests", requests).await;

    let grace = CancellationToken::new();
    let timer = {
        let grace = grace.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            grace.cancel();
        })
    };
    if let Err(e) = device.shutdown(&grace).await {
        warn!("Shutdown was not clean: {}", e);
    }
    timer.abort();
    info!("Shutdown complete");
}

/// Opens the connection, enables cloud requests and applies the interval
/// already stored in the twin.
async fn connect(
    device: &DeviceInstance,
    handler: &CommandHandler,
    cancel: &CancellationToken,
) -> skylink_client::Result<()> {
    let client = device.client();
    info!("Connecting to the hub...");
    client.open(cancel).await?;
    client.enable_methods(cancel).await?;
    client.enable_twin_patch(cancel).await?;
    info!("Connected, methods and desired properties enabled");

    let twin = client.get_twin(cancel).await?;
    if twin.desired.contains_key(INTERVAL_PROPERTY) {
        let request = IncomingRequest::DesiredProperties {
            version: twin.desired_version(),
            patch: twin.desired,
        };
        if let Err(e) = handler.handle(request, cancel).await {
            warn!("Failed to apply the stored telemetry interval: {}", e);
        }
    }
    Ok(())
}
