//! Screencast client for the XDG Desktop Portal.
//!
//! This binary negotiates a window capture through
//! `org.freedesktop.portal.ScreenCast`, plays the stream with the configured
//! pipeline and keeps running until the session is closed.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zbus::Connection;

use portal_screencast::config::Config;
use portal_screencast::desktop_client::DesktopClient;
use portal_screencast::pipeline::{CommandPipeline, StreamSink};
use portal_screencast::portal::{Negotiator, SOURCE_TYPE_WINDOW};
use portal_screencast::PortalError;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<PortalError>()
                .map_or(1, PortalError::exit_code);
            if code == 0 {
                info!("{err:#}");
            } else {
                error!("{err:#}");
            }
            ExitCode::from(code)
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::load();

    let connection = Connection::session()
        .await
        .context("Failed to connect to the session bus")?;
    let client = DesktopClient::new(connection).await?;
    info!("Connected to D-Bus session bus");

    match client.screencast_capabilities().await {
        Ok(caps) => {
            info!(
                version = caps.version,
                source_types = caps.source_types,
                cursor_modes = caps.cursor_modes,
                "ScreenCast portal available"
            );
            if caps.source_types & SOURCE_TYPE_WINDOW == 0 {
                warn!("Portal does not advertise window sources");
            }
        }
        Err(err) => warn!(?err, "Failed to read ScreenCast properties"),
    }

    let mut negotiator = Negotiator::new(Arc::new(client), config.negotiation_options()).await?;

    let stream = match negotiator.negotiate().await {
        Ok(stream) => stream,
        Err(err) => {
            negotiator.close().await;
            return Err(err.into());
        }
    };
    info!(
        node_id = stream.node_id,
        id = ?stream.id(),
        mapping_id = ?stream.mapping_id(),
        position = ?stream.position(),
        size = ?stream.size(),
        properties = ?stream.properties,
        "Stream negotiated"
    );

    let remote = if config.open_pipewire_remote {
        match negotiator.open_pipewire_remote().await {
            Ok(fd) => Some(fd),
            Err(err) => {
                warn!(%err, "Continuing without a dedicated PipeWire remote");
                None
            }
        }
    } else {
        None
    };

    let mut pipeline = CommandPipeline::new(config.pipeline.clone());
    if let Err(err) = pipeline.start(&stream, remote) {
        negotiator.close().await;
        return Err(err.into());
    }

    tokio::select! {
        result = negotiator.wait_closed() => {
            result?;
            info!("Session closed by the portal");
        }
        status = pipeline.wait() => {
            info!(?status, "Pipeline exited");
        }
        result = signal::ctrl_c() => {
            result?;
            info!("Shutdown requested");
        }
    }

    negotiator.close().await;
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
