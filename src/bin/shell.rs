use anyhow::{Context, Result};
use std::time::Instant;
use tracing::{error, info};
use vios::{DEFAULT_ENGINE_ADDR, connect_engine, init_tracing, shell};
use vios_router::{ByteOrder, Router, RouterConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let addr = std::env::var("VIOS_ADDR").unwrap_or_else(|_| DEFAULT_ENGINE_ADDR.to_string());
    let byte_order = match std::env::var("VIOS_BYTE_ORDER").as_deref() {
        Ok("big") => ByteOrder::Big,
        Ok("native") => ByteOrder::Native,
        _ => ByteOrder::Little,
    };

    let start = Instant::now();
    info!(addr = %addr, "Connecting to speech engine");

    let (reader, writer) = connect_engine(&addr)
        .await
        .with_context(|| format!("failed to connect to engine at {addr}"))?;

    let config = RouterConfig::builder().byte_order(byte_order).build();
    let router = Router::new(writer, config);
    let mut ingest = router.spawn(reader);
    info!("Started router");

    tokio::select! {
        result = shell::run(router.clone()) => {
            result?;
        }
        result = &mut ingest => {
            // Routing cannot continue without the transport.
            match result {
                Ok(Err(e)) => error!(error = %e, "Router stopped"),
                Err(e) => error!(error = %e, "Router task failed"),
                Ok(Ok(())) => {}
            }
            anyhow::bail!("lost connection to speech engine");
        }
    }

    ingest.abort();
    info!(elapsed_secs = start.elapsed().as_secs(), "Exiting");
    Ok(())
}
