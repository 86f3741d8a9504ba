//! Foreground daemon: periodic reconciliation, events printed as JSON lines.

use tokio::sync::broadcast::error::RecvError;

use crate::context::Context;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open()?;
    let mut events = ctx.engine.events();

    let report = ctx.engine.initialize().await;
    tracing::info!(mode = %report.mode, online = report.online, "bootstrapped");

    let handle = std::sync::Arc::clone(&ctx.engine).start();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(n)) => tracing::warn!("dropped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await;
    Ok(())
}
