use crate::LinkArgs;
use anyhow::{Context, Result};
use bytes::Bytes;
use colored::*;
use mculink_bridge::{BridgeHandle, Channel};
use mculink_core::constants::MAJOR_KEY_IO;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

/// Prints every frame the bridge dispatches
struct Printer {
    frames: AtomicUsize,
    gone: Notify,
}

impl Channel for Printer {
    fn major_key(&self) -> u8 {
        MAJOR_KEY_IO
    }

    fn accepts_all(&self) -> bool {
        true
    }

    fn receive(&self, minor_key: u8, payload: Bytes) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        println!(
            "{} minor {:>3}  {:>6} bytes  {}",
            "<".cyan(),
            minor_key,
            payload.len(),
            hex::encode(&payload)
        );
    }

    fn on_receive_progress(&self, percent: u8, label: &str) {
        println!("{} {:>3}% {}", "~".yellow(), percent, label);
    }

    fn on_disconnect(&self) {
        self.gone.notify_one();
    }
}

/// Print incoming frames until the link drops or `seconds` pass
pub fn execute(link: &LinkArgs, seconds: Option<u64>) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run(link, seconds))
}

async fn run(link: &LinkArgs, seconds: Option<u64>) -> Result<()> {
    let config = link.resolve()?;
    let transport = config
        .transport
        .as_ref()
        .context("No transport configured")?
        .build()
        .await
        .context("Failed to create transport")?;
    let name = transport.describe();

    let bridge = BridgeHandle::spawn(transport, config)?;
    let printer = Arc::new(Printer {
        frames: AtomicUsize::new(0),
        gone: Notify::new(),
    });
    bridge.register_channel(printer.clone()).await?;
    bridge.open_bridge().await.context("Failed to open link")?;
    info!("Listening on {}", name);

    match seconds {
        Some(secs) => {
            tokio::select! {
                _ = printer.gone.notified() => info!("Link closed"),
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            }
        }
        None => printer.gone.notified().await,
    }

    bridge.destroy_bridge().await?;
    println!(
        "\n{} {} frame(s) received",
        "✓".green(),
        printer.frames.load(Ordering::Relaxed)
    );
    Ok(())
}
