use crate::{parse_hex, LinkArgs};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Args;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use mculink_bridge::{BridgeHandle, Channel, SendOutcome, SendRequest};
use mculink_core::constants::major_key_name;
use mculink_core::payload::PayloadEncoding;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Options for `mculink send`
#[derive(Debug, Clone, Args)]
pub struct SendArgs {
    #[command(flatten)]
    pub link: LinkArgs,

    /// Major key
    #[arg(long)]
    pub major: u8,

    /// Minor key
    #[arg(long, default_value = "0")]
    pub minor: u8,

    /// Payload as hex
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    pub hex: Option<String>,

    /// Send a file
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Wrap the data in packet start/end markers
    #[arg(long)]
    pub packeted: bool,

    /// Largest payload per frame (overrides the config file)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Wait for DEVICE_READY between frames
    #[arg(long)]
    pub paced: bool,

    /// Reset the device before sending
    #[arg(long)]
    pub reset_first: bool,

    /// Treat the payload as text numbers in this base (2, 8, 10 or 16)
    #[arg(long)]
    pub base: Option<u32>,

    /// Separator characters between text numbers
    #[arg(long, default_value = " ")]
    pub separators: String,
}

impl SendArgs {
    /// Send `hex` on `major`/`minor` over `link`
    pub fn hex(link: LinkArgs, major: u8, minor: u8, hex: &str) -> Self {
        Self {
            link,
            major,
            minor,
            hex: Some(hex.to_string()),
            file: None,
            packeted: false,
            chunk_size: None,
            paced: false,
            reset_first: false,
            base: None,
            separators: " ".to_string(),
        }
    }

    /// Send the file at `path` on `major`/`minor` over `link`
    pub fn file(link: LinkArgs, major: u8, minor: u8, path: impl Into<PathBuf>) -> Self {
        Self {
            hex: None,
            file: Some(path.into()),
            ..Self::hex(link, major, minor, "")
        }
    }
}

/// Progress bar for the send, and printer for anything the device sends back
struct Console {
    major_key: u8,
    bar: ProgressBar,
}

impl Channel for Console {
    fn major_key(&self) -> u8 {
        self.major_key
    }

    fn receive(&self, minor_key: u8, payload: Bytes) {
        self.bar.println(format!(
            "{} {} minor {}: {}",
            "<".cyan(),
            major_key_name(self.major_key),
            minor_key,
            hex::encode(&payload)
        ));
    }

    fn on_send_progress(&self, percent: u8, label: &str) {
        self.bar.set_position(percent as u64);
        self.bar.set_message(label.to_string());
    }

    fn on_disconnect(&self) {
        self.bar.abandon_with_message("disconnected");
    }
}

pub fn execute(args: &SendArgs) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: &SendArgs) -> Result<()> {
    let config = args.link.resolve()?;
    let transport = config
        .transport
        .as_ref()
        .context("No transport configured")?
        .build()
        .await
        .context("Failed to create transport")?;
    info!("Sending over {}", transport.describe());

    let mut settings = config.channel(args.major);
    if let Some(chunk_size) = args.chunk_size {
        settings.chunk_size = chunk_size;
    }
    settings.paced |= args.paced;

    let bridge = BridgeHandle::spawn(transport, config)?;
    bridge.open_bridge().await.context("Failed to open link")?;
    bridge.configure_channel(settings).await?;

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")?.progress_chars("##-"),
    );
    let console = Arc::new(Console {
        major_key: args.major,
        bar,
    });
    bridge.register_channel(console.clone()).await?;

    if args.reset_first {
        match bridge.reset_remote().await {
            SendOutcome::Completed => info!("Device reset"),
            other => bail!("Reset failed: {:?}", other),
        }
    }

    let encoding = match args.base {
        Some(base) => PayloadEncoding::text(base, args.separators.clone()),
        None => PayloadEncoding::raw(),
    };
    let mut request = match (&args.file, &args.hex) {
        (Some(path), _) => SendRequest::file(args.major, args.minor, path),
        (None, Some(text)) => SendRequest::chunk(args.major, args.minor, parse_hex(text)?),
        (None, None) => bail!("Give the payload with --hex or --file"),
    }
    .encoding(encoding)
    .source(&console);
    if args.packeted {
        request = request.packeted();
    }
    debug!("{:?}", request);

    let outcome = bridge.send(request).await;
    console.bar.finish_and_clear();
    bridge.destroy_bridge().await?;

    match outcome {
        SendOutcome::Completed => {
            println!("{} Sent on {}", "✓".green(), major_key_name(args.major));
            Ok(())
        }
        SendOutcome::Cancelled => bail!("Send cancelled"),
        SendOutcome::Failed(msg) => bail!("Send failed: {}", msg),
    }
}
