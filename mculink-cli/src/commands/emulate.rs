use anyhow::{bail, Context, Result};
use colored::*;
use mculink_core::checksum::ChecksumTable;
use mculink_core::constants::{
    major_key_name, MAJOR_KEY_CUSTOM_CMD, MAJOR_KEY_GENERAL_SETTINGS, MAJOR_KEY_IO,
    MINOR_KEY_PACKET_START,
};
use mculink_core::device::{
    DeviceConfig, DeviceError, DeviceFsm, DeviceStats, IoLink, Replies, DEFAULT_MAX_PAYLOAD,
    DEFAULT_STAGE_TIMEOUT_MS,
};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;
use tracing::{info, warn};

/// Options for `mculink emulate`
#[derive(Debug, Clone, clap::Args)]
pub struct EmulateArgs {
    /// Accept one host connection on ADDR
    #[arg(long, conflicts_with = "connect", required_unless_present = "connect")]
    pub listen: Option<String>,

    /// Connect to a host listening on ADDR
    #[arg(long)]
    pub connect: Option<String>,

    /// Largest payload the device buffers
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD)]
    pub max_payload: usize,

    /// Per-stage timeout of the receive loop
    #[arg(long, default_value_t = DEFAULT_STAGE_TIMEOUT_MS)]
    pub stage_timeout_ms: u64,

    /// Send DEVICE_READY after every handled frame
    #[arg(long)]
    pub paced: bool,

    /// Acknowledge without echoing payloads back
    #[arg(long)]
    pub no_echo: bool,
}

impl Default for EmulateArgs {
    fn default() -> Self {
        Self {
            listen: None,
            connect: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
            stage_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            paced: false,
            no_echo: false,
        }
    }
}

pub fn execute(args: &EmulateArgs) -> Result<()> {
    let stream = match (&args.listen, &args.connect) {
        (Some(addr), _) => {
            let listener =
                TcpListener::bind(addr).with_context(|| format!("Failed to bind {}", addr))?;
            info!("Waiting for the host on {}", listener.local_addr()?);
            let (stream, peer) = listener.accept()?;
            info!("Host connected from {}", peer);
            stream
        }
        (None, Some(addr)) => {
            TcpStream::connect(addr).with_context(|| format!("Failed to connect to {}", addr))?
        }
        (None, None) => bail!("Give --listen or --connect"),
    };

    let stats = serve(stream, args)?;
    println!("\n=== Device Statistics ===");
    println!("Frames handled:    {}", stats.frames_dispatched);
    println!("Checksum errors:   {}", stats.checksum_errors);
    println!("Unknown keys:      {}", stats.unknown_keys);
    println!("Stage timeouts:    {}", stats.stage_timeouts);
    println!("Resets:            {}", stats.resets);
    Ok(())
}

fn echo(major_key: u8, enabled: bool) -> impl FnMut(u8, &[u8], &mut Replies) -> Result<(), DeviceError> {
    move |minor_key, payload, replies| {
        // Packet markers are bookkeeping, not data
        if enabled && minor_key < MINOR_KEY_PACKET_START {
            replies.send(major_key, minor_key, payload);
        }
        Ok(())
    }
}

/// Run the device state machine over `stream` until the host hangs up
pub fn serve(stream: TcpStream, args: &EmulateArgs) -> Result<DeviceStats> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_millis(10)))?;

    let config = DeviceConfig {
        max_payload: args.max_payload,
        stage_timeout_ms: args.stage_timeout_ms,
    };
    let mut device = DeviceFsm::with_config(IoLink::new(stream), ChecksumTable::new(), config);
    for key in MAJOR_KEY_IO..=MAJOR_KEY_GENERAL_SETTINGS {
        if key != MAJOR_KEY_CUSTOM_CMD {
            device.register(key, echo(key, !args.no_echo));
        }
    }
    // Custom commands are acknowledged and dropped
    device.register(MAJOR_KEY_CUSTOM_CMD, |_: u8, _: &[u8], _: &mut Replies| {
        Ok::<(), DeviceError>(())
    });
    device.on_reset(|| info!("Reset by host"));

    loop {
        match device.poll_blocking() {
            Ok(Some(key)) => {
                println!("{} {}", ">".cyan(), major_key_name(key));
                if args.paced && key >= MAJOR_KEY_IO {
                    device.signal_ready()?;
                }
            }
            Ok(None) => {
                if device.link().is_closed() {
                    break;
                }
            }
            Err(e @ DeviceError::BufferExhausted { .. }) | Err(e @ DeviceError::Halted) => {
                return Err(e).context("Device halted");
            }
            Err(e) => warn!("{}", e),
        }
    }

    info!("Host disconnected");
    Ok(device.stats())
}
