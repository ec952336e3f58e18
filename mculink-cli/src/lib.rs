//! Library entry for mculink-cli used by integration tests and embedding.

pub mod commands;

// Re-export commands for convenience
pub use commands::*;

use anyhow::{bail, Context, Result};
use mculink_bridge::{BridgeConfig, TransportConfig};
use mculink_core::checksum::{ChecksumConfig, ChecksumKind, ChecksumTable};
use std::path::PathBuf;

/// Built-in checksum algorithms selectable on the command line
#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ChecksumArg {
    /// CRC-8, lookup table
    Crc8,
    /// CRC-8, bitwise
    Crc8Poly,
    /// CRC-16 CCITT, lookup table
    Crc16,
    /// CRC-16 CCITT, bitwise
    Crc16Poly,
    /// CRC-32, lookup table
    Crc32,
    /// CRC-32, bitwise
    Crc32Poly,
}

impl From<ChecksumArg> for ChecksumKind {
    fn from(arg: ChecksumArg) -> Self {
        match arg {
            ChecksumArg::Crc8 => ChecksumKind::Crc8Table,
            ChecksumArg::Crc8Poly => ChecksumKind::Crc8Poly,
            ChecksumArg::Crc16 => ChecksumKind::Crc16Table,
            ChecksumArg::Crc16Poly => ChecksumKind::Crc16Poly,
            ChecksumArg::Crc32 => ChecksumKind::Crc32Table,
            ChecksumArg::Crc32Poly => ChecksumKind::Crc32Poly,
        }
    }
}

/// Checksum table with `major_key` overridden, or the default table when
/// the default CRC-8 with start 0 is requested
pub fn checksum_table(major_key: u8, checksum: ChecksumArg, start: u32) -> Result<ChecksumTable> {
    let mut table = ChecksumTable::new();
    if checksum != ChecksumArg::Crc8 || start != 0 {
        let slot = ChecksumConfig::new(checksum.into(), start)
            .build()
            .with_context(|| format!("Failed to set up {:?} checksum", checksum))?;
        table
            .configure(major_key, slot)
            .with_context(|| format!("Invalid major key {}", major_key))?;
    }
    Ok(table)
}

/// Link selection shared by `send` and `listen`.
///
/// Flags override the `[transport]` table of `--config`.
#[derive(Debug, Clone, clap::Args)]
pub struct LinkArgs {
    /// Bridge configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Serial port, e.g. /dev/ttyUSB0 or COM3
    #[arg(long, conflicts_with_all = ["tcp", "tcp_listen", "udp_remote"])]
    pub serial: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value = "115200")]
    pub baud: u32,

    /// Connect over TCP to HOST:PORT
    #[arg(long, conflicts_with_all = ["tcp_listen", "udp_remote"])]
    pub tcp: Option<String>,

    /// Listen for one TCP peer on ADDR
    #[arg(long, conflicts_with = "udp_remote")]
    pub tcp_listen: Option<String>,

    /// Send UDP datagrams to ADDR
    #[arg(long, requires = "udp_local")]
    pub udp_remote: Option<String>,

    /// Receive UDP datagrams on ADDR
    #[arg(long)]
    pub udp_local: Option<String>,

    /// Send UDP datagrams from this local ADDR instead of the receive socket
    #[arg(long)]
    pub udp_send_from: Option<String>,

    /// Acknowledgement timeout in milliseconds
    #[arg(long)]
    pub ack_timeout_ms: Option<u64>,

    /// Give up after this many retransmissions
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl LinkArgs {
    /// Link flags for a TCP client, with everything else at its default
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self {
            config: None,
            serial: None,
            baud: 115_200,
            tcp: Some(addr.into()),
            tcp_listen: None,
            udp_remote: None,
            udp_local: None,
            udp_send_from: None,
            ack_timeout_ms: None,
            max_retries: None,
        }
    }

    /// Merge the config file and the flags into a bridge configuration
    pub fn resolve(&self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => BridgeConfig::default(),
        };

        if let Some(port) = &self.serial {
            config.transport = Some(TransportConfig::Serial {
                port: port.clone(),
                baud_rate: self.baud,
                poll_interval_ms: mculink_bridge::config::DEFAULT_POLL_INTERVAL_MS,
            });
        } else if let Some(addr) = &self.tcp {
            let (host, port) = addr
                .rsplit_once(':')
                .with_context(|| format!("Expected HOST:PORT, got {}", addr))?;
            let port = port
                .parse()
                .with_context(|| format!("Invalid TCP port in {}", addr))?;
            config.transport = Some(TransportConfig::TcpClient {
                host: host.to_string(),
                port,
            });
        } else if let Some(bind) = &self.tcp_listen {
            config.transport = Some(TransportConfig::TcpServer { bind: bind.clone() });
        } else if let Some(remote) = &self.udp_remote {
            let local = self
                .udp_local
                .clone()
                .context("--udp-remote needs --udp-local")?;
            config.transport = Some(TransportConfig::Udp {
                local,
                remote: remote.clone(),
                send_from: self.udp_send_from.clone(),
            });
        }

        if let Some(ms) = self.ack_timeout_ms {
            config.ack_timeout_ms = ms;
        }
        if self.max_retries.is_some() {
            config.max_retries = self.max_retries;
        }

        if config.transport.is_none() {
            bail!("No link given: use --serial, --tcp, --tcp-listen, --udp-remote or a config file");
        }
        config.validate()?;
        Ok(config)
    }
}

/// Parse a hex payload, tolerating spaces and a `0x` prefix
pub fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text.split_whitespace().collect();
    let cleaned = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
        .unwrap_or(&cleaned);
    hex::decode(cleaned).with_context(|| format!("Invalid hex payload: {}", text))
}
