//! Bridge configuration
//!
//! Loaded from TOML:
//!
//! ```toml
//! ack_timeout_ms = 500
//! device_ready_timeout_ms = 2000
//!
//! [[channels]]
//! major_key = 6
//! chunk_size = 32
//! paced = true
//! checksum = { algorithm = "crc16_table", start = 0xFFFF }
//!
//! [transport]
//! kind = "serial"
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! ```

use crate::error::{BridgeError, Result};
use crate::transport::{
    SerialSettings, SerialTransport, TcpClientTransport, TcpServerTransport, Transport,
    UdpTransport,
};
use mculink_core::constants::MAX_MAJOR_KEY;
use mculink_core::{ChecksumConfig, ChecksumTable};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default acknowledgement timeout
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 500;

/// Default wait for DEVICE_READY on paced channels
pub const DEFAULT_DEVICE_READY_TIMEOUT_MS: u64 = 2000;

/// Minimum disk read size for file sends (1 MiB)
pub const DEFAULT_FILE_READ_CHUNK: usize = 1024 * 1024;

/// Default capacity of the engine's event queue
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default interval for the serial port watcher
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Largest inbound payload the receive accumulator will wait for (16 MiB)
pub const DEFAULT_MAX_INBOUND_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Top-level bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long to wait for an acknowledgement before retransmitting
    pub ack_timeout_ms: u64,
    /// How long a paced channel waits for DEVICE_READY
    pub device_ready_timeout_ms: u64,
    /// Disk read size for file sends; raised to the channel chunk size if smaller
    pub file_read_chunk: usize,
    /// Retransmissions before a send fails; unlimited when absent
    pub max_retries: Option<u32>,
    /// Capacity of the engine's event queue
    pub event_capacity: usize,
    /// Inbound frames declaring a larger payload are treated as framing errors
    pub max_inbound_payload: u64,
    /// Per-channel settings
    pub channels: Vec<ChannelSettings>,
    /// Link to open
    pub transport: Option<TransportConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            device_ready_timeout_ms: DEFAULT_DEVICE_READY_TIMEOUT_MS,
            file_read_chunk: DEFAULT_FILE_READ_CHUNK,
            max_retries: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_inbound_payload: DEFAULT_MAX_INBOUND_PAYLOAD,
            channels: Vec::new(),
            transport: None,
        }
    }
}

impl BridgeConfig {
    /// Parse TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: BridgeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        debug!("Loaded bridge config from {}", path.display());
        Self::from_toml_str(&text)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.ack_timeout_ms == 0 {
            return Err(BridgeError::Config("ack_timeout_ms must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(BridgeError::Config("event_capacity must be positive".into()));
        }
        for channel in &self.channels {
            if channel.major_key > MAX_MAJOR_KEY {
                return Err(BridgeError::Config(format!(
                    "channel major key {} exceeds {}",
                    channel.major_key, MAX_MAJOR_KEY
                )));
            }
        }
        Ok(())
    }

    /// Acknowledgement timeout
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Device-ready timeout
    pub fn device_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.device_ready_timeout_ms)
    }

    /// Build the checksum table: defaults plus every channel override
    pub fn checksum_table(&self) -> Result<ChecksumTable> {
        let mut table = ChecksumTable::new();
        for channel in &self.channels {
            if let Some(checksum) = &channel.checksum {
                table.configure(channel.major_key, checksum.build()?)?;
            }
        }
        Ok(table)
    }

    /// Settings for `major_key`, or the defaults
    pub fn channel(&self, major_key: u8) -> ChannelSettings {
        self.channels
            .iter()
            .find(|c| c.major_key == major_key)
            .cloned()
            .unwrap_or_else(|| ChannelSettings::new(major_key))
    }
}

/// Per-major-key send settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Major key these settings apply to
    pub major_key: u8,
    /// Largest payload per frame; 0 sends each payload as one frame
    #[serde(default)]
    pub chunk_size: usize,
    /// Wait for DEVICE_READY after every acknowledged frame but the last
    #[serde(default)]
    pub paced: bool,
    /// Checksum override
    #[serde(default)]
    pub checksum: Option<ChecksumConfig>,
}

impl ChannelSettings {
    /// Unsplit, unpaced, default checksum
    pub fn new(major_key: u8) -> Self {
        Self {
            major_key,
            chunk_size: 0,
            paced: false,
            checksum: None,
        }
    }

    /// Set the frame payload limit
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Enable device-ready pacing
    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }
}

/// Which link to open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Serial port
    Serial {
        /// Port name, e.g. `/dev/ttyUSB0` or `COM3`
        port: String,
        /// Baud rate
        baud_rate: u32,
        /// How often the watcher checks that the port still exists
        #[serde(default = "default_poll_interval")]
        poll_interval_ms: u64,
    },
    /// TCP client
    TcpClient {
        /// Remote host
        host: String,
        /// Remote port
        port: u16,
    },
    /// TCP server accepting a single peer
    TcpServer {
        /// Listen address, e.g. `0.0.0.0:5000`
        bind: String,
    },
    /// UDP with independent receive and send endpoints
    Udp {
        /// Local receive address
        local: String,
        /// Remote address frames are sent to
        remote: String,
        /// Separate local address to send from
        #[serde(default)]
        send_from: Option<String>,
    },
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl TransportConfig {
    /// Construct the transport. Listening sockets are bound here; the
    /// connection itself is made by [`Transport::open`].
    pub async fn build(&self) -> Result<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match self {
            TransportConfig::Serial {
                port,
                baud_rate,
                poll_interval_ms,
            } => Arc::new(SerialTransport::new(
                SerialSettings::new(port.clone(), *baud_rate)
                    .poll_interval(Duration::from_millis(*poll_interval_ms)),
            )),
            TransportConfig::TcpClient { host, port } => {
                Arc::new(TcpClientTransport::new(format!("{}:{}", host, port)))
            }
            TransportConfig::TcpServer { bind } => Arc::new(TcpServerTransport::bind(bind).await?),
            TransportConfig::Udp {
                local,
                remote,
                send_from,
            } => Arc::new(UdpTransport::bind(local, remote, send_from.as_deref()).await?),
        };
        Ok(transport)
    }
}
