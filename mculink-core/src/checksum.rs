//! Checksum providers
//!
//! Every major key is bound to a [`ChecksumSlot`]: an algorithm plus the start
//! value fed into it. Slots live in a [`ChecksumTable`] owned by whoever runs
//! the codec (the bridge engine on the host, the FSM on the device), so there
//! is no process-wide checksum state.
//!
//! Provided algorithms:
//! - CRC-8, polynomial 0x07, MSB-first, init = start
//! - CRC-16/CCITT, polynomial 0x1021, MSB-first, init = start
//! - CRC-32/IEEE, reflected 0xEDB88320, init = !start, final xor 0xFFFFFFFF
//! - an external executable (see [`ExternalChecksum`])
//!
//! Each CRC comes as a lookup-table and a bitwise variant with identical output.
//! Checksums are emitted big-endian.

use crate::constants::{MAJOR_KEY_COUNT, MAJOR_KEY_GENERAL_SETTINGS};
use crate::error::FrameError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// A checksum strategy.
pub trait ChecksumAlgorithm: Send + Sync + fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Number of checksum bytes this algorithm produces
    fn size(&self) -> usize;

    /// Compute the checksum of `data` seeded with `start`
    fn compute(&self, data: &[u8], start: u32) -> Result<Vec<u8>, FrameError>;

    /// Compare a computed checksum with one read off the wire
    fn compare(&self, computed: &[u8], received: &[u8]) -> bool {
        computed == received
    }
}

/// Selectable checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    /// CRC-8 via 256-entry lookup table
    Crc8Table,
    /// CRC-8 via bitwise polynomial division
    Crc8Poly,
    /// CRC-16 via lookup table
    Crc16Table,
    /// CRC-16 via bitwise polynomial division
    Crc16Poly,
    /// CRC-32 via lookup table
    Crc32Table,
    /// CRC-32 via bitwise polynomial division
    Crc32Poly,
    /// User-supplied executable
    External,
}

impl ChecksumKind {
    /// Parse from the snake_case name used in configuration files
    pub fn parse(s: &str) -> Result<Self, FrameError> {
        match s {
            "crc8_table" | "crc8" => Ok(ChecksumKind::Crc8Table),
            "crc8_poly" => Ok(ChecksumKind::Crc8Poly),
            "crc16_table" | "crc16" => Ok(ChecksumKind::Crc16Table),
            "crc16_poly" => Ok(ChecksumKind::Crc16Poly),
            "crc32_table" | "crc32" => Ok(ChecksumKind::Crc32Table),
            "crc32_poly" => Ok(ChecksumKind::Crc32Poly),
            "external" => Ok(ChecksumKind::External),
            _ => Err(FrameError::ExternalChecksum(format!(
                "Unknown checksum algorithm: {}",
                s
            ))),
        }
    }
}

/// Serializable description of a checksum slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumConfig {
    /// Algorithm
    #[serde(alias = "algorithm")]
    pub kind: ChecksumKind,
    /// Start value fed into the algorithm
    #[serde(default)]
    pub start: u32,
    /// Executable for [`ChecksumKind::External`]
    #[serde(default)]
    pub executable: Option<PathBuf>,
}

impl Default for ChecksumConfig {
    fn default() -> Self {
        Self {
            kind: ChecksumKind::Crc8Table,
            start: 0,
            executable: None,
        }
    }
}

impl ChecksumConfig {
    /// Create a config for a built-in algorithm
    pub fn new(kind: ChecksumKind, start: u32) -> Self {
        Self {
            kind,
            start,
            executable: None,
        }
    }

    /// Create a config for an external checksum executable
    pub fn external(path: impl Into<PathBuf>, start: u32) -> Self {
        Self {
            kind: ChecksumKind::External,
            start,
            executable: Some(path.into()),
        }
    }

    /// Instantiate the slot. External executables are asked for their size here.
    pub fn build(&self) -> Result<ChecksumSlot, FrameError> {
        let algorithm: Arc<dyn ChecksumAlgorithm> = match self.kind {
            ChecksumKind::Crc8Table => Arc::new(Crc8Table),
            ChecksumKind::Crc8Poly => Arc::new(Crc8Poly),
            ChecksumKind::Crc16Table => Arc::new(Crc16Table),
            ChecksumKind::Crc16Poly => Arc::new(Crc16Poly),
            ChecksumKind::Crc32Table => Arc::new(Crc32Table),
            ChecksumKind::Crc32Poly => Arc::new(Crc32Poly),
            ChecksumKind::External => {
                let path = self.executable.as_ref().ok_or_else(|| {
                    FrameError::ExternalChecksum("no executable configured".into())
                })?;
                Arc::new(ExternalChecksum::new(path)?)
            }
        };
        Ok(ChecksumSlot::new(algorithm, self.start))
    }
}

/// An algorithm bound to its start value
#[derive(Debug, Clone)]
pub struct ChecksumSlot {
    algorithm: Arc<dyn ChecksumAlgorithm>,
    start: u32,
}

impl ChecksumSlot {
    /// Bind an algorithm to a start value
    pub fn new(algorithm: Arc<dyn ChecksumAlgorithm>, start: u32) -> Self {
        Self { algorithm, start }
    }

    /// Checksum trailer size
    pub fn size(&self) -> usize {
        self.algorithm.size()
    }

    /// Start value
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Algorithm name
    pub fn name(&self) -> &str {
        self.algorithm.name()
    }

    /// Compute the trailer for `data`
    pub fn compute(&self, data: &[u8]) -> Result<Vec<u8>, FrameError> {
        let sum = self.algorithm.compute(data, self.start)?;
        if sum.len() != self.algorithm.size() {
            return Err(FrameError::ExternalChecksum(format!(
                "{} produced {} bytes, expected {}",
                self.algorithm.name(),
                sum.len(),
                self.algorithm.size()
            )));
        }
        Ok(sum)
    }

    /// Recompute over `data` and compare with `received`
    pub fn verify(&self, major_key: u8, data: &[u8], received: &[u8]) -> Result<(), FrameError> {
        let computed = self.compute(data)?;
        if self.algorithm.compare(&computed, received) {
            Ok(())
        } else {
            Err(FrameError::ChecksumMismatch {
                major_key,
                expected: hex::encode(&computed),
                actual: hex::encode(received),
            })
        }
    }
}

impl Default for ChecksumSlot {
    fn default() -> Self {
        Self::new(Arc::new(Crc8Table), 0)
    }
}

/// Per-major-key checksum configuration.
///
/// Keys 0..=8 (the reserved and well-known channel keys) start with the
/// default CRC-8 slot. Keys without a slot use the general-settings slot.
#[derive(Debug, Clone)]
pub struct ChecksumTable {
    slots: Vec<Option<ChecksumSlot>>,
    general: ChecksumSlot,
}

impl ChecksumTable {
    /// Table with default slots for every well-known key
    pub fn new() -> Self {
        let mut slots = vec![None; MAJOR_KEY_COUNT];
        for slot in slots.iter_mut().take(MAJOR_KEY_GENERAL_SETTINGS as usize + 1) {
            *slot = Some(ChecksumSlot::default());
        }
        Self {
            slots,
            general: ChecksumSlot::default(),
        }
    }

    /// Table where every key uses the same slot
    pub fn uniform(slot: ChecksumSlot) -> Self {
        Self {
            slots: vec![Some(slot.clone()); MAJOR_KEY_COUNT],
            general: slot,
        }
    }

    /// Replace the slot for `major_key`
    pub fn configure(&mut self, major_key: u8, slot: ChecksumSlot) -> Result<(), FrameError> {
        let idx = major_key as usize;
        if idx >= MAJOR_KEY_COUNT {
            return Err(FrameError::InvalidMajorKey(major_key));
        }
        #[cfg(feature = "logging")]
        debug!(
            "Checksum for major key {} set to {} (start {})",
            major_key,
            slot.name(),
            slot.start()
        );
        if major_key == MAJOR_KEY_GENERAL_SETTINGS {
            self.general = slot.clone();
        }
        self.slots[idx] = Some(slot);
        Ok(())
    }

    /// Slot applying to `major_key`; keys without their own slot use the
    /// general-settings slot
    pub fn slot(&self, major_key: u8) -> &ChecksumSlot {
        match self.slots.get(major_key as usize) {
            Some(Some(slot)) => slot,
            _ => &self.general,
        }
    }

    /// Whether `major_key` has its own slot
    pub fn has_slot(&self, major_key: u8) -> bool {
        self.slots
            .get(major_key as usize)
            .map_or(false, |s| s.is_some())
    }
}

impl Default for ChecksumTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// CRC-8
// ============================================================================

const CRC8_POLY: u8 = 0x07;

const fn make_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC8_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC8_TABLE: [u8; 256] = make_crc8_table();

/// CRC-8 (poly 0x07) using a lookup table
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc8Table;

impl ChecksumAlgorithm for Crc8Table {
    fn name(&self) -> &str {
        "crc8_table"
    }

    fn size(&self) -> usize {
        1
    }

    fn compute(&self, data: &[u8], start: u32) -> Result<Vec<u8>, FrameError> {
        let mut crc = start as u8;
        for &byte in data {
            crc = CRC8_TABLE[(crc ^ byte) as usize];
        }
        Ok(vec![crc])
    }
}

/// CRC-8 (poly 0x07) by bitwise division
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc8Poly;

impl ChecksumAlgorithm for Crc8Poly {
    fn name(&self) -> &str {
        "crc8_poly"
    }

    fn size(&self) -> usize {
        1
    }

    fn compute(&self, data: &[u8], start: u32) -> Result<Vec<u8>, FrameError> {
        let mut crc = start as u8;
        for &byte in data {
            crc ^= byte;
            for _ in 0..8 {
                if crc & 0x80 != 0 {
                    crc = (crc << 1) ^ CRC8_POLY;
                } else {
                    crc <<= 1;
                }
            }
        }
        Ok(vec![crc])
    }
}

// ============================================================================
// CRC-16
// ============================================================================

const CRC16_POLY: u16 = 0x1021;

const fn make_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = make_crc16_table();

/// CRC-16/CCITT (poly 0x1021) using a lookup table
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc16Table;

impl ChecksumAlgorithm for Crc16Table {
    fn name(&self) -> &str {
        "crc16_table"
    }

    fn size(&self) -> usize {
        2
    }

    fn compute(&self, data: &[u8], start: u32) -> Result<Vec<u8>, FrameError> {
        let mut crc = start as u16;
        for &byte in data {
            let idx = ((crc >> 8) as u8 ^ byte) as usize;
            crc = (crc << 8) ^ CRC16_TABLE[idx];
        }
        Ok(crc.to_be_bytes().to_vec())
    }
}

/// CRC-16/CCITT (poly 0x1021) by bitwise division
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc16Poly;

impl ChecksumAlgorithm for Crc16Poly {
    fn name(&self) -> &str {
        "crc16_poly"
    }

    fn size(&self) -> usize {
        2
    }

    fn compute(&self, data: &[u8], start: u32) -> Result<Vec<u8>, FrameError> {
        let mut crc = start as u16;
        for &byte in data {
            crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                if crc & 0x8000 != 0 {
                    crc = (crc << 1) ^ CRC16_POLY;
                } else {
                    crc <<= 1;
                }
            }
        }
        Ok(crc.to_be_bytes().to_vec())
    }
}

// ============================================================================
// CRC-32
// ============================================================================

const CRC32_POLY_REFLECTED: u32 = 0xEDB8_8320;

const fn make_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32_POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = make_crc32_table();

/// CRC-32/IEEE using a lookup table
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32Table;

impl ChecksumAlgorithm for Crc32Table {
    fn name(&self) -> &str {
        "crc32_table"
    }

    fn size(&self) -> usize {
        4
    }

    fn compute(&self, data: &[u8], start: u32) -> Result<Vec<u8>, FrameError> {
        let mut crc = !start;
        for &byte in data {
            crc = (crc >> 8) ^ CRC32_TABLE[((crc as u8) ^ byte) as usize];
        }
        Ok((!crc).to_be_bytes().to_vec())
    }
}

/// CRC-32/IEEE by bitwise division
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32Poly;

impl ChecksumAlgorithm for Crc32Poly {
    fn name(&self) -> &str {
        "crc32_poly"
    }

    fn size(&self) -> usize {
        4
    }

    fn compute(&self, data: &[u8], start: u32) -> Result<Vec<u8>, FrameError> {
        let mut crc = !start;
        for &byte in data {
            crc ^= byte as u32;
            for _ in 0..8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ CRC32_POLY_REFLECTED;
                } else {
                    crc >>= 1;
                }
            }
        }
        Ok((!crc).to_be_bytes().to_vec())
    }
}

// ============================================================================
// External process
// ============================================================================

/// Checksum computed by a user-supplied executable.
///
/// Contract:
/// - `exe -get_checksum_size` prints the checksum size as 4 big-endian bytes
/// - `exe -get_checksum <hex data> <len> <start>` prints the checksum bytes
/// - `exe -check_checksum <hex a> <hex b>` prints `0` or `1`
///
/// Binary arguments are hex-encoded because argv cannot carry NUL bytes.
#[derive(Debug, Clone)]
pub struct ExternalChecksum {
    path: PathBuf,
    size: usize,
}

impl ExternalChecksum {
    /// Ask `path` for its checksum size
    pub fn new(path: impl AsRef<Path>) -> Result<Self, FrameError> {
        let path = path.as_ref().to_path_buf();
        let out = run_external(&path, &["-get_checksum_size"])?;
        if out.len() < 4 {
            return Err(FrameError::ExternalChecksum(format!(
                "{}: size reply has {} bytes, expected 4",
                path.display(),
                out.len()
            )));
        }
        let size = u32::from_be_bytes([out[0], out[1], out[2], out[3]]) as usize;
        if size == 0 {
            return Err(FrameError::ExternalChecksum(format!(
                "{}: reported a zero checksum size",
                path.display()
            )));
        }

        #[cfg(feature = "logging")]
        debug!("External checksum {} reports size {}", path.display(), size);

        Ok(Self { path, size })
    }

    /// Executable path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChecksumAlgorithm for ExternalChecksum {
    fn name(&self) -> &str {
        "external"
    }

    fn size(&self) -> usize {
        self.size
    }

    fn compute(&self, data: &[u8], start: u32) -> Result<Vec<u8>, FrameError> {
        let hex_data = hex::encode(data);
        let len = data.len().to_string();
        let start = start.to_string();
        let out = run_external(&self.path, &["-get_checksum", &hex_data, &len, &start])?;
        if out.len() < self.size {
            return Err(FrameError::ExternalChecksum(format!(
                "{}: checksum reply has {} bytes, expected {}",
                self.path.display(),
                out.len(),
                self.size
            )));
        }
        Ok(out[..self.size].to_vec())
    }

    fn compare(&self, computed: &[u8], received: &[u8]) -> bool {
        let a = hex::encode(computed);
        let b = hex::encode(received);
        match run_external(&self.path, &["-check_checksum", &a, &b]) {
            Ok(out) => matches!(out.first(), Some(b'1') | Some(1)),
            Err(_e) => {
                #[cfg(feature = "logging")]
                warn!("External checksum compare failed: {}", _e);
                false
            }
        }
    }
}

fn run_external(path: &Path, args: &[&str]) -> Result<Vec<u8>, FrameError> {
    let output = Command::new(path)
        .args(args)
        .output()
        .map_err(|e| FrameError::ExternalChecksum(format!("{}: {}", path.display(), e)))?;
    if !output.status.success() {
        return Err(FrameError::ExternalChecksum(format!(
            "{} {} exited with {}",
            path.display(),
            args.first().copied().unwrap_or_default(),
            output.status
        )));
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK: &[u8] = b"123456789";

    #[test]
    fn test_crc8_check_value() {
        assert_eq!(Crc8Table.compute(CHECK, 0).unwrap(), vec![0xF4]);
        assert_eq!(Crc8Poly.compute(CHECK, 0).unwrap(), vec![0xF4]);
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(Crc16Table.compute(CHECK, 0).unwrap(), vec![0x31, 0xC3]);
        assert_eq!(Crc16Poly.compute(CHECK, 0).unwrap(), vec![0x31, 0xC3]);
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(
            Crc32Table.compute(CHECK, 0).unwrap(),
            vec![0xCB, 0xF4, 0x39, 0x26]
        );
        assert_eq!(
            Crc32Poly.compute(CHECK, 0).unwrap(),
            vec![0xCB, 0xF4, 0x39, 0x26]
        );
    }

    #[test]
    fn test_table_matches_poly_with_start_values() {
        let data: Vec<u8> = (0..=255u8).collect();
        for start in [0u32, 1, 0xFF, 0xFFFF, 0xDEAD_BEEF] {
            assert_eq!(
                Crc8Table.compute(&data, start).unwrap(),
                Crc8Poly.compute(&data, start).unwrap()
            );
            assert_eq!(
                Crc16Table.compute(&data, start).unwrap(),
                Crc16Poly.compute(&data, start).unwrap()
            );
            assert_eq!(
                Crc32Table.compute(&data, start).unwrap(),
                Crc32Poly.compute(&data, start).unwrap()
            );
        }
    }

    #[test]
    fn test_table_fallback_to_general_settings() {
        let mut table = ChecksumTable::new();
        assert!(!table.has_slot(40));
        assert_eq!(table.slot(40).size(), 1);

        table.configure(
            MAJOR_KEY_GENERAL_SETTINGS,
            ChecksumConfig::new(ChecksumKind::Crc32Table, 0).build().unwrap(),
        ).unwrap();
        assert_eq!(table.slot(40).size(), 4);
        // Well-known keys keep their own slot
        assert_eq!(table.slot(4).size(), 1);
    }

    #[test]
    fn test_configure_rejects_keys_past_six_bits() {
        let mut table = ChecksumTable::new();
        let crc32 = ChecksumConfig::new(ChecksumKind::Crc32Table, 0).build().unwrap();

        let err = table.configure(70, crc32.clone()).unwrap_err();
        assert_eq!(err, FrameError::InvalidMajorKey(70));
        // Key 70 % 64 keeps its slot
        assert_eq!(table.slot(6).size(), 1);

        assert!(table.configure(63, crc32).is_ok());
        assert_eq!(table.slot(63).size(), 4);
        // Out-of-range lookups fall back to general settings
        assert_eq!(table.slot(127).size(), 1);
    }

    #[test]
    fn test_verify_reports_mismatch() {
        let slot = ChecksumSlot::default();
        let sum = slot.compute(b"abc").unwrap();
        assert!(slot.verify(4, b"abc", &sum).is_ok());
        let err = slot.verify(4, b"abd", &sum).unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { major_key: 4, .. }));
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(ChecksumKind::parse("crc16").unwrap(), ChecksumKind::Crc16Table);
        assert_eq!(ChecksumKind::parse("crc32_poly").unwrap(), ChecksumKind::Crc32Poly);
        assert!(ChecksumKind::parse("md5").is_err());
    }

    #[test]
    fn test_external_without_executable_fails() {
        let cfg = ChecksumConfig {
            kind: ChecksumKind::External,
            start: 0,
            executable: None,
        };
        assert!(cfg.build().is_err());
    }

    #[test]
    fn test_external_missing_executable_fails() {
        let cfg = ChecksumConfig::external("/nonexistent/mculink-checksum", 0);
        assert!(matches!(cfg.build(), Err(FrameError::ExternalChecksum(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_external_script() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("sum.sh");
        let mut f = std::fs::File::create(&script).unwrap();
        writeln!(
            f,
            r#"#!/bin/sh
case "$1" in
  -get_checksum_size) printf '\000\000\000\001' ;;
  -get_checksum) printf 'Z' ;;
  -check_checksum) if [ "$2" = "$3" ]; then printf 1; else printf 0; fi ;;
esac"#
        )
        .unwrap();
        drop(f);
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let slot = ChecksumConfig::external(&script, 0).build().unwrap();
        assert_eq!(slot.size(), 1);
        assert_eq!(slot.compute(b"\x00\x01").unwrap(), b"Z".to_vec());
        assert!(slot.verify(5, b"anything", b"Z").is_ok());
        assert!(slot.verify(5, b"anything", b"Y").is_err());
    }
}
