use crate::ChecksumArg;
use anyhow::{Context, Result};
use colored::*;
use mculink_core::checksum::{ChecksumConfig, ChecksumTable};
use mculink_core::constants::major_key_name;
use mculink_core::decoder::decode_all;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read};
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecodedFrame {
    pub major_key: u8,
    pub name: String,
    pub minor_key: u8,
    pub payload_len: usize,
    pub payload: String,
    pub checksum: String,
}

/// Decode a frame file (`-` for stdin). Every key is verified with the
/// given checksum.
pub fn execute(input: &str, output: Option<&str>, checksum: ChecksumArg, start: u32) -> Result<()> {
    info!("Decoding file: {}", input);

    let data = if input == "-" {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf)?;
        buf
    } else {
        fs::read(input).with_context(|| format!("Failed to read input file: {}", input))?
    };

    let decoded = decode_bytes(&data, checksum, start)?;

    if let Some(output_path) = output {
        let json = serde_json::to_string_pretty(&decoded)
            .with_context(|| "Failed to serialize decoded frames")?;
        fs::write(output_path, json)
            .with_context(|| format!("Failed to write output file: {}", output_path))?;
        info!("Decoded frames written to: {}", output_path);
    } else {
        println!("\n=== Decoded Frames ===");
        for frame in &decoded {
            println!(
                "{:>2} {:<16} minor {:>3}  {:>6} bytes  {}",
                frame.major_key,
                frame.name,
                frame.minor_key,
                frame.payload_len,
                frame.payload
            );
        }
        println!("{} {} frame(s)", "✓".green(), decoded.len());
    }

    Ok(())
}

/// Decode every complete frame in `data`
pub fn decode_bytes(data: &[u8], checksum: ChecksumArg, start: u32) -> Result<Vec<DecodedFrame>> {
    let slot = ChecksumConfig::new(checksum.into(), start).build()?;
    let table = ChecksumTable::uniform(slot);

    let (frames, consumed) = decode_all(data, &table).with_context(|| "Invalid frame in input")?;
    if consumed < data.len() {
        warn!(
            "{} trailing bytes do not form a complete frame",
            data.len() - consumed
        );
    }

    Ok(frames
        .into_iter()
        .map(|frame| DecodedFrame {
            major_key: frame.major_key,
            name: major_key_name(frame.major_key).to_string(),
            minor_key: frame.minor_key,
            payload_len: frame.payload.len(),
            payload: hex::encode(&frame.payload),
            checksum: hex::encode(&frame.checksum),
        })
        .collect())
}
