use crate::{parse_hex, ChecksumArg};
use anyhow::{bail, Context, Result};
use colored::*;
use mculink_core::checksum::{ChecksumConfig, ChecksumSlot};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Options for `mculink checksum`
#[derive(Debug, Clone, clap::Args)]
pub struct ChecksumArgs {
    /// Built-in algorithm
    #[arg(long, value_enum, default_value = "crc8")]
    pub algorithm: ChecksumArg,

    /// Use an external checksum executable instead
    #[arg(long)]
    pub external: Option<PathBuf>,

    /// Start value
    #[arg(long, default_value = "0")]
    pub start: u32,

    /// Data as hex
    #[arg(long, conflicts_with = "input")]
    pub hex: Option<String>,

    /// Read the data from a file
    #[arg(short, long)]
    pub input: Option<String>,

    /// Compare against this checksum (hex) instead of printing it
    #[arg(long)]
    pub expect: Option<String>,
}

pub fn execute(args: &ChecksumArgs) -> Result<()> {
    let slot = build_slot(args)?;
    let data = match (&args.hex, &args.input) {
        (Some(text), _) => parse_hex(text)?,
        (None, Some(path)) => {
            fs::read(path).with_context(|| format!("Failed to read input file: {}", path))?
        }
        (None, None) => bail!("Give the data with --hex or --input"),
    };
    info!("{} over {} bytes", slot.name(), data.len());

    let computed = slot.compute(&data)?;
    match &args.expect {
        None => println!("{}", hex::encode(&computed)),
        Some(expected) => {
            let expected = parse_hex(expected)?;
            if slot.verify(0, &data, &expected).is_ok() {
                println!("{} {} matches", "✓".green(), hex::encode(&computed));
            } else {
                println!(
                    "{} expected {}, computed {}",
                    "✗".red(),
                    hex::encode(&expected),
                    hex::encode(&computed)
                );
                bail!("Checksum mismatch");
            }
        }
    }
    Ok(())
}

fn build_slot(args: &ChecksumArgs) -> Result<ChecksumSlot> {
    let config = match &args.external {
        Some(path) => ChecksumConfig::external(path, args.start),
        None => ChecksumConfig::new(args.algorithm.into(), args.start),
    };
    config
        .build()
        .with_context(|| "Failed to set up checksum algorithm")
}

/// Checksum of `data` with a built-in algorithm
pub fn compute(algorithm: ChecksumArg, start: u32, data: &[u8]) -> Result<Vec<u8>> {
    let slot = ChecksumConfig::new(algorithm.into(), start).build()?;
    Ok(slot.compute(data)?)
}
