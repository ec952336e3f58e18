use crate::{checksum_table, parse_hex, ChecksumArg};
use anyhow::{bail, Context, Result};
use clap::Args;
use mculink_core::constants::MAX_MAJOR_KEY;
use bytes::Bytes;
use mculink_core::encoder::{encode_frame_struct, encode_packet_markers, FrameBuilder};
use mculink_core::payload::PayloadEncoding;
use std::fs;
use tracing::info;

/// Options for `mculink encode`
#[derive(Debug, Clone, Args)]
pub struct EncodeArgs {
    /// Major key (0-63)
    #[arg(long)]
    pub major: u8,

    /// Minor key
    #[arg(long, default_value = "0")]
    pub minor: u8,

    /// Payload as hex, e.g. 0102ff
    #[arg(long, conflicts_with = "input")]
    pub hex: Option<String>,

    /// Read the payload from a file
    #[arg(short, long)]
    pub input: Option<String>,

    /// Output file for the encoded frames; hex on stdout when absent
    #[arg(short, long)]
    pub output: Option<String>,

    /// Checksum algorithm for the major key
    #[arg(long, value_enum, default_value = "crc8")]
    pub checksum: ChecksumArg,

    /// Checksum start value
    #[arg(long, default_value = "0")]
    pub start: u32,

    /// Largest payload per frame (0 = one frame)
    #[arg(long, default_value = "0")]
    pub chunk_size: usize,

    /// Wrap the frames in packet start/end markers
    #[arg(long)]
    pub packeted: bool,

    /// Treat the payload as text numbers in this base (2, 8, 10 or 16)
    #[arg(long)]
    pub base: Option<u32>,

    /// Separator characters between text numbers
    #[arg(long, default_value = " ")]
    pub separators: String,
}

impl EncodeArgs {
    /// Raw hex payload for `major`/`minor`, everything else default
    pub fn new(major: u8, minor: u8, hex: &str) -> Self {
        Self {
            major,
            minor,
            hex: Some(hex.to_string()),
            input: None,
            output: None,
            checksum: ChecksumArg::Crc8,
            start: 0,
            chunk_size: 0,
            packeted: false,
            base: None,
            separators: " ".to_string(),
        }
    }
}

pub fn execute(args: &EncodeArgs) -> Result<()> {
    let encoded = encode_frames(args)?;

    match &args.output {
        Some(output) => {
            fs::write(output, &encoded)
                .with_context(|| format!("Failed to write output file: {}", output))?;
            info!("Wrote {} bytes to {}", encoded.len(), output);
        }
        None => println!("{}", hex::encode(&encoded)),
    }
    Ok(())
}

/// Encode the payload described by `args` into consecutive frames
pub fn encode_frames(args: &EncodeArgs) -> Result<Vec<u8>> {
    if args.major > MAX_MAJOR_KEY {
        bail!("Major key {} exceeds {}", args.major, MAX_MAJOR_KEY);
    }

    let source = match (&args.hex, &args.input) {
        (Some(text), None) => parse_hex(text)?,
        (None, Some(path)) => {
            fs::read(path).with_context(|| format!("Failed to read input file: {}", path))?
        }
        (None, None) => Vec::new(),
        (Some(_), Some(_)) => bail!("Give either --hex or --input, not both"),
    };

    let encoding = match args.base {
        Some(base) => PayloadEncoding::text(base, args.separators.clone()),
        None => PayloadEncoding::raw(),
    };
    let data = encoding
        .encode(&source)
        .with_context(|| "Failed to convert payload")?;

    let table = checksum_table(args.major, args.checksum, args.start)?;

    let pieces: Vec<&[u8]> = if data.is_empty() || args.chunk_size == 0 {
        vec![data.as_slice()]
    } else {
        data.chunks(args.chunk_size).collect()
    };

    let mut out = Vec::new();
    let markers = if args.packeted {
        let total = u32::try_from(data.len()).context("Payload too large for a packet header")?;
        Some(encode_packet_markers(args.major, args.minor, total, &table)?)
    } else {
        None
    };

    if let Some((start, _)) = &markers {
        out.extend_from_slice(start);
    }
    for piece in &pieces {
        let frame = FrameBuilder::new(args.major)
            .minor(args.minor)
            .payload(Bytes::copy_from_slice(piece))
            .build_struct()?;
        let encoded = encode_frame_struct(&frame, &table)
            .with_context(|| format!("Failed to encode {} payload bytes", piece.len()))?;
        out.extend_from_slice(&encoded);
    }
    if let Some((_, end)) = &markers {
        out.extend_from_slice(end);
    }

    info!(
        "Encoded {} payload bytes into {} frame(s) ({} bytes)",
        data.len(),
        pieces.len() + if args.packeted { 2 } else { 0 },
        out.len()
    );
    Ok(out)
}
