use anyhow::Result;
use clap::{Parser, Subcommand};
use mculink_cli::{commands, ChecksumArg, LinkArgs};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "mculink")]
#[command(about = "mculink - Framed links to microcontrollers", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a payload into frames
    Encode(commands::encode::EncodeArgs),

    /// Decode a file of frames
    Decode {
        /// Input file (`-` for stdin)
        #[arg(short, long)]
        input: String,

        /// Output JSON file for decoded frames
        #[arg(short, long)]
        output: Option<String>,

        /// Checksum used by every frame
        #[arg(long, value_enum, default_value = "crc8")]
        checksum: ChecksumArg,

        /// Checksum start value
        #[arg(long, default_value = "0")]
        start: u32,
    },

    /// Compute or check a checksum
    Checksum(commands::checksum::ChecksumArgs),

    /// Send a payload or file to a device
    Send(commands::send::SendArgs),

    /// Print frames arriving from a device
    Listen {
        #[command(flatten)]
        link: LinkArgs,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Emulate a device over TCP
    Emulate(commands::emulate::EmulateArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Execute command
    match cli.command {
        Commands::Encode(args) => commands::encode::execute(&args),

        Commands::Decode {
            input,
            output,
            checksum,
            start,
        } => commands::decode::execute(&input, output.as_deref(), checksum, start),

        Commands::Checksum(args) => commands::checksum::execute(&args),

        Commands::Send(args) => commands::send::execute(&args),

        Commands::Listen { link, seconds } => commands::listen::execute(&link, seconds),

        Commands::Emulate(args) => commands::emulate::execute(&args),
    }
}
