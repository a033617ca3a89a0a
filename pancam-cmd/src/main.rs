mod extract;
mod header;

use std::{io::stderr, path::PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use pancam::{ldt::PANCAM_INSTRUMENT_ID, ReassemblerConfig};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reassemble image files from rover downlink .ha logs.
    ///
    /// Logs are processed in the order given and, unless --parallel is used, a
    /// transfer started in one log may be continued in the next. Reassembled files
    /// are named <YYMMDD>_<HHMMSS>_<unit_id>.pci_raw. Files of transfers found to
    /// be missing data when the next transfer starts get a .part suffix.
    Extract {
        /// Directory to write reassembled files to. Created if it does not exist.
        #[arg(short, long, default_value = "IMG_RAW", value_name = "path")]
        output: PathBuf,

        /// Only reassemble transfers for this instrument id.
        #[arg(short, long, default_value_t = PANCAM_INSTRUMENT_ID)]
        instrument: u8,

        /// Process each log independently and in parallel.
        ///
        /// Logs must not share transfers, i.e., unit ids.
        #[arg(long, action)]
        parallel: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: Format,

        /// Input .ha log files.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Decode the image header of reassembled image files.
    Header {
        /// Instrument model name used for browse labels.
        #[arg(short, long, default_value = "FM")]
        model: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: Format,

        /// Reassembled image files.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone)]
pub enum Format {
    Json,
    Text,
}

impl clap::ValueEnum for Format {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Json, Self::Text]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Json => Some(clap::builder::PossibleValue::new("json")),
            Self::Text => Some(clap::builder::PossibleValue::new("text")),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .without_time()
        .with_env_filter(
            EnvFilter::try_from_env("PANCAM_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Extract {
            output,
            instrument,
            parallel,
            format,
            inputs,
        } => {
            if *instrument > 0xf {
                bail!("instrument id must fit in 4 bits; got {instrument}");
            }
            let config = ReassemblerConfig::builder()
                .output_dir(output.clone())
                .instrument_id(*instrument)
                .build();
            extract::extract(inputs, config, *parallel, format)
        }
        Commands::Header {
            model,
            format,
            inputs,
        } => header::header(inputs, model, format),
    }
}
