//! `PhiVault` CLI tool for key management and field operations.
//!
//! Usage:
//!   phivault keygen             - Create a key directory and an index key
//!   phivault seal <plaintext>   - Seal a value, print the encrypted field as JSON
//!   phivault open               - Open a sealed value
//!   phivault reseal             - Re-seal a value under the current master key
//!   phivault index <value>      - Compute a blind index tag
//!
//! Log output goes to stderr and is controlled with `RUST_LOG`.

#![warn(clippy::pedantic, clippy::nursery)]

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Args, Parser, Subcommand, ValueEnum};
use phivault::config::ENV_INDEX_KEY;
use phivault::prelude::*;
use phivault_key_file::FileKeyGateway;
use phivault_kms_aws::AwsKmsGateway;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "phivault")]
#[command(about = "PhiVault key management and field encryption CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a key directory with a fresh master key and print a new index key
    Keygen {
        /// Output directory for keys
        #[arg(short, long, default_value = "./keys")]
        output: PathBuf,
    },
    /// Seal a value under a fresh data key
    Seal {
        #[command(flatten)]
        gateway: GatewayArgs,
        /// Value to seal
        plaintext: String,
    },
    /// Open a sealed value
    Open {
        #[command(flatten)]
        gateway: GatewayArgs,
        #[command(flatten)]
        sealed: SealedArgs,
    },
    /// Re-seal a value under the current master key
    Reseal {
        #[command(flatten)]
        gateway: GatewayArgs,
        #[command(flatten)]
        sealed: SealedArgs,
    },
    /// Compute the blind index tag of a value using FINDING_INDEX_KEY_BASE64
    Index {
        /// Normalization applied before hashing
        #[arg(long, value_enum, default_value_t = NormalizationArg::Verbatim)]
        normalization: NormalizationArg,
        /// Value to index
        value: String,
    },
}

#[derive(Args)]
struct GatewayArgs {
    /// Key-wrapping backend
    #[arg(long, value_enum, default_value_t = Backend::File)]
    backend: Backend,
    /// Key directory for the file backend
    #[arg(short, long, default_value = "./keys")]
    keys: PathBuf,
    /// Master key id (file backend: newest key; aws backend: AWS_KMS_KEY_ID)
    #[arg(long)]
    master_key: Option<String>,
}

#[derive(Args)]
struct SealedArgs {
    /// Base64 packaged ciphertext
    #[arg(long)]
    ciphertext: String,
    /// Base64 wrapped data key
    #[arg(long)]
    wrapped_key: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    File,
    Aws,
}

#[derive(Clone, Copy, ValueEnum)]
enum NormalizationArg {
    Verbatim,
    Trimmed,
    CaseFolded,
    Email,
}

impl From<NormalizationArg> for Normalization {
    fn from(arg: NormalizationArg) -> Self {
        match arg {
            NormalizationArg::Verbatim => Self::Verbatim,
            NormalizationArg::Trimmed => Self::Trimmed,
            NormalizationArg::CaseFolded => Self::CaseFolded,
            NormalizationArg::Email => Self::Email,
        }
    }
}

enum FieldCommand {
    Seal(String),
    Open(SealedArgs),
    Reseal(SealedArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { output } => keygen(output),
        Commands::Seal { gateway, plaintext } => {
            run_field(gateway, FieldCommand::Seal(plaintext)).await
        }
        Commands::Open { gateway, sealed } => run_field(gateway, FieldCommand::Open(sealed)).await,
        Commands::Reseal { gateway, sealed } => {
            run_field(gateway, FieldCommand::Reseal(sealed)).await
        }
        Commands::Index { normalization, value } => {
            let config = VaultConfig::from_env()?;
            let indexer = BlindIndexer::from_config(&config)?;
            println!("{}", indexer.index_value(&value, normalization.into())?);
            Ok(())
        }
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn keygen(output: PathBuf) -> Result<()> {
    let master_key_id = FileKeyGateway::init(&output)
        .with_context(|| format!("failed to initialize {}", output.display()))?;

    let index_key = generate_index_key();
    let encoded = Zeroizing::new(STANDARD.encode(&index_key[..]));

    println!("Created master key {master_key_id} in {}", output.display());
    println!("{ENV_INDEX_KEY}={}", encoded.as_str());
    Ok(())
}

/// Fresh 32-byte blind index key, wiped when dropped.
fn generate_index_key() -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

async fn run_field(args: GatewayArgs, command: FieldCommand) -> Result<()> {
    let config = VaultConfig::from_env()?;

    match args.backend {
        Backend::File => {
            let gateway = FileKeyGateway::new(&args.keys)?;
            let master_key_id = match args.master_key {
                Some(id) => id,
                None => gateway
                    .master_key_ids()?
                    .pop()
                    .context("no master key found; run `phivault keygen` first")?,
            };
            let service =
                EnvelopeService::new(gateway, master_key_id).with_timeout(config.kms_timeout);
            execute(&service, command).await
        }
        Backend::Aws => {
            let gateway = AwsKmsGateway::from_config(&config).await;
            let master_key_id =
                args.master_key.or_else(|| config.master_key_id.clone()).unwrap_or_default();
            let service =
                EnvelopeService::new(gateway, master_key_id).with_timeout(config.kms_timeout);
            execute(&service, command).await
        }
    }
}

async fn execute<G: KeyWrappingGateway>(
    service: &EnvelopeService<G>,
    command: FieldCommand,
) -> Result<()> {
    match command {
        FieldCommand::Seal(plaintext) => {
            let field = service.seal(&plaintext).await?;
            println!("{}", serde_json::to_string_pretty(&field)?);
        }
        FieldCommand::Open(sealed) => {
            println!("{}", service.open(&sealed.ciphertext, &sealed.wrapped_key).await?);
        }
        FieldCommand::Reseal(sealed) => {
            let field = service.reseal(&sealed.ciphertext, &sealed.wrapped_key).await?;
            println!("{}", serde_json::to_string_pretty(&field)?);
        }
    }
    Ok(())
}
