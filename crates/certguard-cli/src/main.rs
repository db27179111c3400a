mod config;

use certguard::{
    BlacklistSlot, CertVerifyResult, Certificate, GuardError, HttpRevocationFetcher,
    MemoryRevocationCache, RustlsCertVerifier, UnknownRootObserver, VerificationPipeline,
    VerifyParams, X509CertificateStore,
};
use clap::{Parser, Subcommand};
use config::{ConfigError, GuardConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use x509_parser::pem::Pem;

/// certguard - certificate verification with pinning, blacklisting and revocation prefetch
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "certguard")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "CONFIG", default_value = "certguard.json")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a PEM certificate chain (leaf first) for a host
    Verify {
        /// Hostname the chain is presented for
        host: String,

        /// PEM file holding the presented chain
        chain: PathBuf,

        /// Skip revocation augmentation for this run
        #[arg(long)]
        no_augment: bool,
    },

    /// Validate configuration and exit
    Validate,

    /// Write an example configuration to the config path
    ExampleConfig,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("IO error reading {0}: {1}")]
    Io(String, std::io::Error),
    #[error("Invalid PEM in {0}: {1}")]
    Pem(String, String),
    #[error("No certificates found in {0}")]
    EmptyChain(String),
}

/// Logs chains that verify against a private anchor
struct LogUnknownRoot;

impl UnknownRootObserver for LogUnknownRoot {
    fn on_unknown_root(&self, hostname: &str, result: &CertVerifyResult) {
        let root = result
            .verified_chain
            .last()
            .map(|c| c.subject().to_string())
            .unwrap_or_default();
        info!(host = hostname, root = %root, "Chain verified against a non-public root");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Command::ExampleConfig = cli.command {
        init_tracing("info");
        if let Err(e) = GuardConfig::example().to_file(&cli.config) {
            error!("Error creating example config: {}", e);
            process::exit(1);
        }
        info!("Wrote example configuration to {}", cli.config);
        process::exit(0);
    }

    let config = match GuardConfig::from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error in {}: {}", cli.config, e);
            process::exit(2);
        }
    };

    if let Command::Validate = cli.command {
        println!("Configuration validated successfully");
        println!("  Augmentation: {}", if config.revocation.enabled { "enabled" } else { "disabled" });
        println!("  Fetcher exceptions: {}", config.revocation.fetcher_exceptions.len());
        println!("  Pins: {}", config.pins.len());
        println!("  Trust anchors: {}", config.trust_anchor_paths.len());
        println!("  Public roots: {}", config.use_public_roots);
        if let Some(ref path) = config.blacklist_path {
            println!("  Blacklist: {}", path);
        }
        process::exit(0);
    }

    init_tracing(config.log_level.as_deref().unwrap_or("info"));

    let Command::Verify {
        host,
        chain,
        no_augment,
    } = cli.command
    else {
        return;
    };

    match verify(&config, &host, &chain, no_augment).await {
        Ok(true) => process::exit(0),
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn verify(config: &GuardConfig, host: &str, chain_path: &Path, no_augment: bool) -> Result<bool, CliError> {
    let chain = read_pem_certificates(chain_path)?
        .iter()
        .map(|der| Certificate::from_der(der).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;

    let mut anchor_ders = Vec::new();
    for path in &config.trust_anchor_paths {
        anchor_ders.extend(read_pem_certificates(Path::new(path))?);
    }

    let verifier = if anchor_ders.is_empty() {
        RustlsCertVerifier::with_public_roots()
    } else {
        RustlsCertVerifier::from_anchor_ders(&anchor_ders, config.use_public_roots)?
    };
    info!(roots = verifier.root_count(), "Loaded trust roots");

    let blacklist = match config.load_blacklist()? {
        Some(snapshot) => {
            info!(version = snapshot.version(), entries = snapshot.len(), "Loaded SPKI blacklist");
            BlacklistSlot::with_snapshot(Arc::new(snapshot))
        }
        None => BlacklistSlot::new(),
    };

    let mut augment = config.revocation.clone();
    if no_augment {
        augment.enabled = false;
    }

    let store = X509CertificateStore::from_anchor_ders(&anchor_ders)?
        .with_trust_anchors(verifier.trust_anchors());
    let cache = Arc::new(MemoryRevocationCache::from_config(&augment));
    let pipeline = VerificationPipeline::new(
        &augment,
        Arc::new(verifier),
        Arc::new(store),
        cache.clone(),
        Arc::new(blacklist),
    )?
    .with_pins(config.pin_store()?)
    .with_observer(Arc::new(LogUnknownRoot));

    let fetcher = HttpRevocationFetcher::new(&augment)?
        .with_cache(cache)
        .offline(config.offline);
    pipeline.install_fetcher(Arc::new(fetcher));

    info!(host, certificates = chain.len(), "Verifying certificate chain");
    let outcome = pipeline.verify(VerifyParams::new(host, chain)).await;
    pipeline.shutdown_fetcher();

    match outcome {
        Ok(result) => {
            println!("OK {}", host);
            print_chain(&result);
            Ok(true)
        }
        Err(e) => {
            warn!(host, error = %e.error, "Verification failed");
            println!("FAILED {}: {}", host, e.error);
            print_chain(&e.result);
            Ok(false)
        }
    }
}

fn print_chain(result: &CertVerifyResult) {
    for (cert, hash) in result.verified_chain.iter().zip(&result.public_key_hashes) {
        println!("  {} spki-sha256={}", cert.subject(), hash);
    }
    println!("  status=0x{:08x} known_root={}", result.cert_status.bits(), result.is_issued_by_known_root);
}

fn read_pem_certificates(path: &Path) -> Result<Vec<Vec<u8>>, CliError> {
    let display = path.display().to_string();
    let data = fs::read(path).map_err(|e| CliError::Io(display.clone(), e))?;

    let mut ders = Vec::new();
    for pem in Pem::iter_from_buffer(&data) {
        let pem = pem.map_err(|e| CliError::Pem(display.clone(), e.to_string()))?;
        if pem.label == "CERTIFICATE" {
            ders.push(pem.contents);
        }
    }

    if ders.is_empty() {
        return Err(CliError::EmptyChain(display));
    }
    Ok(ders)
}
