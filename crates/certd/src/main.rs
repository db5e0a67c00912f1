//! Certd - certificate lifecycle daemon tooling
//!
//! Validates configuration, provisions the self-signed fallback certificate
//! and inspects certificate store entries.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use certd::{store, CertManagerBuilder, CertStore, Certificate};
use certd_config::Config;

/// Certd - TLS certificate lifecycle daemon
#[derive(Parser, Debug)]
#[command(name = "certd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path (KDL, or TOML with a .toml extension)
    #[arg(short = 'c', long = "config", env = "CERTD_CONFIG", global = true)]
    config: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test,
    /// Load or generate the self-signed fallback certificate
    SelfSigned {
        /// Domain the certificate is requested for
        #[arg(long = "domain", default_value = "localhost")]
        domain: String,

        /// Print certificate metadata as JSON
        #[arg(long = "json")]
        json: bool,
    },
    /// Decode a certificate store entry and print its metadata
    Inspect {
        /// Cache key (domain name or the self-signed key)
        key: String,

        /// Print certificate metadata as JSON
        #[arg(long = "json")]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Test => test_config(&config, cli.config.as_deref()),
        Commands::SelfSigned { domain, json } => run_async(self_signed(config, domain, json)),
        Commands::Inspect { key, json } => run_async(inspect(config, key, json)),
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            Config::from_file(path).context("Failed to load configuration file")
        }
        None => {
            info!("No configuration specified, using defaults");
            let config = Config::default();
            config.validate().context("Default configuration is invalid")?;
            Ok(config)
        }
    }
}

fn run_async<F>(future: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(future)
}

/// Test configuration file and exit
fn test_config(config: &Config, config_path: Option<&str>) -> Result<()> {
    info!("Configuration test successful:");
    info!("  - storage backend: {:?}", config.storage.backend);
    info!("  - {} ACME domain(s)", config.domains.len());
    info!(
        "  - renew {} day(s) before expiry",
        config.renewal.renew_before_days
    );
    info!(
        "  - self-signed fallback: {}",
        if config.self_signed.enable { "enabled" } else { "disabled" }
    );

    println!(
        "certd: configuration file {} test is successful",
        config_path.unwrap_or("(defaults)")
    );
    Ok(())
}

async fn self_signed(config: Config, domain: String, json: bool) -> Result<()> {
    let store = store::open(&config.storage)
        .await
        .context("Failed to open certificate store")?;
    let manager = CertManagerBuilder::from_config(&config, store)
        .build()
        .context("Failed to build certificate manager")?;

    if !manager.is_self_signed_allowed(&domain) {
        anyhow::bail!("self-signed certificates are not allowed for '{domain}'");
    }

    let cert = manager
        .self_signed_certificate(&domain)
        .await
        .context("Failed to provision self-signed certificate")?;
    print_certificate(&config.self_signed.cert_key, &cert, json)?;

    manager.shutdown();
    Ok(())
}

async fn inspect(config: Config, key: String, json: bool) -> Result<()> {
    let store = store::open(&config.storage)
        .await
        .context("Failed to open certificate store")?;
    let data = store
        .get(&key)
        .await
        .with_context(|| format!("Failed to read store entry '{key}'"))?;
    let cert = Certificate::from_pem_bundle(&data)
        .with_context(|| format!("Store entry '{key}' is not a valid certificate bundle"))?;
    print_certificate(&key, &cert, json)
}

fn print_certificate(key: &str, cert: &Certificate, json: bool) -> Result<()> {
    let leaf = cert.leaf();

    if json {
        let report = serde_json::json!({
            "key": key,
            "leaf": leaf,
            "chain_length": cert.chain().len(),
            "expired": cert.is_expired(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("key:           {key}");
    println!("serial:        {}", leaf.serial);
    println!("subject:       {}", leaf.subject);
    println!("issuer:        {}", leaf.issuer);
    println!("organizations: {}", leaf.organizations.join(", "));
    println!("not before:    {}", leaf.not_before);
    println!("not after:     {}", leaf.not_after);
    println!("chain length:  {}", cert.chain().len());
    println!(
        "status:        {}",
        if cert.is_expired() { "expired" } else { "valid" }
    );
    Ok(())
}
