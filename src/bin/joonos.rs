//! `joonos` CLI: the node agent and certificate authority share one binary,
//! selected by subcommand (§6).

use clap::{Parser, Subcommand};
use joonos::config::{CaConfig, NodeConfig};
use joonos::types::Credential;
use joonos::{authority, codec, csr, installer, node};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "joonos")]
#[command(about = "Fleet certificate authority and node agent over MQTT", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the certificate authority: sign incoming CSRs, publish chains.
    Ca {
        /// Path to the authority's JSON configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run the node agent: bootstrap, renew, and maintain this device's identity.
    Run {
        /// Path to the node's JSON configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Decode and print the installed node certificate.
    CertShow {
        /// Path to the node's JSON configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the node's currently active identity and pending-CSR status.
    StateShow {
        /// Path to the node's JSON configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Connect to the broker with the active credential, wait for one
    /// successful connection, then disconnect. A connectivity probe.
    MqttConnect {
        /// Path to the node's JSON configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print a CSR as PEM on stdout; read a signed chain as PEM from
    /// stdin; install it. For bootstrapping a node across an air gap (S6).
    OfflineProvision {
        /// Path to the node's JSON configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let result = match cli.command {
        Commands::Ca { config } => run_ca(config).await,
        Commands::Run { config } => run_node(config).await,
        Commands::CertShow { config } => cert_show(config),
        Commands::StateShow { config } => state_show(config),
        Commands::MqttConnect { config } => mqtt_connect(config).await,
        Commands::OfflineProvision { config } => offline_provision(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("joonos: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_ca(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = CaConfig::from_file(&config_path)?;
    authority::run(config).await?;
    Ok(())
}

async fn run_node(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::from_file(&config_path)?;
    node::run(config).await?;
    Ok(())
}

fn cert_show(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::from_file(&config_path)?;
    let paths = config.credential_paths();
    let bytes = std::fs::read(&paths.cert)?;
    let cert = codec::decode_pem(&bytes)?
        .into_iter()
        .next()
        .ok_or(joonos::error::CodecError::NotExactlyOne(0))?;

    println!("subject: {}", cert.common_name()?);
    println!("serial:  {}", cert.serial_display()?);
    println!("not before: {}", cert.not_before()?);
    println!("not after:  {}", cert.not_after()?);
    Ok(())
}

fn state_show(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::from_file(&config_path)?;
    let state = node::NodeState::load(config)?;

    println!("node name:       {}", state.node_name);
    println!("active identity: {}", state.active_common_name());
    match &state.node_credential {
        Some(cred) => {
            println!("node credential: present");
            println!("  not after: {}", cred.leaf().not_after()?);
        }
        None => println!("node credential: absent (using provisioning identity)"),
    }
    println!("pending CSR:     {}", state.pending_csr_key.is_some());
    if let Some(err) = &state.load_error {
        println!("load error:      {err}");
    }
    Ok(())
}

async fn mqtt_connect(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::from_file(&config_path)?;
    let state = node::NodeState::load(config)?;
    let params = state.session_params()?;

    let mut supervisor = joonos::mqtt::spawn(params);
    let connected = tokio::time::timeout(std::time::Duration::from_secs(15), supervisor.did_connect.recv()).await;
    match connected {
        Ok(Some(connect)) => {
            println!(
                "connected as {} (provisioning: {})",
                state.active_common_name(),
                connect.is_provisioning
            );
        }
        Ok(None) => println!("supervisor exited before connecting"),
        Err(_) => println!("timed out waiting to connect"),
    }
    let _ = supervisor.stop.send(()).await;
    Ok(())
}

async fn offline_provision(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::from_file(&config_path)?;
    let mut state = node::NodeState::load(config)?;

    let generated = csr::generate(&state.node_name)?;
    let csr_pem = pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", generated.csr_der.clone()));
    print!("{csr_pem}");
    std::io::stdout().flush()?;

    eprintln!("paste the signed certificate chain (PEM), then send EOF:");
    let mut chain_pem = String::new();
    std::io::stdin().read_to_string(&mut chain_pem)?;
    let received = codec::decode_pem(chain_pem.as_bytes())?;

    let pending = joonos::types::PendingCsrKey {
        key: generated.key,
        csr_der: generated.csr_der,
    };
    let paths = state.config.credential_paths();
    let credential: Credential = installer::install(&received, &state.ca_root, Some(pending), &paths).await?;
    state.node_credential = Some(credential);
    state.pending_csr_key = None;

    println!("installed node credential for {}", state.active_common_name());
    Ok(())
}
