//! Node agent daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use node_agent::{Agent, AgentConfig, AgentOptions, FileCrypto, plugins};
use node_agent_core::{Crypto, ServerProperties};
use node_agent_transport::{HttpTransport, Transport};
use tracing::info;

fn print_version() {
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
}

fn print_help(program: &str) {
    print_version();
    println!("Usage: {program} [OPTIONS] [register]");
    println!();
    println!("Commands:");
    println!("  register         Register this node with the manager and exit");
    println!();
    println!("Options:");
    println!("  -h, --help       Display this information");
    println!("  -V, --version    Display the program's version number");
    println!();
    println!("Environment variables:");
    println!("  MANAGER_URL      Agent endpoint on the manager (required)");
    println!("  TLS_VERIFY       Verify the manager certificate (default: true)");
    println!("  CA_FILE          Extra PEM root certificate");
    println!("  CERT_FILE        Client certificate (default: CONFIG_DIR/self.crt)");
    println!("  KEY_FILE         Client key (default: CONFIG_DIR/private.pem)");
    println!("  CONFIG_DIR       Key and certificate directory (default: /var/lib/node-agent)");
    println!("  SERVER_ADDRESS   Address reported on registration");
    println!("  RUST_LOG         Log filter (default: node_agent=info)");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map_or("node-agent", String::as_str);
    let mut register = false;
    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "-V" | "--version" => {
                print_version();
                return Ok(());
            }
            "-h" | "--help" => {
                print_help(program);
                return Ok(());
            }
            "register" => register = true,
            _ => {
                eprintln!("Unknown option: {arg}");
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "node_agent=info".to_string()),
        ))
        .init();

    let config = AgentConfig::from_env().context("Failed to load configuration")?;
    info!(manager = %config.manager_url, "Configuration loaded");

    let crypto = FileCrypto::new(&config.config_dir);
    let mut http_config = config.http_config(crypto.identity());
    if http_config.ca_file.is_none() {
        http_config.ca_file = crypto.authority_file();
    }
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(&http_config).context("Failed to create HTTP client")?);

    let server = ServerProperties::detect();
    let options = AgentOptions {
        writer: config.writer_config(),
        reader_retry: config.reader_retry,
        capabilities: Vec::new(),
    };
    let crypto: Arc<dyn Crypto> = Arc::new(crypto);
    let agent = Agent::new(transport, plugins::builtin(), crypto, server, options);

    if register {
        let response = agent
            .register(config.server_address.clone())
            .await
            .context("Registration failed")?;
        info!(response = ?response, "Registered");
        return Ok(());
    }

    agent.start();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    agent.stop();
    agent.join().await;
    Ok(())
}
