//! Multi-tenant SFTP gateway with delegated password authentication

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tenant_sftp::auth::{FixedAccount, FixedAuthority, HttpAuthority, HttpAuthorityConfig};
use tenant_sftp::{DirectoryRegistry, Server, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tenant-sftp")]
#[command(about = "Multi-tenant SFTP gateway", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "SFTP_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: String,

    /// Port to listen on
    #[arg(short, long, env = "SFTP_PORT", default_value = "2022")]
    port: u16,

    /// Directory holding one sub-directory per tenant and the host key
    #[arg(long, env = "SFTP_BASE_PATH")]
    base_path: PathBuf,

    /// Refuse all writes, whatever the authority grants
    #[arg(long, env = "SFTP_READ_ONLY")]
    read_only: bool,

    /// Close connections idle for this many seconds (0 disables)
    #[arg(long, env = "SFTP_IDLE_TIMEOUT_SECS", default_value = "0")]
    idle_timeout_secs: u64,

    #[command(subcommand)]
    authority: AuthorityCommand,
}

#[derive(Subcommand)]
enum AuthorityCommand {
    /// Validate credentials against a remote panel over HTTP
    Panel {
        /// Base URL of the panel
        #[arg(long, env = "SFTP_PANEL_URL")]
        url: String,

        /// Bearer token presented to the panel
        #[arg(long, env = "SFTP_PANEL_TOKEN", hide_env_values = true)]
        token: String,

        /// Request timeout in seconds
        #[arg(long, default_value = "10")]
        timeout_secs: u64,
    },
    /// Validate credentials against a fixed account list (development)
    Static {
        /// Account as user:password:tenant[:perm+perm], can be repeated.
        /// Write a ':' in the password as '\:'
        #[arg(long = "account", required = true)]
        accounts: Vec<FixedAccount>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tenant_sftp=info")),
        )
        .init();

    let mut config = ServerConfig::new()
        .bind_address(cli.bind_address)
        .port(cli.port)
        .base_path(&cli.base_path)
        .read_only(cli.read_only);
    if cli.idle_timeout_secs > 0 {
        config = config.idle_timeout(Duration::from_secs(cli.idle_timeout_secs));
    }

    let registry = DirectoryRegistry::new(&cli.base_path);

    let server = match cli.authority {
        AuthorityCommand::Panel {
            url,
            token,
            timeout_secs,
        } => {
            let authority = HttpAuthority::new(HttpAuthorityConfig {
                url,
                token,
                timeout: Duration::from_secs(timeout_secs),
            })?;
            info!(endpoint = %authority.endpoint(), "Delegating authentication to panel");
            Server::new(authority, registry)
        }
        AuthorityCommand::Static { accounts } => {
            info!(accounts = accounts.len(), "Using static account list");
            Server::new(FixedAuthority::new(accounts), registry)
        }
    };

    server.config(config).run().await?;
    Ok(())
}
