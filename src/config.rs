use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use color_eyre::eyre::Context;

// CLI configuration for minehole.
#[doc(hidden)]
#[derive(Debug, Parser, PartialEq)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to listen on for SSH control connections.
    #[arg(long = "ssh", default_value = "127.0.0.1:2222", value_name = "ADDRESS")]
    pub ssh_listen: SocketAddr,

    /// Address to listen on for Minecraft connections.
    #[arg(
        long = "minecraft",
        default_value = "127.0.0.1:25565",
        value_name = "ADDRESS"
    )]
    pub minecraft_listen: SocketAddr,

    /// File path to the server's SSH host key. If missing, it will be
    /// created for you.
    #[arg(long = "key", value_name = "FILE")]
    pub private_key_file: PathBuf,

    /// Directory containing one YAML record per user.
    #[arg(long = "auth", default_value_os = "users", value_name = "DIRECTORY")]
    pub auth_directory: PathBuf,

    /// Ban clients whose handshake requests a literal IP address instead
    /// of a hostname.
    #[arg(long = "ban-ip", default_value_t = false)]
    pub ban_ip: bool,

    /// How long IP-abuse bans last, in hours.
    #[arg(long = "ban-duration", default_value_t = 48, value_name = "HOURS")]
    pub ban_duration_hours: u64,

    /// Log rejected Minecraft connections.
    #[arg(long = "rejected", default_value_t = false)]
    pub log_rejected: bool,

    /// Comma-separated hostname patterns to allow. When set, handshakes
    /// for any other hostname are rejected.
    #[arg(long, value_delimiter = ',', value_name = "PATTERN")]
    pub whitelist: Option<Vec<String>>,

    /// Comma-separated hostname patterns to reject. A whitelist match
    /// overrides a blacklist match.
    #[arg(long, value_delimiter = ',', value_name = "PATTERN")]
    pub blacklist: Option<Vec<String>>,

    /// How long to wait for existing connections to drain on shutdown.
    #[arg(
        long,
        default_value = "10s",
        value_parser = validate_duration,
        value_name = "DURATION"
    )]
    pub shutdown_grace_period: Duration,
}

fn validate_duration(value: &str) -> color_eyre::Result<Duration> {
    Ok(humantime::Duration::from_str(value)
        .with_context(|| "invalid duration")?
        .into())
}
