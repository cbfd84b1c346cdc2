use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::config::{DEFAULT_CAPACITY, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server.
    Server(ServerArgs),
    /// Connect to a relay and exchange messages through stdin/stdout.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// TCP port to listen on.
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Local address to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Maximum number of connected clients.
    #[arg(long, default_value_t = DEFAULT_CAPACITY, value_parser = parse_capacity)]
    pub capacity: usize,

    /// Time allowed for a new client to complete the greeting.
    #[arg(long, default_value_t = 5_000)]
    pub handshake_timeout_ms: u64,

    /// Time allowed for a single write to a peer during broadcast.
    #[arg(long, default_value_t = 1_000)]
    pub write_timeout_ms: u64,

    /// Time shutdown waits for connection tasks to finish.
    #[arg(long, default_value_t = 2_000)]
    pub drain_timeout_ms: u64,
}

impl ServerArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            capacity: self.capacity,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host name or IP address of the relay.
    pub host: String,

    /// Port the relay listens on.
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Send "message <n>" every interval instead of reading stdin.
    #[arg(long)]
    pub interval_ms: Option<u64>,
}

fn parse_capacity(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("capacity must be at least 1".to_string()),
        Ok(capacity) => Ok(capacity),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let cli = Cli::try_parse_from(["broadcast-relay", "server", "5000"]).expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };

        assert_eq!(
            args.listen_addr(),
            "0.0.0.0:5000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(args.relay_config(), RelayConfig::default());
    }

    #[test]
    fn server_rejects_port_zero_and_garbage() {
        assert!(Cli::try_parse_from(["broadcast-relay", "server", "0"]).is_err());
        assert!(Cli::try_parse_from(["broadcast-relay", "server", "http"]).is_err());
        assert!(Cli::try_parse_from(["broadcast-relay", "server"]).is_err());
    }

    #[test]
    fn server_rejects_zero_capacity() {
        let result = Cli::try_parse_from(["broadcast-relay", "server", "5000", "--capacity", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn client_takes_host_and_port() {
        let cli = Cli::try_parse_from([
            "broadcast-relay",
            "client",
            "127.0.0.1",
            "5000",
            "--interval-ms",
            "250",
        ])
        .expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };

        assert_eq!(args.host, "127.0.0.1");
        assert_eq!(args.port, 5000);
        assert_eq!(args.interval_ms, Some(250));
    }
}
