use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::relay::{EchoPolicy, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Wait for one peer and take turns talking, receiving first.
    Listen(ListenArgs),
    /// Connect to a listening peer and take turns talking, sending first.
    Connect(ConnectArgs),
    /// Run the broadcast relay. Lines typed on stdin go out as `[Server]`.
    Relay(RelayArgs),
    /// Join a relay as a participant.
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ListenArgs {
    /// Socket address to accept the peer on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:9000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Address of the listening peer.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub server: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:9000")]
    pub listen: SocketAddr,

    /// Don't echo a client's messages back to it.
    #[arg(long)]
    pub exclude_sender: bool,
}

impl RelayArgs {
    pub fn config(&self) -> RelayConfig {
        let echo = if self.exclude_sender {
            EchoPolicy::ExcludeSender
        } else {
            EchoPolicy::IncludeSender
        };
        RelayConfig { echo }
    }
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    /// Address of the relay to join.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub server: SocketAddr,
}
