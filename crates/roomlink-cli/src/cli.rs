//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the room coordinator
    Serve {
        /// Address to accept relayed connections on
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Join a room and chat from the terminal
    Chat {
        /// Your display name
        #[arg(short, long)]
        name: Option<String>,
        /// Room to join
        #[arg(short, long)]
        room: Option<String>,
        /// Coordinator WebSocket URL
        #[arg(long)]
        coordinator: Option<String>,
        /// Address to accept direct links on
        #[arg(long)]
        direct_listen: Option<String>,
        /// Fixed peer ID (16 hex characters); random if omitted
        #[arg(long)]
        peer_id: Option<String>,
    },
    /// Write a configuration file with default values
    InitConfig {
        /// Destination; defaults to the user config directory
        #[arg(short, long)]
        output: Option<String>,
    },
}
