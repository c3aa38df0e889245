//! Command handlers for the Roomlink CLI

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use roomlink_core::{PeerId, Priority, RoomId, SystemTimeSource};
use roomlink_runtime::{
    AppEvent, AppEventReceiver, ClientBuilder, ClientHandle, CoordinatorServer, HealthMonitor,
    MemoryHistory, RoomCoordinator, TcpDirectTransport, WebSocketRelay,
};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, mut config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Serve { listen } => {
                if let Some(listen) = listen {
                    config.server.listen = listen;
                }
                Self::handle_serve_command(config).await
            }
            Commands::Chat {
                name,
                room,
                coordinator,
                direct_listen,
                peer_id,
            } => {
                let client = &mut config.client;
                if let Some(name) = name {
                    client.display_name = name;
                }
                if let Some(room) = room {
                    client.room = room;
                }
                if let Some(coordinator) = coordinator {
                    client.coordinator_url = coordinator;
                }
                if let Some(direct_listen) = direct_listen {
                    client.direct_listen = direct_listen;
                }
                if peer_id.is_some() {
                    client.peer_id = peer_id;
                }
                config.validate()?;
                Self::handle_chat_command(config).await
            }
            Commands::InitConfig { output } => {
                let path = match output {
                    Some(path) => PathBuf::from(path),
                    None => AppConfig::default_config_path()?,
                };
                config.save_to_file(&path)?;
                println!("Wrote configuration to {}", path.display());
                Ok(())
            }
        }
    }

    /// Run the coordinator until Ctrl+C
    async fn handle_serve_command(config: AppConfig) -> Result<()> {
        let coordinator = Arc::new(RoomCoordinator::new(
            config.core.coordinator.clone(),
            Arc::new(SystemTimeSource::new()),
        ));
        let server = CoordinatorServer::bind(&config.server.listen, coordinator.clone()).await?;
        info!("Room coordinator ready on ws://{}", server.local_addr()?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = config
            .server
            .health_monitor
            .then(|| HealthMonitor::new(coordinator, config.core.health.clone()).spawn(shutdown_rx.clone()));
        let server_task = tokio::spawn(server.run(shutdown_rx));

        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
        let _ = shutdown_tx.send(true);
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
        match server_task.await {
            Ok(result) => result?,
            Err(e) => warn!("Server task ended abnormally: {}", e),
        }
        Ok(())
    }

    /// Join the configured room and chat line by line on stdin
    async fn handle_chat_command(config: AppConfig) -> Result<()> {
        let peer_id = config.peer_id()?;
        let room = RoomId::new(config.client.room.as_str())?;
        let (transport, incoming) = TcpDirectTransport::bind(&config.client.direct_listen).await?;

        let (handle, events) = ClientBuilder::new(peer_id)
            .with_config(config.core.clone())
            .with_relay(Arc::new(WebSocketRelay::new(config.client.coordinator_url.as_str())))
            .with_transport(Arc::new(transport), incoming)
            .with_history(Arc::new(MemoryHistory::new(config.client.history_size)))
            .spawn()?;
        info!("Peer {} connecting to {}", peer_id, config.client.coordinator_url);
        println!("You are {} ({}). Type /help for commands.", config.client.display_name, peer_id);

        let printer = tokio::spawn(print_events(events));
        let joined = join_when_ready(&handle, room, &config.client.display_name).await;
        if let Err(e) = &joined {
            println!("! could not join: {e}");
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            match Self::handle_line(&handle, line.trim()).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => println!("! {e}"),
            }
        }

        handle.shutdown().await;
        printer.abort();
        Ok(())
    }

    /// Apply one line of input; false means quit
    async fn handle_line(handle: &ClientHandle, line: &str) -> Result<bool> {
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "" => {}
            "/quit" | "/exit" => return Ok(false),
            "/help" => println!(
                "/join <room> <name>  /leave  /upgrade <peer>  /confirm [name]  /urgent <text>  /health  /quit"
            ),
            "/join" => {
                let (room, name) = rest
                    .split_once(' ')
                    .ok_or_else(|| CliError::Config("usage: /join <room> <name>".to_string()))?;
                let peers = handle.join(RoomId::new(room)?, name).await?;
                println!("* joined {} with {} others", room, peers.len());
            }
            "/leave" => handle.leave()?,
            "/upgrade" => {
                let peer: PeerId = rest.parse()?;
                let opened = handle.upgrade(peer).await?;
                println!(
                    "* direct link to {} {}",
                    peer.short(),
                    if opened { "open" } else { "not available" }
                );
            }
            "/confirm" => {
                let name = (!rest.is_empty()).then(|| rest.to_string());
                handle.confirm_rejoin(name)?;
            }
            "/urgent" => {
                let report = handle.send_with_priority(rest, Priority::Critical).await?;
                println!("* sent {} over {:?}", report.message_id, report.routes);
            }
            "/health" => {
                let snapshot = handle.health_snapshot().await?;
                println!(
                    "* {:?}; relay {:?} rtt {:?}; {} links; {} queued",
                    snapshot.signal,
                    snapshot.relay,
                    snapshot.relay_rtt,
                    snapshot.links.len(),
                    snapshot.queued
                );
                for link in snapshot.links {
                    println!("    {} {:?} {:?}", link.peer_id.short(), link.state, link.condition);
                }
                println!("    {:?}", snapshot.stats);
            }
            _ if command.starts_with('/') => println!("! unknown command {command}"),
            _ => {
                handle.send(line).await?;
            }
        }
        Ok(true)
    }
}

/// Retry the initial join until the relayed channel is up
async fn join_when_ready(handle: &ClientHandle, room: RoomId, name: &str) -> Result<()> {
    let mut attempts = 0;
    loop {
        match handle.join(room.clone(), name).await {
            Ok(peers) => {
                println!("* joined {} with {} others", room, peers.len());
                return Ok(());
            }
            Err(roomlink_core::RoomlinkError::CoordinatorUnreachable { .. }) if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn print_events(mut events: AppEventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::Joined { room_id, peers } => {
                let names: Vec<&str> = peers.iter().map(|p| p.display_name.as_str()).collect();
                println!("* in {}: {}", room_id, names.join(", "));
            }
            AppEvent::PeerJoined { display_name, .. } => println!("* {display_name} joined"),
            AppEvent::PeerLeft {
                display_name,
                reason,
                ..
            } => println!("* {display_name} left ({reason})"),
            AppEvent::RejoinConfirmationRequired {
                room_id,
                display_name,
                gap,
            } => println!(
                "* back after {}s; /confirm to rejoin {} as {}",
                gap.as_secs(),
                room_id,
                display_name
            ),
            AppEvent::MessageReceived { message, path } => {
                println!("<{}> {}  [{:?}]", message.display_name, message.content, path)
            }
            AppEvent::MessageDelivered { message_id, .. } => {
                tracing::debug!("Delivered {}", message_id)
            }
            AppEvent::MessageFailed { message_id, reason } => {
                println!("! message {message_id} not delivered: {reason}")
            }
            AppEvent::HistoryReplayed { messages, .. } => {
                for message in messages {
                    println!("  <{}> {}", message.display_name, message.content);
                }
            }
            AppEvent::ConnectionQualityChanged {
                peer_id,
                tier,
                score,
                degraded,
            } => info!(
                "Link to {} now {:?} ({}){}",
                peer_id.short(),
                tier,
                score,
                if degraded { ", degraded" } else { "" }
            ),
            AppEvent::HealthChanged { signal } => println!("* connection {signal:?}"),
            AppEvent::CoordinatorUnreachable { attempts } => {
                println!("! coordinator unreachable after {attempts} attempts, still retrying")
            }
        }
    }
}
