mod command;
mod logging;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use lanchat_network::{ChatNode, NetworkConfig, NetworkEvent, TypingTarget};

use crate::command::Command;

/// Username from the first argument, then `$LANCHAT_USER`, then `$USER`.
fn resolve_username() -> Result<String> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LANCHAT_USER").ok())
        .or_else(|| std::env::var("USER").ok())
        .filter(|name| !name.trim().is_empty())
        .context("No username given: pass one as an argument or set LANCHAT_USER")
}

fn print_event(event: &NetworkEvent) {
    match event {
        NetworkEvent::PeerDiscovered { name, endpoint } => println!("* {name} joined ({endpoint})"),
        NetworkEvent::PeerDisconnected { name, .. } => println!("* {name} left"),
        NetworkEvent::MessageReceived(msg) => println!(
            "[{}] {}: {}",
            msg.timestamp.format("%H:%M:%S"),
            msg.sender_name,
            msg.content
        ),
        NetworkEvent::TypingStatusReceived { name, is_typing: true } => {
            println!("* {name} is typing...")
        }
        NetworkEvent::TypingStatusReceived { .. } => {}
    }
}

/// Run one command. Returns `false` when the user asked to quit.
async fn execute(node: &ChatNode, command: Command) -> bool {
    let result = match command {
        Command::Empty => Ok(()),
        Command::Quit => return false,
        Command::Broadcast(text) => node.send_broadcast(&text).await.map(|_| ()),
        Command::Private { to, content } => node
            .send_to_peer(&to, &content)
            .await
            .map(|msg| println!("[{}] -> {to}: {}", msg.timestamp.format("%H:%M:%S"), msg.content)),
        Command::Rename(name) => node
            .rename_local_user(&name)
            .await
            .map(|()| println!("* you are now {name}")),
        Command::Peers => {
            let peers = node.list_active_peers();
            if peers.is_empty() {
                println!("* no peers visible");
            } else {
                println!("* peers: {}", peers.join(", "));
            }
            Ok(())
        }
        Command::Typing { on, to } => {
            let target = to.map_or(TypingTarget::Broadcast, TypingTarget::Peer);
            node.send_typing_status(on, target).await
        }
    };
    if let Err(e) = result {
        println!("! {e}");
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = match logging::init_logging() {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {e}");
            None
        }
    };

    let username = resolve_username()?;
    let config = NetworkConfig::load_or_init(&logging::config_path()?);
    let mut node = ChatNode::new(username, config)?;
    let mut events = node.subscribe();
    node.start().await?;

    println!(
        "* {} online on tcp port {}. Type /quit to leave.",
        node.local_username(),
        node.tcp_port().unwrap_or_default()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match command::parse(&line) {
                    Ok(cmd) => {
                        if !execute(&node, cmd).await {
                            break;
                        }
                    }
                    Err(usage) => println!("! {usage}"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Skipped {n} network events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down");
    node.stop().await;
    Ok(())
}
