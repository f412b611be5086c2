use std::path::Path;

use anyhow::Result;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::broadcast,
};
use tracing::warn;

use crate::{message::ChatMessage, node::Node, transfer::TransferReport};

const MENU: &str = "\nChoose an option:\n1. List available rooms\n2. Join/Create a room\n3. Exit";
const ROOM_PROMPT: &str = "> Enter message (/send-file, /peers, /exit to leave):";

/// Where the user is in the menu flow. Each stdin line is interpreted
/// according to the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prompt {
    Menu,
    RoomName,
    InRoom,
    FilePath,
}

pub async fn run(node: &Node) -> Result<()> {
    write_stdout(&format!(
        "*** you are {} ({})",
        node.nickname(),
        node.local_peer()
    ))
    .await?;
    write_stdout(MENU).await?;

    let mut stdin = BufReader::new(io::stdin()).lines();
    let mut deliveries = node.subscribe_deliveries();
    let mut prompt = Prompt::Menu;

    loop {
        select! {
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match handle_line(node, prompt, line.trim()).await? {
                    Some(next) => prompt = next,
                    None => break,
                }
            }
            delivered = deliveries.recv() => {
                handle_delivery(delivered).await?;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    if node.current_room().await.is_some() {
        let _ = node.leave_room().await;
    }
    write_stdout("*** bye").await?;
    Ok(())
}

/// Returns the next prompt, or `None` when the user asked to exit.
async fn handle_line(node: &Node, prompt: Prompt, line: &str) -> io::Result<Option<Prompt>> {
    let next = match prompt {
        Prompt::Menu => match line {
            "1" => {
                list_rooms(node).await?;
                write_stdout(MENU).await?;
                Prompt::Menu
            }
            "2" => {
                write_stdout("Enter room name to join or create:").await?;
                Prompt::RoomName
            }
            "3" => {
                write_stdout("Exiting...").await?;
                return Ok(None);
            }
            "" => Prompt::Menu,
            _ => {
                write_stderr("!!! invalid choice, enter 1, 2 or 3").await?;
                Prompt::Menu
            }
        },
        Prompt::RoomName => match node.join_room(line).await {
            Ok(room) => {
                write_stdout(&format!("*** joined room {room}")).await?;
                write_stdout(ROOM_PROMPT).await?;
                Prompt::InRoom
            }
            Err(error) => {
                write_stderr(&format!("!!! failed to join room: {error}")).await?;
                write_stdout(MENU).await?;
                Prompt::Menu
            }
        },
        Prompt::InRoom => match line {
            "" => Prompt::InRoom,
            "/exit" => {
                write_stdout("*** leaving the room").await?;
                if let Err(error) = node.leave_room().await {
                    write_stderr(&format!("!!! {error}")).await?;
                }
                write_stdout(MENU).await?;
                Prompt::Menu
            }
            "/send-file" => {
                write_stdout("Enter the file path to upload:").await?;
                Prompt::FilePath
            }
            "/peers" => {
                list_peers(node).await?;
                Prompt::InRoom
            }
            text => {
                if let Err(error) = node.send_message(text).await {
                    write_stderr(&format!("!!! sending message failed: {error}")).await?;
                }
                Prompt::InRoom
            }
        },
        Prompt::FilePath => {
            match node.send_file(Path::new(line)).await {
                Ok(report) => render_report(&report).await?,
                Err(error) => write_stderr(&format!("!!! {error}")).await?,
            }
            write_stdout(ROOM_PROMPT).await?;
            Prompt::InRoom
        }
    };

    Ok(Some(next))
}

async fn handle_delivery(delivered: Result<ChatMessage, broadcast::error::RecvError>) -> io::Result<()> {
    match delivered {
        Ok(message) => write_stdout(&format!("<{}> {}", message.sender_nick, message.text)).await,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            write_stderr(&format!("!!! {skipped} messages skipped")).await
        }
        // The node owns the sender, so this only happens while shutting down.
        Err(broadcast::error::RecvError::Closed) => Ok(()),
    }
}

async fn list_rooms(node: &Node) -> io::Result<()> {
    let rooms = node.available_rooms();
    if rooms.is_empty() {
        return write_stdout("*** no rooms discovered yet").await;
    }
    write_stdout("Discovered rooms:").await?;
    for room in rooms {
        write_stdout(&format!("- {room}")).await?;
    }
    Ok(())
}

async fn list_peers(node: &Node) -> io::Result<()> {
    match node.active_peers().await {
        Ok(peers) => {
            write_stdout(&format!("*** {} peer(s) in this room:", peers.len())).await?;
            for peer in peers {
                let marker = if peer == node.local_peer() { " (you)" } else { "" };
                write_stdout(&format!("- {peer}{marker}")).await?;
            }
            Ok(())
        }
        Err(error) => write_stderr(&format!("!!! {error}")).await,
    }
}

async fn render_report(report: &TransferReport) -> io::Result<()> {
    write_stdout(&format!(
        "*** file {} announced, delivered to {} peer(s)",
        report.file_id,
        report.delivered.len()
    ))
    .await?;
    for (peer, error) in &report.failed {
        write_stderr(&format!("!!! could not send to {peer}: {error}")).await?;
    }
    Ok(())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
