use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Default room the HTTP frontend sits in.
pub const DEFAULT_ROOM: &str = "default-room";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Chat from the terminal: list rooms, join one, talk and share files.
    Chat(NodeArgs),
    /// Join a room and expose it over HTTP for a browser frontend.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// TCP port to listen on for peers. Use 0 to let the OS pick.
    #[arg(long, env = "TALK_PORT", default_value_t = 0)]
    pub port: u16,

    /// Nickname shown next to your messages. Generated when empty.
    #[arg(long, env = "TALK_NICK")]
    pub nick: Option<String>,

    /// Shared string that keeps one group's traffic apart from any other
    /// group on the same network.
    #[arg(long = "same-string", alias = "same_string", env = "TALK_SCOPE")]
    pub scope: String,

    /// Directory incoming files are saved to.
    #[arg(long, env = "TALK_DOWNLOAD_DIR", default_value = ".")]
    pub download_dir: PathBuf,

    /// File every received message is appended to.
    #[arg(long, env = "TALK_LOG_FILE", default_value = "logs.txt")]
    pub log_file: PathBuf,
}

impl NodeArgs {
    pub fn nickname(&self) -> String {
        match self.nick.as_deref().map(str::trim) {
            Some(nick) if !nick.is_empty() => nick.to_string(),
            _ => format!("peer-{}", nanoid::nanoid!(6)),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub node: NodeArgs,

    /// Port the HTTP frontend listens on.
    #[arg(long, env = "TALK_HTTP_PORT", default_value_t = 3001)]
    pub http_port: u16,

    /// Room joined on startup.
    #[arg(long, default_value = DEFAULT_ROOM)]
    pub room: String,

    /// Built frontend served for every path the API does not claim.
    #[arg(long, env = "TALK_FRONTEND_DIR", default_value = "frontend/dist")]
    pub frontend_dir: PathBuf,
}
