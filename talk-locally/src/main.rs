use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use clap::Parser;
use tracing::info;

use talk_locally::{
    cli::{Cli, Command},
    console, http,
    node::Node,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stderr keeps log lines out of the chat on stdout.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            let node = Node::start(&args).await?;
            console::run(&node).await?;
        }
        Command::Serve(args) => {
            let node = Arc::new(Node::start(&args.node).await?);
            let room = node.join_room(&args.room).await?;
            info!(%room, "joined room");

            let addr = SocketAddr::from(([0, 0, 0, 0], args.http_port));
            http::serve(node, addr, &args.frontend_dir).await?;
        }
    }

    Ok(())
}
