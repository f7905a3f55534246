//! CLI client: talks to the daemon over the control socket, spawning it via
//! the ensure-running bootstrap if nothing is listening yet.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use boring_tunnel::daemon::client;
use boring_tunnel::daemon::protocol::Request;
use boring_tunnel::model::{TunnelDesc, TunnelMode};

#[derive(Parser)]
#[command(name = "boring", about = "Open, close and list SSH tunnels through the boring-tunnel daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a named tunnel.
    Open {
        /// Unique name for this tunnel.
        name: String,
        /// Host alias (from ~/.ssh/config) or literal hostname.
        host: String,
        #[arg(long, value_enum, default_value = "local")]
        mode: ModeArg,
        /// Local endpoint: `[host:]port` for `local`/`socks`, or the dial
        /// target for `remote`/`socks-remote`.
        #[arg(long)]
        local: Option<String>,
        /// Remote endpoint: bind spec for `remote`/`socks-remote`, or the
        /// dial target for `local`.
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        identity: Option<String>,
    },
    /// Close a named tunnel.
    Close { name: String },
    /// List every tunnel the daemon currently knows about.
    List,
}

#[derive(Clone, clap::ValueEnum)]
enum ModeArg {
    Local,
    Remote,
    Socks,
    SocksRemote,
}

impl From<ModeArg> for TunnelMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Local => TunnelMode::Local,
            ModeArg::Remote => TunnelMode::Remote,
            ModeArg::Socks => TunnelMode::Socks,
            ModeArg::SocksRemote => TunnelMode::SocksRemote,
        }
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_logging();
    let cli = Cli::parse();

    let request = match cli.command {
        Command::Open { name, host, mode, local, remote, user, identity } => Request::Open {
            tunnel: TunnelDesc {
                name,
                mode: mode.into(),
                local,
                remote,
                host,
                user,
                identity,
            },
        },
        Command::Close { name } => Request::Close { name },
        Command::List => Request::List,
    };

    match client::request(request).await {
        Ok(response) if response.success => {
            if !response.tunnels.is_empty() {
                print_tunnels(&response.tunnels);
            } else {
                println!("ok");
            }
            std::process::ExitCode::SUCCESS
        }
        Ok(response) => {
            eprintln!("error: {}", response.error);
            std::process::ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn print_tunnels(tunnels: &std::collections::HashMap<String, boring_tunnel::forwarding::TunnelSummary>) {
    let mut names: Vec<&String> = tunnels.keys().collect();
    names.sort();
    for name in names {
        let summary = &tunnels[name];
        println!(
            "{:<20} {:<14} {:<10?} {}",
            summary.name, summary.bound_addr, summary.mode, state_label(summary.state)
        );
    }
}

fn state_label(state: boring_tunnel::model::TunnelState) -> &'static str {
    use boring_tunnel::model::TunnelState::*;
    match state {
        Pending => "pending",
        Connecting => "connecting",
        Open => "open",
        Closing => "closing",
        Closed => "closed",
        Failed => "failed",
    }
}
