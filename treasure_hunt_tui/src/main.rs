mod logging;
mod viewer;

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::{SeedableRng, rngs::StdRng};
use tracing::info;
use treasure_hunt_core::client::run_agent;
use treasure_hunt_core::config::{AgentConfig, SessionConfig};
use treasure_hunt_core::engine::GridEngine;
use treasure_hunt_core::server::{Hub, Server, ServerHandle};
use treasure_hunt_core::world::MapCatalog;

use crate::logging::{LogTarget, init_logging};

#[derive(Parser, Debug)]
#[command(version, about = "Cooperative treasure hunt on a shared grid", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the grid engine and watch the session
    Serve(ServeArgs),
    /// Run one agent against a running engine
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long)]
    addr: Option<String>,
    /// Number of agents in the session
    #[arg(short = 'n', long)]
    agents: Option<usize>,
    /// Map catalogue file (the embedded catalogue when omitted)
    #[arg(long, value_name = "MAPS_FILE")]
    maps: Option<PathBuf>,
    /// Map to play, as in `map_<id>`
    #[arg(short, long)]
    map_id: Option<u32>,
    /// Obstacles to place (one per agent by default)
    #[arg(long)]
    obstacles: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// Log to stderr and wait for the session to end instead of drawing it
    #[arg(long)]
    headless: bool,
    /// Log file used while the viewer owns the terminal
    #[arg(long, value_name = "LOG_FILE", default_value = "treasure-hunt.log")]
    log_file: PathBuf,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Engine address
    #[arg(long)]
    addr: Option<String>,
    /// Pause after each move, in milliseconds
    #[arg(long)]
    step_delay_ms: Option<u64>,
    /// Stop after this many moves
    #[arg(long)]
    max_steps: Option<u64>,
    #[arg(long)]
    seed: Option<u64>,
    /// Reply timeout for moves, in milliseconds
    #[arg(long)]
    request_timeout_ms: Option<u64>,
    /// Reply timeout for ownership queries, in milliseconds
    #[arg(long)]
    owner_timeout_ms: Option<u64>,
    /// Minimum distance between exploration waypoints
    #[arg(long)]
    min_separation: Option<f64>,
    /// Give up if the session is not full after this many seconds
    #[arg(long)]
    peer_wait_secs: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args, cli.verbose),
        Command::Agent(args) => agent(args, cli.verbose),
    }
}

fn session_config(args: &ServeArgs) -> Result<SessionConfig> {
    let mut config = SessionConfig::from_env()?;
    if let Some(addr) = &args.addr {
        config = config.with_addr(addr.clone());
    }
    if let Some(agents) = args.agents {
        config = config.with_agents(agents);
    }
    if let Some(maps) = &args.maps {
        config = config.with_maps(maps.clone());
    }
    if let Some(map_id) = args.map_id {
        config = config.with_map_id(map_id);
    }
    if let Some(obstacles) = args.obstacles {
        config = config.with_obstacles(obstacles);
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }
    Ok(config)
}

fn serve(args: ServeArgs, verbose: bool) -> Result<()> {
    if args.headless {
        init_logging(LogTarget::Stderr, verbose)?;
    } else {
        init_logging(LogTarget::File(&args.log_file), verbose)?;
    }
    let config = session_config(&args)?;

    let catalog = match &config.maps {
        Some(path) => MapCatalog::from_file(path)
            .with_context(|| format!("could not load maps from {}", path.display()))?,
        None => MapCatalog::builtin()?,
    };
    let map = catalog.get(config.map_id, config.agents).with_context(|| {
        let known: Vec<&str> = catalog.map_ids().collect();
        format!(
            "map {} cannot host {} agents (catalogue has {})",
            config.map_id,
            config.agents,
            known.join(", ")
        )
    })?;
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let engine = GridEngine::from_map(&map, config.obstacle_count(), &mut rng);
    let server = Server::bind(&config.addr, Hub::new(engine))
        .with_context(|| format!("could not listen on {}", config.addr))?
        .spawn()?;
    info!(addr = %server.local_addr(), agents = config.agents, map = config.map_id, "session open");

    if args.headless {
        wait_for_session_end(&server);
    } else {
        viewer::run(&server)?;
    }
    server.shutdown();
    Ok(())
}

/// Blocks until every agent has completed, or until all agents have come and gone.
fn wait_for_session_end(server: &ServerHandle) {
    let mut seen_agents = false;
    loop {
        let (connected, completed) = server
            .hub()
            .with_engine(|e| (e.connected_count(), e.all_completed()));
        if completed {
            info!("every agent completed its mission");
            return;
        }
        seen_agents |= connected > 0;
        if seen_agents && connected == 0 {
            info!("all agents disconnected");
            return;
        }
        thread::sleep(Duration::from_millis(200));
    }
}

fn agent(args: AgentArgs, verbose: bool) -> Result<()> {
    init_logging(LogTarget::Stderr, verbose)?;
    let mut config = AgentConfig::from_env()?;
    if let Some(addr) = args.addr {
        config = config.with_addr(addr);
    }
    if let Some(ms) = args.step_delay_ms {
        config = config.with_step_delay(Duration::from_millis(ms));
    }
    if let Some(max_steps) = args.max_steps {
        config = config.with_max_steps(max_steps);
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }
    if let Some(ms) = args.request_timeout_ms {
        config = config.with_request_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = args.owner_timeout_ms {
        config = config.with_owner_timeout(Duration::from_millis(ms));
    }
    if let Some(separation) = args.min_separation {
        config = config.with_min_separation(separation);
    }
    if let Some(secs) = args.peer_wait_secs {
        config = config.with_peer_wait_limit(Duration::from_secs(secs));
    }

    let stats = run_agent(&config).with_context(|| format!("agent at {} failed", config.addr))?;
    println!("{stats}");
    Ok(())
}
