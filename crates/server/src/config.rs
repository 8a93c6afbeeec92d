//! Command line and configuration.
//!
//! The CLI is parsed once into an immutable [`ServerConfig`]. The one setting
//! that may change while running, the view distance, is owned by the world's
//! view tracker (`World::set_view_distance`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use sandbox_engine::ticker::ClockConfig;
use sandbox_engine::world::WorldConfig;

#[derive(Parser, Debug)]
#[command(name = "sandbox", about = "Tile world sandbox server and thin client")]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Host a world for remote clients.
    Serve {
        #[command(flatten)]
        world: WorldArgs,
        #[arg(long, default_value = "0.0.0.0:25600")]
        bind: SocketAddr,
    },
    /// Run a world in this process with no network.
    Local {
        #[command(flatten)]
        world: WorldArgs,
        /// Stop after this many seconds (runs until Ctrl+C otherwise).
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Mirror a remote world as a thin client.
    Connect {
        #[arg(long, default_value = "127.0.0.1:25600")]
        server: SocketAddr,
        #[arg(long, default_value = "player")]
        name: String,
        /// Chunks to request on each side of the viewer.
        #[arg(long, default_value_t = 2)]
        view_distance: u32,
    },
}

#[derive(Args, Debug, Clone)]
pub struct WorldArgs {
    #[arg(long, default_value = "world")]
    pub world: PathBuf,
    #[arg(long, default_value_t = 20)]
    pub tps: u32,
    #[arg(long, default_value_t = 4)]
    pub view_distance: u32,
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Main ticks between rare ticks.
    #[arg(long, default_value_t = 20)]
    pub rare_interval: u32,
    #[arg(long, default_value_t = 60)]
    pub physics_rate: u32,
    /// Autosave period in seconds; 0 disables autosave.
    #[arg(long, default_value_t = 300)]
    pub autosave_secs: u64,
    /// Open the world even if another process holds its lock.
    #[arg(long)]
    pub ignore_lock: bool,
}

/// Immutable server-side configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub world_dir: PathBuf,
    pub world: WorldConfig,
    pub clocks: ClockConfig,
    pub autosave: Option<Duration>,
    pub ignore_lock: bool,
    pub bind: Option<SocketAddr>,
}

impl ServerConfig {
    /// `bind` is `None` for local mode.
    pub fn from_args(args: &WorldArgs, bind: Option<SocketAddr>) -> Self {
        let tps = args.tps.max(1);
        let world = WorldConfig {
            seed: args.seed,
            ticks_per_second: tps,
            view_distance: args.view_distance,
            ..WorldConfig::default()
        };
        let clocks = ClockConfig {
            ticks_per_second: tps,
            rare_interval: args.rare_interval,
            physics_steps_per_second: args.physics_rate,
            // No renderer ships with this binary, so every mode is headless.
            render_interval: Some(Duration::from_secs(1)),
        };
        Self {
            world_dir: args.world.clone(),
            world,
            clocks,
            autosave: (args.autosave_secs > 0).then(|| Duration::from_secs(args.autosave_secs)),
            ignore_lock: args.ignore_lock,
            bind,
        }
    }
}
