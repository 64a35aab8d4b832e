use anyhow::Result;
use clap::{Parser, Subcommand};
use fleet_pose::{
    bus::ZenohBus,
    configuration::AppConfig,
    fleet::FleetRegistry,
    lane_map::{LaneMapLoader, Lanelet2Loader},
    logging,
    map_context::{MapHandle, MapSettings},
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::*;

#[derive(Parser, Debug)]
#[command(version, about = "Fleet pose and routing coordinator")]
struct Args {
    /// path to config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Log as json lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List discovered vehicles
    List,
    /// Print the current pose of every vehicle
    Poses,
    /// Print every vehicle goal known to be active
    Goals,
    /// Route a vehicle to a geodetic goal
    SetGoal {
        id: String,
        #[arg(allow_negative_numbers = true)]
        lat: f64,
        #[arg(allow_negative_numbers = true)]
        lon: f64,
    },
    /// Switch a vehicle to autonomous operation
    Engage { id: String },
    /// Periodically print poses and goals until interrupted
    Watch {
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Load another lane map anchored at a new origin
    SwitchMap {
        path: PathBuf,
        #[arg(allow_negative_numbers = true)]
        lat: f64,
        #[arg(allow_negative_numbers = true)]
        lon: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_tracing(args.verbosity, args.json_logs);

    let app_config = AppConfig::load_config(&args.config)?;

    // zenoh
    let zenoh_config = app_config.zenoh.get_zenoh_config()?;
    let bus = Arc::new(ZenohBus::open(zenoh_config, app_config.fleet.query_timeout()).await?);

    let loader: Arc<dyn LaneMapLoader> = Arc::new(Lanelet2Loader);
    let map = MapHandle::new(app_config.map.clone(), loader)?;
    let registry = FleetRegistry::new(bus, map, app_config.fleet.clone());
    registry.rediscover().await;

    let result = run(&registry, args.command).await;
    registry.shutdown().await;
    result
}

async fn run(registry: &FleetRegistry, command: Command) -> Result<()> {
    match command {
        Command::List => {
            for id in registry.vehicle_ids().await {
                println!("{id}");
            }
        }
        Command::Poses => {
            println!("{}", serde_json::to_string_pretty(&registry.poses().await)?);
        }
        Command::Goals => {
            println!("{}", serde_json::to_string_pretty(&registry.goals().await)?);
        }
        Command::SetGoal { id, lat, lon } => {
            let command = registry.set_goal(&id, lat, lon).await?;
            println!(
                "goal set for {id} at x={:.3} y={:.3} yaw={}",
                command.local.x,
                command.local.y,
                command
                    .heading
                    .yaw()
                    .map(|yaw| format!("{:.1}deg", yaw.to_degrees()))
                    .unwrap_or_else(|| "none".to_owned())
            );
        }
        Command::Engage { id } => {
            registry.engage(&id).await?;
            println!("engaged {id}");
        }
        Command::Watch { interval_ms } => {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let snapshot = serde_json::json!({
                            "poses": registry.poses().await,
                            "goals": registry.goals().await,
                        });
                        println!("{}", serde_json::to_string(&snapshot)?);
                    }
                    _ = &mut ctrl_c => {
                        info!("Stopping watch");
                        break;
                    }
                }
            }
        }
        Command::SwitchMap { path, lat, lon } => {
            registry.switch_map(MapSettings::new(path, lat, lon)).await?;
            println!("switched map");
        }
    }
    Ok(())
}
