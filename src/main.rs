//! Fan wall operator CLI
//!
//! Thin command front-end over the library: loads a wall config,
//! connects every board, applies one command, reports statistics and
//! disconnects.
//!
//! ```text
//! fanwall <wall.yaml> set <percent>   # uniform speed on every board
//! fanwall <wall.yaml> stop            # stop every fan
//! fanwall <wall.yaml> status          # connect and dump board status
//! ```

use anyhow::{Context, Result};
use tracing::{error, info};

use fanwall::{BatchController, WallConfig};

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn usage() -> ! {
    eprintln!("usage: fanwall <wall.yaml> <set <percent> | stop | status>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, command) = match args.as_slice() {
        [path, rest @ ..] if !rest.is_empty() => (path.clone(), rest.to_vec()),
        _ => usage(),
    };

    let config = match WallConfig::load_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load {config_path}: {e:#}");
            std::process::exit(1);
        }
    };
    let max_workers = config.max_workers;

    let mut wall = BatchController::new(config.board_configs())?;
    let connected = wall.connect_all(max_workers).await;
    let online = connected.values().filter(|ok| **ok).count();
    info!(online, total = wall.board_count(), "wall connected");

    match command.as_slice() {
        [cmd, percent] if cmd == "set" => {
            let percent: f64 = percent
                .parse()
                .with_context(|| format!("invalid percentage: {percent}"))?;
            let results = wall.set_all_boards_speed(percent, max_workers).await;
            report_results(&results);
        }
        [cmd] if cmd == "stop" => {
            let results = wall.stop_all_boards(max_workers).await;
            report_results(&results);
        }
        [cmd] if cmd == "status" => {
            let statuses = wall.all_status().await;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        _ => usage(),
    }

    info!("batch statistics: {}", wall.statistics());
    wall.disconnect_all().await;
    Ok(())
}

fn report_results(results: &std::collections::BTreeMap<usize, bool>) {
    let failed: Vec<usize> = results
        .iter()
        .filter(|(_, ok)| !**ok)
        .map(|(id, _)| *id)
        .collect();
    if failed.is_empty() {
        info!(boards = results.len(), "command applied on every board");
    } else {
        error!(
            total = results.len(),
            failed = ?failed,
            "command failed on some boards"
        );
    }
}
