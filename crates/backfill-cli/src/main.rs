mod cli;
mod cmd;
mod daemonize;
mod signal;
mod table;

use std::fs::OpenOptions;
use std::sync::Mutex;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use backfill_core::config::{self, BackfillConfig};

use cli::{Cli, Commands};

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    std::process::exit(1);
}

/// `RUST_LOG` wins over `-v`; `run` logs at info by default.
fn env_filter(verbose: u8, is_run: bool) -> EnvFilter {
    let level = match verbose {
        0 if is_run => "info",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn init_logging(cli: &Cli, config: Option<&BackfillConfig>) {
    let filter = env_filter(cli.verbose, cli.command.is_run());
    let log_file = cli
        .log_file
        .clone()
        .or_else(|| config.and_then(|c| c.log.file.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .unwrap_or_else(|e| fail(format!("cannot open log file '{path}': {e}")));
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
}

fn load_config(cli: &Cli) -> BackfillConfig {
    let Some(source) = config::resolve_config_path(cli.config.as_deref()) else {
        eprintln!("Error: no configuration file found.");
        eprintln!("Searched:");
        for (path, level) in config::default_config_search_paths() {
            eprintln!("  {} ({})", path.display(), level);
        }
        eprintln!();
        eprintln!("Run `rbd-backfill config` to generate a starter config file.");
        std::process::exit(1);
    };
    match config::load_config(source.path()) {
        Ok(c) => c,
        Err(e) => fail(format!("{e} (config: {source})")),
    }
}

fn main() {
    let cli = Cli::parse();

    if let Commands::Config { dest } = &cli.command {
        match cmd::config::run_config_generate(dest.as_deref()) {
            Ok(path) => {
                println!("Config written to: {}", path.display());
                println!("Edit it to point at your cluster directory.");
            }
            Err(e) => fail(e),
        }
        return;
    }

    let config = load_config(&cli);

    match &cli.command {
        Commands::Run { daemon, images, .. } => {
            let images = cmd::run::parse_images(images).unwrap_or_else(|e| fail(e));
            // Before logging and before any thread exists.
            if *daemon {
                if let Err(e) = daemonize::daemonize() {
                    fail(format!("cannot daemonize: {e}"));
                }
            }
            init_logging(&cli, Some(&config));
            signal::install_signal_handlers();
            if let Err(e) = cmd::run::run_daemon(config, images) {
                tracing::error!(error = %e, "backfill daemon failed");
                fail(e);
            }
        }
        Commands::Status { pool, image, json } => {
            init_logging(&cli, Some(&config));
            let result = cmd::open_cluster(&config).and_then(|cluster| {
                cmd::status::run_status(&*cluster, pool.as_deref(), image.as_deref(), *json)
            });
            if let Err(e) = result {
                fail(e);
            }
        }
        Commands::Config { .. } => {}
    }
}
