use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "rbd-backfill",
    version,
    about = "Copy parent data into cloned images in the background",
    after_help = "\
Configuration file lookup order:
  1. --config <path>                          (explicit flag)
  2. $RBD_BACKFILL_CONFIG                     (environment variable)
  3. ./rbd-backfill.yaml                      (project)
  4. $XDG_CONFIG_HOME/rbd-backfill/config.yaml or ~/.config/rbd-backfill/config.yaml
  5. /etc/rbd-backfill/config.yaml            (system)"
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides RBD_BACKFILL_CONFIG and default search)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Append log lines to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the backfill daemon until SIGINT/SIGTERM
    Run {
        /// Detach from the terminal and run in the background
        #[arg(long, conflicts_with = "foreground")]
        daemon: bool,

        /// Stay in the foreground (default)
        #[arg(long)]
        foreground: bool,

        /// Also track this image (pool[/namespace]/image); repeatable
        #[arg(short = 'i', long = "image")]
        images: Vec<String>,
    },

    /// Show scheduling state of images in the cluster
    Status {
        /// Only look at this pool
        #[arg(short, long)]
        pool: Option<String>,

        /// Only show this image (pool[/namespace]/image)
        #[arg(short, long)]
        image: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Write a starter configuration file
    Config {
        /// Destination path (default: ./rbd-backfill.yaml)
        dest: Option<String>,
    },
}

impl Commands {
    pub(crate) fn is_run(&self) -> bool {
        matches!(self, Commands::Run { .. })
    }
}
