use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "leafscan")]
#[command(author, version, about = "Leaf disease diagnosis from images")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the JSON prediction API
    Serve {
        /// Configuration file path
        #[arg(short, long, env = "LEAFSCAN_CONFIG", default_value = "leafscan.yaml")]
        config: PathBuf,

        /// Listen address
        #[arg(short, long)]
        listen: Option<String>,

        /// Listen port
        #[arg(short = 'P', long)]
        port: Option<u16>,

        /// Emit JSON log lines
        #[arg(long)]
        json_logs: bool,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Diagnose image files and print one JSON result per image
    Predict {
        /// Configuration file path
        #[arg(short, long, env = "LEAFSCAN_CONFIG", default_value = "leafscan.yaml")]
        config: PathBuf,

        /// Images to diagnose
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
}
