use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// The command line interface for serial fanout.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Use this settings file instead of the configured one
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Use this source device instead of the configured one
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example of a settings file's contents.
    Settings,
}
