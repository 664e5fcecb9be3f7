use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cfgdb-manage",
    about = "Check, clean and heal a config object store and its id pools",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Apply clean/heal repairs instead of only logging them
    #[arg(long, global = true)]
    pub execute: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub debug: bool,

    /// TOML file with `[store]` and `[audit]` sections
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use the durable store in this directory
    #[arg(long, global = true, conflicts_with = "in_json")]
    pub data_dir: Option<PathBuf>,

    /// Run against a JSON store dump instead of a live store
    #[arg(long, global = true)]
    pub in_json: Option<PathBuf>,

    /// Write the resulting store state as a JSON dump
    #[arg(long, global = true)]
    pub out_json: Option<PathBuf>,

    #[arg(long, global = true, requires = "password")]
    pub username: Option<String>,

    #[arg(long, global = true, requires = "username")]
    pub password: Option<String>,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Report inconsistencies without changing anything
    Check(RunArgs),
    /// Remove stale index entries, objects, edges and pool entries
    Clean(RunArgs),
    /// Insert missing index entries and pool entries
    Heal(RunArgs),
    /// List every operation
    List,
}

#[derive(Args)]
pub struct RunArgs {
    /// Run only this operation
    pub name: Option<String>,
}
