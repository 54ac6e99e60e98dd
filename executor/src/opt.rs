use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Opts {
    #[command(subcommand)]
    pub cmd: SubCmd,

    #[command(flatten)]
    pub opt: GlobalOpts,
}

#[derive(clap::Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Configuration file. Defaults to `<config dir>/sandrun/config.toml`
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCmd {
    /// Run a single source file and print the result as JSON
    Run(RunSubCmd),

    /// Remove abandoned workspaces and containers
    Reap(ReapSubCmd),

    /// Validate the language table and list it
    Languages,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunSubCmd {
    /// Language id, e.g. `python`
    #[arg(long, short)]
    pub language: String,

    /// The source file to run. Its file name is kept inside the container.
    #[arg(long, short)]
    pub file: PathBuf,

    /// Memory limit, in megabytes
    #[arg(long, short, default_value_t = 256)]
    pub memory: u64,

    /// Time limit, in seconds
    #[arg(long, short, default_value_t = 5)]
    pub time: u64,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ReapSubCmd {
    /// Keep sweeping every `reaper_interval_secs` until interrupted
    #[arg(long, short)]
    pub watch: bool,
}
