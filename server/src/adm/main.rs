mod command;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use enum_as_inner::EnumAsInner;
use tracing_subscriber::EnvFilter;

use command::cancel::{self, Cancel};
use command::delete::{self, Delete};
use command::filters::{self, Filters};
use command::list::{self, List};
use command::queue::{self, Queue};
use command::status::{self, Status};
use command::tables::{self, Tables};
use command::test_storage::{self, TestStorage};
use sitepack_server::config;

/// Site package administration utilities.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
pub struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// The sub-command.
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, EnumAsInner)]
pub enum Command {
    List(List),
    Status(Status),
    Queue(Queue),
    Cancel(Cancel),
    Delete(Delete),
    TestStorage(TestStorage),
    Filters(Filters),
    Tables(Tables),
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // these work on local files only
    match opts.command {
        Command::Filters(_) => return filters::run(opts).await,
        Command::Tables(_) => return tables::run(opts).await,
        _ => {}
    }

    let config = config::load_config(opts.config.as_deref()).await?;

    match opts.command {
        Command::List(_) => list::run(config, opts).await?,
        Command::Status(_) => status::run(config, opts).await?,
        Command::Queue(_) => queue::run(config, opts).await?,
        Command::Cancel(_) => cancel::run(config, opts).await?,
        Command::Delete(_) => delete::run(config, opts).await?,
        Command::TestStorage(_) => test_storage::run(config, opts).await?,
        Command::Filters(_) | Command::Tables(_) => unreachable!(),
    }

    Ok(())
}
