use anyhow::Result;
use clap::Parser;

use crate::Opts;
use sitepack_server::config::Config;
use sitepack_server::StateInner;

/// List all packages.
#[derive(Debug, Parser)]
pub struct List {
    /// Only show packages that are not finished yet.
    #[clap(long)]
    active: bool,
}

pub async fn run(config: Config, opts: Opts) -> Result<()> {
    let sub = opts.command.as_list().unwrap();
    let state = StateInner::new(config).await;
    let store = state.store();
    let pending = store.pending_cancel().await?;

    for id in store.list().await? {
        let package = match store.load(id).await {
            Ok(package) => package,
            Err(e) => {
                eprintln!("{:>6}  <unreadable: {}>", id, e);
                continue;
            }
        };

        let status = package.display_status(&pending);
        if sub.active && (status.is_error() || status.is_complete()) {
            continue;
        }

        println!(
            "{:>6}  {:<40}  {}",
            package.id,
            package.name_hash(),
            status
        );
    }

    Ok(())
}
