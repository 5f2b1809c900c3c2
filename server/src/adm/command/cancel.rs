use anyhow::Result;
use clap::Parser;

use crate::Opts;
use sitepack_server::config::Config;
use sitepack_server::StateInner;

/// Cancel a package.
///
/// The daemon stops the package the next time it sees it.
#[derive(Debug, Parser)]
pub struct Cancel {
    /// ID of the package.
    id: i64,
}

pub async fn run(config: Config, opts: Opts) -> Result<()> {
    let sub = opts.command.as_cancel().unwrap();
    let state = StateInner::new(config).await;
    let store = state.store();

    let package = store.load(sub.id).await?;
    if package.status().is_error() || package.status().is_complete() {
        eprintln!("Package {} has already finished ({})", package.id, package.status());
        return Ok(());
    }

    store.request_cancel(package.id).await?;
    eprintln!("Requested cancellation of package {}", package.id);

    Ok(())
}
