use anyhow::Result;
use clap::Parser;

use crate::Opts;
use sitepack_server::config::Config;
use sitepack_server::error::ServerError;
use sitepack_server::StateInner;

/// Check that a storage works.
///
/// A small file is written, read back and deleted.
#[derive(Debug, Parser)]
pub struct TestStorage {
    /// ID of the storage.
    id: i64,
}

pub async fn run(config: Config, opts: Opts) -> Result<()> {
    let sub = opts.command.as_test_storage().unwrap();
    let state = StateInner::new(config).await;

    let backend = state
        .storages()
        .await?
        .get(sub.id)
        .ok_or(ServerError::NoSuchStorage { id: sub.id })?;

    backend.test().await?;
    eprintln!("Storage {} ({}) works", sub.id, backend.identity().name);

    Ok(())
}
