use anyhow::Result;
use clap::Parser;

use crate::Opts;
use sitepack_server::config::Config;
use sitepack_server::StateInner;

/// Delete a package.
///
/// The files the package left in its storages are deleted too.
#[derive(Debug, Parser)]
pub struct Delete {
    /// ID of the package.
    id: i64,

    /// Leave the copies in the storages alone.
    #[clap(long)]
    keep_remote: bool,
}

pub async fn run(config: Config, opts: Opts) -> Result<()> {
    let sub = opts.command.as_delete().unwrap();
    let state = StateInner::new(config).await;
    let store = state.store();

    let package = store.load(sub.id).await?;

    if package.status().is_transferring() {
        eprintln!("Warning: package {} is still being transferred", package.id);
    }

    if !sub.keep_remote {
        let storages = state.storages().await?;
        let prefix = package.name_hash();

        for storage_id in package.storage_ids() {
            let backend = match storages.get(storage_id) {
                Some(backend) => backend,
                None => {
                    eprintln!("Skipping unknown storage {}", storage_id);
                    continue;
                }
            };

            let files = match backend.list_files().await {
                Ok(files) => files,
                Err(e) => {
                    eprintln!("Cannot list storage {}: {}", storage_id, e);
                    continue;
                }
            };

            for name in files.iter().filter(|name| name.starts_with(&prefix)) {
                match backend.delete_file(name).await {
                    Ok(()) => eprintln!("Deleted {} from {}", name, backend.identity().name),
                    Err(e) => eprintln!("Cannot delete {} from storage {}: {}", name, storage_id, e),
                }
            }
        }
    }

    store.delete(package.id).await?;
    eprintln!("Deleted package {}", package.id);

    Ok(())
}
