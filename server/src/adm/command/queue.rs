use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use crate::Opts;
use sitepack::filter::{Component, ComponentSet};
use sitepack::package::{ArchiveFormat, Package};
use sitepack::status::PackageStatus;
use sitepack_server::config::Config;
use sitepack_server::StateInner;

/// Queue a built archive for transfer.
///
/// For example, to send a zip archive and its installer to the
/// storages 1 and 3:
///
/// $ sitepackadm queue --name mysite --archive site.zip --installer installer.php --storage 1 --storage 3
#[derive(Debug, Parser)]
pub struct Queue {
    /// Name of the package.
    #[clap(long)]
    name: String,

    /// The archive.
    ///
    /// Archives ending in `.daf` are DupArchives, everything else is
    /// taken as zip.
    #[clap(long)]
    archive: PathBuf,

    /// The installer.
    #[clap(long)]
    installer: PathBuf,

    /// A storage to copy the package to.
    ///
    /// Specify this flag multiple times to copy to multiple storages.
    #[clap(long = "storage", value_name = "ID", required = true)]
    storages: Vec<i64>,

    /// A component the archive contains.
    ///
    /// Defaults to all of them.
    #[clap(long = "component", value_name = "COMPONENT")]
    components: Vec<Component>,
}

pub async fn run(config: Config, opts: Opts) -> Result<()> {
    let sub = opts.command.as_queue().unwrap();

    for storage_id in &sub.storages {
        if !config.storages.iter().any(|s| s.id == *storage_id) {
            return Err(anyhow!("Storage {} is not configured", storage_id));
        }
    }

    let archive = sub
        .archive
        .canonicalize()
        .with_context(|| format!("Cannot find {:?}", sub.archive))?;
    let installer = sub
        .installer
        .canonicalize()
        .with_context(|| format!("Cannot find {:?}", sub.installer))?;
    let size = std::fs::metadata(&archive)?.len();

    let format = match archive.extension().and_then(|e| e.to_str()) {
        Some("daf") => ArchiveFormat::DupArchive,
        _ => ArchiveFormat::Zip,
    };

    let components = if sub.components.is_empty() {
        ComponentSet::all()
    } else {
        ComponentSet::new(sub.components.iter().copied())
    };

    let state = StateInner::new(config).await;
    let store = state.store();

    let mut builder = Package::builder(store.next_id().await?, sub.name.as_str())
        .components(components)
        .format(format);
    for storage_id in &sub.storages {
        builder = builder.storage(*storage_id);
    }

    let mut package = builder.build();
    package.archive.path = Some(archive);
    package.archive.installer_path = Some(installer);
    package.archive.size = size;
    package.set_status(PackageStatus::COPIED_PACKAGE)?;

    store.save(&package).await?;

    println!("{}", package.id);

    Ok(())
}
