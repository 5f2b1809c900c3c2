use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use humantime::format_duration;

use crate::Opts;
use sitepack_server::config::Config;
use sitepack_server::StateInner;

/// Show the status of a package.
#[derive(Debug, Parser)]
pub struct Status {
    /// ID of the package.
    id: i64,
}

pub async fn run(config: Config, opts: Opts) -> Result<()> {
    let sub = opts.command.as_status().unwrap();
    let state = StateInner::new(config).await;
    let store = state.store();

    let package = store.load(sub.id).await?;
    let pending = store.pending_cancel().await?;
    let storages = state.storages().await?;

    println!("Package {} ({})", package.id, package.name_hash());
    println!("  Created:    {}", package.created_at.to_rfc3339());
    println!("  Status:     {}", package.display_status(&pending));
    println!(
        "  Components: {}",
        package
            .components
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "  Archive:    {} bytes{}",
        package.archive_size(&state.config().temp_path),
        if package.is_building() {
            " so far"
        } else {
            ""
        }
    );

    let uploads = package.latest_uploads();
    if !uploads.is_empty() {
        println!("  Storages:");
    }

    for upload in uploads {
        let elapsed = upload.started_at.and_then(|started_at| {
            let until = upload.stopped_at.unwrap_or_else(Utc::now);
            (until - started_at).to_std().ok()
        });

        println!(
            "    - {} [{:.0}%, {} failures{}]",
            upload.status_message(storages),
            upload.progress,
            upload.failure_count,
            match elapsed {
                Some(elapsed) => format!(
                    ", {}",
                    format_duration(Duration::from_secs(elapsed.as_secs()))
                ),
                None => String::new(),
            }
        );
    }

    Ok(())
}
