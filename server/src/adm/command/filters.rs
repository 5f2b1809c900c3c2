use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use crate::Opts;
use sitepack::filter::{
    Component, ComponentFilterEngine, ComponentSet, CustomFilters, SiteLayout,
};

/// Show what a component selection leaves out of a site.
///
/// The exclusions are printed as JSON.
#[derive(Debug, Parser)]
pub struct Filters {
    /// Root of a site with the standard layout.
    #[clap(long, conflicts_with = "layout")]
    root: Option<PathBuf>,

    /// The site layout as a JSON file.
    #[clap(long)]
    layout: Option<PathBuf>,

    /// Extra filters as a JSON file.
    #[clap(long)]
    custom_filters: Option<PathBuf>,

    /// A component to include.
    ///
    /// Defaults to all of them.
    #[clap(long = "component", value_name = "COMPONENT")]
    components: Vec<Component>,
}

pub async fn run(opts: Opts) -> Result<()> {
    let sub = opts.command.as_filters().unwrap();

    let layout = match (&sub.root, &sub.layout) {
        (Some(root), _) => SiteLayout::standard(root),
        (None, Some(path)) => read_json(path)?,
        (None, None) => return Err(anyhow!("Either --root or --layout is required")),
    };

    let custom: CustomFilters = match &sub.custom_filters {
        Some(path) => read_json(path)?,
        None => CustomFilters::default(),
    };

    let components = if sub.components.is_empty() {
        ComponentSet::all()
    } else {
        ComponentSet::new(sub.components.iter().copied())
    };

    let exclusions = ComponentFilterEngine::new(layout)
        .with_custom_filters(custom)
        .exclusions(&components);

    if exclusions.scope.unreadable_count > 0 {
        eprintln!(
            "Warning: {} items could not be read",
            exclusions.scope.unreadable_count
        );
    }

    println!("{}", serde_json::to_string_pretty(&exclusions)?);

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Cannot read {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid JSON in {:?}", path))
}
