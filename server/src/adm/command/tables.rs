use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use crate::Opts;
use sitepack::installer::{prefix_diff, CatalogEntry, InstallContext, TableDecisionEngine};

/// Show what an installation does with each table.
#[derive(Debug, Parser)]
pub struct Tables {
    /// The installation parameters as a JSON file.
    #[clap(long)]
    context: PathBuf,

    /// The table catalog of the archive.
    ///
    /// One table per line: the name, optionally followed by the row count
    /// and the size in bytes.
    catalog: PathBuf,

    /// Print the plan as JSON.
    #[clap(long)]
    json: bool,
}

pub async fn run(opts: Opts) -> Result<()> {
    let sub = opts.command.as_tables().unwrap();

    let context = std::fs::read_to_string(&sub.context)
        .with_context(|| format!("Cannot read {:?}", sub.context))?;
    let context: InstallContext = serde_json::from_str(&context)
        .with_context(|| format!("Invalid installation parameters in {:?}", sub.context))?;

    let catalog = std::fs::read_to_string(&sub.catalog)
        .with_context(|| format!("Cannot read {:?}", sub.catalog))?;
    let entries = catalog
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_catalog_line)
        .collect::<Result<Vec<_>>>()?;

    let engine = TableDecisionEngine::new(context, entries);
    let plan = engine.plan()?;

    if sub.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    for table in plan {
        let action = if !table.extracted {
            "skip".to_string()
        } else if table.deferred {
            "defer".to_string()
        } else {
            let new_name = table.new_name.as_deref().unwrap_or_default();
            match prefix_diff(&table.name, new_name) {
                Some(diff) => format!(
                    "[{} -> {}]{}",
                    diff.old_prefix, diff.new_prefix, diff.common
                ),
                None => "keep".to_string(),
            }
        };

        let rows = match table.rows {
            Some(rows) => format!("{} rows", rows),
            None => String::new(),
        };

        println!(
            "{:<40}  {:<40}  {:>12}{}",
            table.name,
            action,
            rows,
            if table.search_replace {
                "  search/replace"
            } else {
                ""
            }
        );
    }

    Ok(())
}

fn parse_catalog_line(line: &str) -> Result<CatalogEntry> {
    let mut fields = line.split_whitespace();
    let name = fields
        .next()
        .ok_or_else(|| anyhow!("Empty catalog line"))?
        .to_string();

    let mut number = |what: &str| -> Result<Option<u64>> {
        fields
            .next()
            .map(|field| {
                field
                    .parse::<u64>()
                    .with_context(|| format!("Invalid {} for table {}", what, name))
            })
            .transpose()
    };

    let rows = number("row count")?;
    let size = number("size")?;

    Ok(CatalogEntry { name, rows, size })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_catalog_line() {
        let entry = parse_catalog_line("wp_posts  1200 4194304").unwrap();
        assert_eq!("wp_posts", entry.name);
        assert_eq!(Some(1200), entry.rows);
        assert_eq!(Some(4194304), entry.size);

        let entry = parse_catalog_line("wp_options").unwrap();
        assert_eq!(CatalogEntry::from("wp_options"), entry);

        parse_catalog_line("wp_posts many").unwrap_err();
    }
}
