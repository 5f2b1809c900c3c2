//! Per-table extraction and renaming.

use std::collections::BTreeSet;

use serde::Serialize;

use super::table::{CatalogEntry, TableDescriptor, MAIN_SITE_ID, NETWORK_SITE_ID};
use super::{InstallContext, Topology};
use crate::error::{PackError, PackResult};

/// Decides what happens to each table of an archive.
#[derive(Debug, Clone)]
pub struct TableDecisionEngine {
    context: InstallContext,
    tables: Vec<TableDescriptor>,

    /// Unprefixed names of the tables that become the main tables of a
    /// standalone site.
    claimed_main_tables: BTreeSet<String>,
}

/// The decision for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TablePlan {
    pub name: String,
    pub subsite_id: i64,
    pub extracted: bool,

    /// Destination name. `None` when skipped or deferred.
    pub new_name: Option<String>,

    /// The destination site must be created before this table can be
    /// installed.
    pub deferred: bool,

    pub search_replace: bool,

    /// Row count from the catalog, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,

    /// Size in bytes from the catalog, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// How a table name changes, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefixDiff {
    pub old_prefix: String,
    pub new_prefix: String,
    pub common: String,
}

impl TableDecisionEngine {
    /// Classifies the tables of an archive.
    pub fn new<I, E>(context: InstallContext, catalog: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<CatalogEntry>,
    {
        let tables: Vec<TableDescriptor> = catalog
            .into_iter()
            .map(|entry| {
                TableDescriptor::new(
                    entry.into(),
                    &context.source_prefix,
                    context.multisite_archive,
                )
            })
            .collect();

        let claimed_main_tables = if context.topology == Topology::Standalone
            && context.standalone_subsite_id > MAIN_SITE_ID
        {
            tables
                .iter()
                .filter(|t| t.has_prefix() && t.subsite_id() == context.standalone_subsite_id)
                .map(|t| t.stripped_name().to_owned())
                .collect()
        } else {
            BTreeSet::new()
        };

        Self {
            context,
            tables,
            claimed_main_tables,
        }
    }

    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name() == name)
    }

    /// Returns whether a table is installed at all.
    pub fn can_be_extracted(&self, table: &TableDescriptor) -> PackResult<bool> {
        let extracted = match self.context.topology {
            Topology::NotSet => return Err(PackError::TopologyNotSet),

            Topology::SingleSite
            | Topology::MultisiteSubdomain
            | Topology::MultisiteSubfolder
            | Topology::RecoverySingleSite
            | Topology::RecoveryMultisiteSubdomain
            | Topology::RecoveryMultisiteSubfolder => true,

            Topology::Standalone => self.standalone_extracted(table),

            Topology::SubsiteOnSubdomain
            | Topology::SubsiteOnSubfolder
            | Topology::SingleSiteOnSubdomain
            | Topology::SingleSiteOnSubfolder => self.import_extracted(table),
        };

        Ok(extracted)
    }

    fn standalone_extracted(&self, table: &TableDescriptor) -> bool {
        if table.is_user_table() || !table.has_prefix() {
            return true;
        }

        let target = self.context.standalone_subsite_id;

        match table.subsite_id() {
            NETWORK_SITE_ID => false,
            id if id == target => true,
            MAIN_SITE_ID => {
                !table.is_core_table() && !self.claimed_main_tables.contains(table.stripped_name())
            }
            _ => false,
        }
    }

    fn import_extracted(&self, table: &TableDescriptor) -> bool {
        if table.is_user_table() {
            return true;
        }

        if self.is_self_table(table) {
            return false;
        }

        self.context.mapping(table.subsite_id()).is_some()
    }

    fn is_self_table(&self, table: &TableDescriptor) -> bool {
        table.has_prefix()
            && self
                .context
                .self_tables
                .iter()
                .any(|t| t == table.stripped_name())
    }

    /// Returns the destination name of a table.
    ///
    /// An empty name means the destination site does not exist yet and
    /// the table has to wait until it is created.
    pub fn new_name(&self, table: &TableDescriptor) -> PackResult<String> {
        let prefix = &self.context.dest_prefix;

        if self.context.topology == Topology::NotSet {
            return Err(PackError::TopologyNotSet);
        }

        if !table.has_prefix() {
            return Ok(table.name().to_owned());
        }

        let name = match self.context.topology {
            Topology::NotSet => return Err(PackError::TopologyNotSet),

            Topology::SingleSite
            | Topology::MultisiteSubdomain
            | Topology::MultisiteSubfolder
            | Topology::RecoverySingleSite
            | Topology::RecoveryMultisiteSubdomain
            | Topology::RecoveryMultisiteSubfolder => {
                format!("{}{}", prefix, table.name_without_prefix(true))
            }

            Topology::Standalone => format!("{}{}", prefix, table.name_without_prefix(false)),

            Topology::SubsiteOnSubdomain | Topology::SubsiteOnSubfolder => {
                match self.imported_name(table)? {
                    Some(name) => name,
                    None => {
                        return Err(PackError::UnresolvedSubsiteTarget {
                            subsite_id: table.subsite_id(),
                        })
                    }
                }
            }

            Topology::SingleSiteOnSubdomain | Topology::SingleSiteOnSubfolder => {
                self.imported_name(table)?.unwrap_or_default()
            }
        };

        Ok(name)
    }

    /// Destination name of a table imported into an existing network.
    ///
    /// Returns `None` if the target site still has to be created.
    fn imported_name(&self, table: &TableDescriptor) -> PackResult<Option<String>> {
        let prefix = &self.context.dest_prefix;

        if table.is_user_table() {
            return Ok(Some(format!("{}{}", prefix, table.stripped_name())));
        }

        let mapping = self.context.mapping(table.subsite_id()).ok_or(
            PackError::MissingSubsiteMapping {
                subsite_id: table.subsite_id(),
            },
        )?;

        let name = match mapping.target_id {
            id if id < MAIN_SITE_ID => return Ok(None),
            MAIN_SITE_ID => format!("{}{}", prefix, table.stripped_name()),
            id => format!("{}{}_{}", prefix, id, table.stripped_name()),
        };

        Ok(Some(name))
    }

    /// Returns whether search and replace runs on a table.
    pub fn can_search_replace(&self, table: &TableDescriptor) -> PackResult<bool> {
        if !self.can_be_extracted(table)? {
            return Ok(false);
        }

        Ok(!self.is_self_table(table) && !self.context.replace_exclusions.contains(table.name()))
    }

    /// Decides every table of the catalog.
    pub fn plan(&self) -> PackResult<Vec<TablePlan>> {
        self.tables
            .iter()
            .map(|table| {
                let extracted = self.can_be_extracted(table)?;

                let (new_name, deferred) = if extracted {
                    let name = self.new_name(table)?;
                    if name.is_empty() {
                        tracing::debug!("Table {} waits for its destination site", table.name());
                        (None, true)
                    } else {
                        (Some(name), false)
                    }
                } else {
                    (None, false)
                };

                Ok(TablePlan {
                    name: table.name().to_owned(),
                    subsite_id: table.subsite_id(),
                    extracted,
                    new_name,
                    deferred,
                    search_replace: self.can_search_replace(table)?,
                    rows: table.rows(),
                    size: table.size(),
                })
            })
            .collect()
    }
}

/// Splits two table names into their differing prefixes and the common rest.
///
/// Returns `None` if the names are identical. This is for display only.
pub fn prefix_diff(original: &str, new: &str) -> Option<PrefixDiff> {
    if original == new {
        return None;
    }

    let common_len: usize = original
        .chars()
        .rev()
        .zip(new.chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(c, _)| c.len_utf8())
        .sum();

    Some(PrefixDiff {
        old_prefix: original[..original.len() - common_len].to_owned(),
        new_prefix: new[..new.len() - common_len].to_owned(),
        common: original[original.len() - common_len..].to_owned(),
    })
}
