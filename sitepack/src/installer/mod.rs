//! Installer table decisions.
//!
//! When a package is installed, each table of the archived database is
//! either extracted under a new name or skipped. The decision depends on
//! the installation topology: restoring a single site, a whole network,
//! pulling one subsite out as a standalone site, or importing sites into
//! an existing network.
//!
//! ## Subsites
//!
//! In a network archive, `{prefix}{id}_{name}` belongs to subsite `id`,
//! `{prefix}{name}` to the main site (1), and the network tables such as
//! `{prefix}sitemeta` to no site at all (-1).

mod decision;
mod table;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PackError, PackResult};

pub use decision::{prefix_diff, PrefixDiff, TableDecisionEngine, TablePlan};
pub use table::{CatalogEntry, TableDescriptor, MAIN_SITE_ID, NETWORK_SITE_ID};

/// Installation topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    NotSet,

    /// A single site restored as a single site.
    SingleSite,

    /// A whole network restored, subdomain install.
    MultisiteSubdomain,

    /// A whole network restored, subfolder install.
    MultisiteSubfolder,

    /// One subsite extracted as a single site.
    Standalone,

    /// Subsites imported into an existing subdomain network.
    SubsiteOnSubdomain,

    /// Subsites imported into an existing subfolder network.
    SubsiteOnSubfolder,

    /// A single site imported as a subsite of an existing subdomain network.
    SingleSiteOnSubdomain,

    /// A single site imported as a subsite of an existing subfolder network.
    SingleSiteOnSubfolder,

    /// In-place recovery of a single site.
    RecoverySingleSite,

    /// In-place recovery of a subdomain network.
    RecoveryMultisiteSubdomain,

    /// In-place recovery of a subfolder network.
    RecoveryMultisiteSubfolder,
}

/// Where the tables of a source subsite go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsiteMapping {
    /// Subsite ID in the archive.
    #[serde(rename = "source-id")]
    pub source_id: i64,

    /// Subsite ID in the destination network.
    ///
    /// Below 1 means the destination site has not been created yet.
    #[serde(rename = "target-id")]
    pub target_id: i64,
}

/// Parameters of an installation run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallContext {
    /// Table prefix of the archived database.
    #[serde(rename = "source-prefix")]
    pub source_prefix: String,

    /// Table prefix at the destination.
    #[serde(rename = "dest-prefix")]
    pub dest_prefix: String,

    pub topology: Topology,

    /// Whether the archive holds a whole network.
    #[serde(rename = "multisite-archive")]
    #[serde(default)]
    pub multisite_archive: bool,

    /// The subsite extracted by a standalone install.
    #[serde(rename = "standalone-subsite-id")]
    #[serde(default = "default_standalone_subsite_id")]
    pub standalone_subsite_id: i64,

    /// Subsite destinations for imports into an existing network.
    #[serde(rename = "subsite-mappings")]
    #[serde(default)]
    pub subsite_mappings: Vec<SubsiteMapping>,

    /// Tables search and replace must leave alone.
    #[serde(rename = "replace-exclusions")]
    #[serde(default)]
    pub replace_exclusions: BTreeSet<String>,

    /// Unprefixed names of the tables the backup engine itself keeps.
    ///
    /// These are never imported into an existing network, otherwise the
    /// backups of the source would show up at the destination.
    #[serde(rename = "self-tables")]
    #[serde(default = "default_self_tables")]
    pub self_tables: Vec<String>,
}

impl Topology {
    pub const ALL: [Topology; 12] = [
        Self::NotSet,
        Self::SingleSite,
        Self::MultisiteSubdomain,
        Self::MultisiteSubfolder,
        Self::Standalone,
        Self::SubsiteOnSubdomain,
        Self::SubsiteOnSubfolder,
        Self::SingleSiteOnSubdomain,
        Self::SingleSiteOnSubfolder,
        Self::RecoverySingleSite,
        Self::RecoveryMultisiteSubdomain,
        Self::RecoveryMultisiteSubfolder,
    ];

    /// Returns the numeric code.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotSet => -1,
            Self::SingleSite => 1,
            Self::MultisiteSubdomain => 2,
            Self::MultisiteSubfolder => 3,
            Self::Standalone => 4,
            Self::SubsiteOnSubdomain => 5,
            Self::SubsiteOnSubfolder => 6,
            Self::SingleSiteOnSubdomain => 7,
            Self::SingleSiteOnSubfolder => 8,
            Self::RecoverySingleSite => 9,
            Self::RecoveryMultisiteSubdomain => 10,
            Self::RecoveryMultisiteSubfolder => 11,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSet => "not-set",
            Self::SingleSite => "single-site",
            Self::MultisiteSubdomain => "multisite-subdomain",
            Self::MultisiteSubfolder => "multisite-subfolder",
            Self::Standalone => "standalone",
            Self::SubsiteOnSubdomain => "subsite-on-subdomain",
            Self::SubsiteOnSubfolder => "subsite-on-subfolder",
            Self::SingleSiteOnSubdomain => "single-site-on-subdomain",
            Self::SingleSiteOnSubfolder => "single-site-on-subfolder",
            Self::RecoverySingleSite => "recovery-single-site",
            Self::RecoveryMultisiteSubdomain => "recovery-multisite-subdomain",
            Self::RecoveryMultisiteSubfolder => "recovery-multisite-subfolder",
        }
    }
}

impl TryFrom<i32> for Topology {
    type Error = PackError;

    fn try_from(code: i32) -> PackResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .ok_or_else(|| PackError::InvalidTopology {
                value: code.to_string(),
            })
    }
}

impl FromStr for Topology {
    type Err = PackError;

    fn from_str(s: &str) -> PackResult<Self> {
        if let Ok(code) = s.parse::<i32>() {
            return Self::try_from(code);
        }

        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PackError::InvalidTopology {
                value: s.to_owned(),
            })
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl InstallContext {
    pub fn new(
        source_prefix: impl Into<String>,
        dest_prefix: impl Into<String>,
        topology: Topology,
    ) -> Self {
        Self {
            source_prefix: source_prefix.into(),
            dest_prefix: dest_prefix.into(),
            topology,
            multisite_archive: false,
            standalone_subsite_id: default_standalone_subsite_id(),
            subsite_mappings: Vec::new(),
            replace_exclusions: BTreeSet::new(),
            self_tables: default_self_tables(),
        }
    }

    /// Returns the destination of a source subsite.
    pub fn mapping(&self, source_id: i64) -> Option<&SubsiteMapping> {
        self.subsite_mappings
            .iter()
            .find(|m| m.source_id == source_id)
    }
}

fn default_standalone_subsite_id() -> i64 {
    MAIN_SITE_ID
}

fn default_self_tables() -> Vec<String> {
    vec![
        "sitepack_entities".to_string(),
        "sitepack_packages".to_string(),
    ]
}
