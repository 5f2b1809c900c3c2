//! Table classification.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Subsite ID of the tables shared by the whole network.
pub const NETWORK_SITE_ID: i64 = -1;

/// Subsite ID of the main site.
pub const MAIN_SITE_ID: i64 = 1;

/// Per-site core tables.
const CORE_TABLES: &[&str] = &[
    "commentmeta",
    "comments",
    "links",
    "options",
    "postmeta",
    "posts",
    "term_relationships",
    "term_taxonomy",
    "termmeta",
    "terms",
];

/// Tables shared by a whole network.
const NETWORK_TABLES: &[&str] = &[
    "blogmeta",
    "blog_versions",
    "blogs",
    "registration_log",
    "signups",
    "site",
    "sitemeta",
];

const USER_TABLES: &[&str] = &["users", "usermeta"];

lazy_static! {
    static ref SUBSITE_INFIX_REGEX: Regex = Regex::new(r"^([0-9]+)_(.+)$").unwrap();
}

/// A table as listed in the archive's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,

    #[serde(default)]
    pub rows: Option<u64>,

    #[serde(default)]
    pub size: Option<u64>,
}

/// A classified table.
///
/// The classification is done once from the name and never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    name: String,
    has_prefix: bool,
    stripped_name: String,
    subsite_id: i64,
    subsite_prefix: String,
    user_table: bool,
    rows: Option<u64>,
    size: Option<u64>,
}

impl From<&str> for CatalogEntry {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            rows: None,
            size: None,
        }
    }
}

impl From<String> for CatalogEntry {
    fn from(name: String) -> Self {
        Self {
            name,
            rows: None,
            size: None,
        }
    }
}

impl TableDescriptor {
    /// Classifies a table of an archive using `prefix`.
    pub fn new(entry: CatalogEntry, prefix: &str, multisite: bool) -> Self {
        let CatalogEntry { name, rows, size } = entry;

        let rest = match name.strip_prefix(prefix) {
            Some(rest) if !rest.is_empty() => rest.to_owned(),
            _ => {
                return Self {
                    stripped_name: name.clone(),
                    name,
                    has_prefix: false,
                    subsite_id: NETWORK_SITE_ID,
                    subsite_prefix: String::new(),
                    user_table: false,
                    rows,
                    size,
                };
            }
        };

        let user_table = USER_TABLES.contains(&rest.as_str());

        let (subsite_id, subsite_prefix, stripped_name) = if !multisite {
            (MAIN_SITE_ID, prefix.to_owned(), rest)
        } else if let Some((id, stripped)) = parse_subsite_infix(&rest) {
            (id, format!("{}{}_", prefix, id), stripped)
        } else if user_table || NETWORK_TABLES.contains(&rest.as_str()) {
            (NETWORK_SITE_ID, prefix.to_owned(), rest)
        } else {
            (MAIN_SITE_ID, prefix.to_owned(), rest)
        };

        Self {
            name,
            has_prefix: true,
            stripped_name,
            subsite_id,
            subsite_prefix,
            user_table,
            rows,
            size,
        }
    }

    /// The original name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_prefix(&self) -> bool {
        self.has_prefix
    }

    /// Returns the name without the prefix.
    ///
    /// With `with_subsite_infix`, a subsite table keeps its `{id}_` part.
    pub fn name_without_prefix(&self, with_subsite_infix: bool) -> String {
        if with_subsite_infix && self.subsite_id > MAIN_SITE_ID {
            format!("{}_{}", self.subsite_id, self.stripped_name)
        } else {
            self.stripped_name.clone()
        }
    }

    /// Name without the prefix and subsite infix.
    pub fn stripped_name(&self) -> &str {
        &self.stripped_name
    }

    pub fn subsite_id(&self) -> i64 {
        self.subsite_id
    }

    /// Prefix of the site the table belongs to, e.g. `wp_3_`.
    pub fn subsite_prefix(&self) -> &str {
        &self.subsite_prefix
    }

    pub fn is_user_table(&self) -> bool {
        self.user_table
    }

    /// Returns whether this is one of the core tables every site has.
    pub fn is_core_table(&self) -> bool {
        self.has_prefix && CORE_TABLES.contains(&self.stripped_name.as_str())
    }

    pub fn is_network_table(&self) -> bool {
        self.has_prefix && NETWORK_TABLES.contains(&self.stripped_name.as_str())
    }

    pub fn rows(&self) -> Option<u64> {
        self.rows
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }
}

/// Splits `{id}_{name}` for subsite IDs above the main site.
fn parse_subsite_infix(rest: &str) -> Option<(i64, String)> {
    let captures = SUBSITE_INFIX_REGEX.captures(rest)?;
    let id: i64 = captures.get(1)?.as_str().parse().ok()?;

    if id > MAIN_SITE_ID {
        Some((id, captures.get(2)?.as_str().to_owned()))
    } else {
        None
    }
}
