//! Component filters.
//!
//! A package selects logical components of the site. Everything that
//! belongs to an unselected component is turned into a concrete list of
//! directories and files the archive builder must leave out.
//!
//! The database component contributes no paths: it is excluded when the
//! dump is generated, not at the file level.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

use crate::error::{PackError, PackResult};

/// Maximum number of unreadable items remembered in a [`FilterScope`].
pub const MAX_UNREADABLE_ITEMS: usize = 500;

/// Core directories under the site root.
const CORE_DIRS: &[&str] = &["wp-admin", "wp-includes"];

/// Core files under the site root.
const CORE_FILES: &[&str] = &[
    "index.php",
    "license.txt",
    "readme.html",
    "wp-activate.php",
    "wp-blog-header.php",
    "wp-comments-post.php",
    "wp-config-sample.php",
    "wp-cron.php",
    "wp-links-opml.php",
    "wp-load.php",
    "wp-login.php",
    "wp-mail.php",
    "wp-settings.php",
    "wp-signup.php",
    "wp-trackback.php",
    "xmlrpc.php",
];

/// Root files that are part of every archive.
const ALWAYS_INCLUDED_FILES: &[&str] = &["wp-config.php", ".htaccess"];

/// A logical component of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Component {
    #[serde(rename = "database")]
    Database,

    #[serde(rename = "core")]
    Core,

    #[serde(rename = "plugins")]
    Plugins,

    /// Active plugins only.
    #[serde(rename = "plugins-active")]
    PluginsActive,

    #[serde(rename = "themes")]
    Themes,

    /// Active themes only.
    #[serde(rename = "themes-active")]
    ThemesActive,

    #[serde(rename = "uploads")]
    Uploads,

    #[serde(rename = "other")]
    Other,
}

/// A normalized set of components.
///
/// An active-only variant and its full counterpart never coexist: the
/// active-only variant wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Component>", into = "Vec<Component>")]
pub struct ComponentSet(BTreeSet<Component>);

/// Description of a site on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteLayout {
    /// The site root.
    pub root: PathBuf,

    /// The content directory.
    #[serde(rename = "content-dir")]
    pub content_dir: PathBuf,

    #[serde(rename = "plugins-dir")]
    pub plugins_dir: PathBuf,

    #[serde(rename = "mu-plugins-dir")]
    pub mu_plugins_dir: PathBuf,

    #[serde(rename = "themes-dir")]
    pub themes_dir: PathBuf,

    #[serde(rename = "uploads-dir")]
    pub uploads_dir: PathBuf,

    /// Installed plugins.
    #[serde(default)]
    pub plugins: Vec<Extension>,

    /// Installed themes.
    #[serde(default)]
    pub themes: Vec<Extension>,
}

/// An installed plugin or theme.
#[derive(Debug, Clone, Deserialize)]
pub struct Extension {
    /// The slug relative to the plugins or themes directory.
    ///
    /// Plugins living in a directory are written as `dir/main.php`,
    /// single-file plugins as `main.php`. Themes are their directory name.
    pub slug: String,

    #[serde(default)]
    pub active: bool,
}

/// User-defined filters applied on top of the component filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomFilters {
    #[serde(default)]
    pub dirs: Vec<PathBuf>,

    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// File extensions, without the leading dot.
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Wildcard patterns matched against file names.
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Items that could not be read while computing filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterScope {
    /// The first unreadable items, up to [`MAX_UNREADABLE_ITEMS`].
    pub unreadable: Vec<PathBuf>,

    /// The real number of unreadable items.
    pub unreadable_count: usize,
}

/// Paths to leave out of the archive.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Exclusions {
    pub dirs: Vec<PathBuf>,
    pub files: Vec<PathBuf>,

    /// Excluded file extensions, lowercase.
    pub extensions: Vec<String>,

    /// Excluded file name patterns.
    pub patterns: Vec<String>,

    pub scope: FilterScope,

    #[serde(skip)]
    matchers: Vec<WildMatch>,
}

/// Computes the exclusions of a site for a component selection.
#[derive(Debug, Clone)]
pub struct ComponentFilterEngine {
    layout: SiteLayout,
    custom: CustomFilters,
}

impl Component {
    /// The six areas selected by default.
    pub const DEFAULTS: [Component; 6] = [
        Self::Database,
        Self::Core,
        Self::Plugins,
        Self::Themes,
        Self::Uploads,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Core => "core",
            Self::Plugins => "plugins",
            Self::PluginsActive => "plugins-active",
            Self::Themes => "themes",
            Self::ThemesActive => "themes-active",
            Self::Uploads => "uploads",
            Self::Other => "other",
        }
    }

    /// Returns the full component an active-only variant restricts.
    fn parent(&self) -> Option<Component> {
        match self {
            Self::PluginsActive => Some(Self::Plugins),
            Self::ThemesActive => Some(Self::Themes),
            _ => None,
        }
    }
}

impl FromStr for Component {
    type Err = PackError;

    fn from_str(name: &str) -> PackResult<Self> {
        let component = match name {
            "database" | "db" => Self::Database,
            "core" => Self::Core,
            "plugins" => Self::Plugins,
            "plugins-active" => Self::PluginsActive,
            "themes" => Self::Themes,
            "themes-active" => Self::ThemesActive,
            "uploads" => Self::Uploads,
            "other" => Self::Other,
            _ => {
                return Err(PackError::InvalidComponent {
                    name: name.to_owned(),
                })
            }
        };

        Ok(component)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ComponentSet {
    /// Creates a normalized set.
    pub fn new(components: impl IntoIterator<Item = Component>) -> Self {
        let mut set: BTreeSet<Component> = components.into_iter().collect();

        let parents: Vec<Component> = set.iter().filter_map(Component::parent).collect();
        for parent in parents {
            set.remove(&parent);
        }

        Self(set)
    }

    /// All six default areas.
    pub fn all() -> Self {
        Self::new(Component::DEFAULTS)
    }

    pub fn contains(&self, component: Component) -> bool {
        self.0.contains(&component)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for ComponentSet {
    fn default() -> Self {
        Self::all()
    }
}

impl From<Vec<Component>> for ComponentSet {
    fn from(components: Vec<Component>) -> Self {
        Self::new(components)
    }
}

impl From<ComponentSet> for Vec<Component> {
    fn from(set: ComponentSet) -> Self {
        set.0.into_iter().collect()
    }
}

impl SiteLayout {
    /// Returns the conventional layout of a site installed at `root`.
    pub fn standard(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let content_dir = root.join("wp-content");

        Self {
            plugins_dir: content_dir.join("plugins"),
            mu_plugins_dir: content_dir.join("mu-plugins"),
            themes_dir: content_dir.join("themes"),
            uploads_dir: content_dir.join("uploads"),
            content_dir,
            root,
            plugins: Vec::new(),
            themes: Vec::new(),
        }
    }

    fn area_dirs(&self) -> [&Path; 4] {
        [
            &self.plugins_dir,
            &self.mu_plugins_dir,
            &self.themes_dir,
            &self.uploads_dir,
        ]
    }
}

impl FilterScope {
    /// Records an item that could not be read.
    pub fn add_unreadable_item(&mut self, path: PathBuf) {
        self.unreadable_count += 1;
        if self.unreadable.len() < MAX_UNREADABLE_ITEMS {
            self.unreadable.push(path);
        }
    }
}

impl Exclusions {
    /// Returns whether both path lists are empty.
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty()
    }

    /// Returns whether the archive builder must skip a path.
    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.dirs.iter().any(|dir| path.starts_with(dir)) {
            return true;
        }

        if self.files.iter().any(|file| file == path) {
            return true;
        }

        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            let ext = ext.to_lowercase();
            if self.extensions.iter().any(|e| *e == ext) {
                return true;
            }
        }

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if self.matchers.iter().any(|m| m.matches(name)) {
                return true;
            }
        }

        false
    }

    fn add_dir(&mut self, dir: PathBuf) {
        if !self.dirs.contains(&dir) {
            self.dirs.push(dir);
        }
    }

    fn add_file(&mut self, file: PathBuf) {
        if !self.files.contains(&file) {
            self.files.push(file);
        }
    }
}

impl ComponentFilterEngine {
    pub fn new(layout: SiteLayout) -> Self {
        Self {
            layout,
            custom: CustomFilters::default(),
        }
    }

    pub fn with_custom_filters(mut self, custom: CustomFilters) -> Self {
        self.custom = custom;
        self
    }

    pub fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    /// Computes the exclusions for a component selection.
    pub fn exclusions(&self, components: &ComponentSet) -> Exclusions {
        let mut exclusions = Exclusions::default();

        if !components.contains(Component::Core) {
            self.exclude_core(&mut exclusions);
        }

        // The database is left out by the dump generator.

        if components.contains(Component::PluginsActive) {
            self.exclude_inactive_plugins(&mut exclusions);
        } else if !components.contains(Component::Plugins) {
            exclusions.add_dir(self.layout.plugins_dir.clone());
            exclusions.add_dir(self.layout.mu_plugins_dir.clone());
        }

        if components.contains(Component::ThemesActive) {
            self.exclude_inactive_themes(&mut exclusions);
        } else if !components.contains(Component::Themes) {
            exclusions.add_dir(self.layout.themes_dir.clone());
        }

        if !components.contains(Component::Uploads) {
            exclusions.add_dir(self.layout.uploads_dir.clone());
        }

        if !components.contains(Component::Other) {
            self.exclude_other(&mut exclusions);
        }

        self.apply_custom(&mut exclusions);

        tracing::debug!(
            dirs = exclusions.dirs.len(),
            files = exclusions.files.len(),
            "Computed component exclusions"
        );

        exclusions
    }

    fn exclude_core(&self, exclusions: &mut Exclusions) {
        for dir in CORE_DIRS {
            exclusions.add_dir(self.layout.root.join(dir));
        }

        for file in CORE_FILES {
            exclusions.add_file(self.layout.root.join(file));
        }
    }

    fn exclude_inactive_plugins(&self, exclusions: &mut Exclusions) {
        for plugin in self.layout.plugins.iter().filter(|p| !p.active) {
            match plugin.slug.split_once('/') {
                Some((dir, _)) => exclusions.add_dir(self.layout.plugins_dir.join(dir)),
                None => exclusions.add_file(self.layout.plugins_dir.join(&plugin.slug)),
            }
        }
    }

    fn exclude_inactive_themes(&self, exclusions: &mut Exclusions) {
        for theme in self.layout.themes.iter().filter(|t| !t.active) {
            exclusions.add_dir(self.layout.themes_dir.join(&theme.slug));
        }
    }

    /// Excludes everything that doesn't belong to another area.
    fn exclude_other(&self, exclusions: &mut Exclusions) {
        let layout = &self.layout;

        let root_is_known = |path: &Path| {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => return false,
            };

            path == layout.content_dir
                || CORE_DIRS.contains(&name)
                || CORE_FILES.contains(&name)
                || ALWAYS_INCLUDED_FILES.contains(&name)
                || layout.area_dirs().contains(&path)
        };
        self.exclude_unknown_entries(&layout.root, root_is_known, exclusions);

        let content_is_known = |path: &Path| layout.area_dirs().contains(&path);
        self.exclude_unknown_entries(&layout.content_dir, content_is_known, exclusions);
    }

    fn exclude_unknown_entries<F>(&self, dir: &Path, is_known: F, exclusions: &mut Exclusions)
    where
        F: Fn(&Path) -> bool,
    {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot read {:?}: {}", dir, e);
                exclusions.scope.add_unreadable_item(dir.to_owned());
                return;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Cannot read entry in {:?}: {}", dir, e);
                    exclusions.scope.add_unreadable_item(dir.to_owned());
                    continue;
                }
            };

            let path = entry.path();
            if is_known(&path) {
                continue;
            }

            match entry.file_type() {
                Ok(t) if t.is_dir() => exclusions.add_dir(path),
                Ok(_) => exclusions.add_file(path),
                Err(_) => exclusions.scope.add_unreadable_item(path),
            }
        }
    }

    fn apply_custom(&self, exclusions: &mut Exclusions) {
        for dir in &self.custom.dirs {
            exclusions.add_dir(dir.clone());
        }

        for file in &self.custom.files {
            exclusions.add_file(file.clone());
        }

        for ext in &self.custom.extensions {
            let ext = ext.trim_start_matches('.').to_lowercase();
            if !ext.is_empty() && !exclusions.extensions.contains(&ext) {
                exclusions.extensions.push(ext);
            }
        }

        for pattern in &self.custom.patterns {
            exclusions.matchers.push(WildMatch::new(pattern));
            exclusions.patterns.push(pattern.clone());
        }
    }
}

#[cfg(test)]
mod tests;
