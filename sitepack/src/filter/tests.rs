use super::*;

use std::fs::{create_dir_all, write};

use tempfile::TempDir;

/// Creates a small site on disk.
fn make_site() -> (TempDir, SiteLayout) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    for d in [
        "wp-admin",
        "wp-includes",
        "wp-content/plugins/akismet",
        "wp-content/plugins/jetpack",
        "wp-content/mu-plugins",
        "wp-content/themes/twentytwenty",
        "wp-content/themes/storefront",
        "wp-content/uploads/2024",
        "wp-content/cache",
        "stats",
    ] {
        create_dir_all(root.join(d)).unwrap();
    }

    for f in [
        "index.php",
        "wp-load.php",
        "wp-config.php",
        ".htaccess",
        "google1234.html",
        "wp-content/debug.log",
        "wp-content/plugins/hello.php",
    ] {
        write(root.join(f), b"x").unwrap();
    }

    let mut layout = SiteLayout::standard(root);
    layout.plugins = vec![
        Extension {
            slug: "akismet/akismet.php".to_string(),
            active: true,
        },
        Extension {
            slug: "jetpack/jetpack.php".to_string(),
            active: false,
        },
        Extension {
            slug: "hello.php".to_string(),
            active: false,
        },
    ];
    layout.themes = vec![
        Extension {
            slug: "twentytwenty".to_string(),
            active: true,
        },
        Extension {
            slug: "storefront".to_string(),
            active: false,
        },
    ];

    (dir, layout)
}

#[test]
fn test_normalization() {
    let set = ComponentSet::new([
        Component::Plugins,
        Component::PluginsActive,
        Component::Themes,
    ]);
    assert!(set.contains(Component::PluginsActive));
    assert!(!set.contains(Component::Plugins));
    assert!(set.contains(Component::Themes));

    let set: ComponentSet = serde_json::from_str(r#"["themes", "themes-active"]"#).unwrap();
    assert!(set.contains(Component::ThemesActive));
    assert!(!set.contains(Component::Themes));
}

#[test]
fn test_parse_component() {
    assert_eq!(Component::PluginsActive, "plugins-active".parse().unwrap());
    assert_eq!(Component::Database, "db".parse().unwrap());
    "everything".parse::<Component>().unwrap_err();
}

#[test]
fn test_all_components() {
    let (_dir, layout) = make_site();
    let engine = ComponentFilterEngine::new(layout);

    let exclusions = engine.exclusions(&ComponentSet::all());
    assert!(exclusions.dirs.is_empty());
    assert!(exclusions.files.is_empty());
    assert!(exclusions.is_empty());
}

#[test]
fn test_database_only() {
    let (_dir, layout) = make_site();
    let root = layout.root.clone();
    let engine = ComponentFilterEngine::new(layout.clone());

    let exclusions = engine.exclusions(&ComponentSet::new([Component::Database]));

    // core
    assert!(exclusions.dirs.contains(&root.join("wp-admin")));
    assert!(exclusions.dirs.contains(&root.join("wp-includes")));
    assert!(exclusions.files.contains(&root.join("index.php")));

    // areas
    assert!(exclusions.dirs.contains(&layout.plugins_dir));
    assert!(exclusions.dirs.contains(&layout.mu_plugins_dir));
    assert!(exclusions.dirs.contains(&layout.themes_dir));
    assert!(exclusions.dirs.contains(&layout.uploads_dir));

    // other
    assert!(exclusions.dirs.contains(&root.join("stats")));
    assert!(exclusions.dirs.contains(&root.join("wp-content/cache")));
    assert!(exclusions.files.contains(&root.join("google1234.html")));
    assert!(exclusions.files.contains(&root.join("wp-content/debug.log")));

    // never part of "other"
    assert!(!exclusions.dirs.contains(&layout.content_dir));
    assert!(!exclusions.files.contains(&root.join("wp-config.php")));
    assert!(!exclusions.files.contains(&root.join(".htaccess")));

    // the database selection itself contributes nothing
    let without_db = engine.exclusions(&ComponentSet::new([]));
    let mut a = exclusions.dirs.clone();
    let mut b = without_db.dirs.clone();
    a.sort();
    b.sort();
    assert_eq!(a, b);
    assert_eq!(exclusions.files.len(), without_db.files.len());
}

#[test]
fn test_active_only() {
    let (_dir, layout) = make_site();
    let engine = ComponentFilterEngine::new(layout.clone());

    let components = ComponentSet::new([
        Component::Database,
        Component::Core,
        Component::PluginsActive,
        Component::ThemesActive,
        Component::Uploads,
        Component::Other,
    ]);
    let exclusions = engine.exclusions(&components);

    assert_eq!(
        vec![
            layout.plugins_dir.join("jetpack"),
            layout.themes_dir.join("storefront"),
        ],
        exclusions.dirs
    );
    assert_eq!(vec![layout.plugins_dir.join("hello.php")], exclusions.files);

    assert!(!exclusions.is_excluded(&layout.plugins_dir.join("akismet/akismet.php")));
    assert!(exclusions.is_excluded(&layout.plugins_dir.join("jetpack/jetpack.php")));
}

#[test]
fn test_custom_filters() {
    let (_dir, layout) = make_site();
    let cache = layout.content_dir.join("cache");
    let engine = ComponentFilterEngine::new(layout.clone()).with_custom_filters(CustomFilters {
        dirs: vec![cache.clone()],
        files: vec![],
        extensions: vec![".LOG".to_string()],
        patterns: vec!["*.bak".to_string()],
    });

    let exclusions = engine.exclusions(&ComponentSet::all());
    assert_eq!(vec![cache.clone()], exclusions.dirs);
    assert_eq!(vec!["log".to_string()], exclusions.extensions);

    assert!(exclusions.is_excluded(&cache.join("page.html")));
    assert!(exclusions.is_excluded(&layout.content_dir.join("debug.log")));
    assert!(exclusions.is_excluded(&layout.root.join("wp-config.php.bak")));
    assert!(!exclusions.is_excluded(&layout.root.join("wp-config.php")));
}

#[test]
fn test_unreadable_root() {
    let layout = SiteLayout::standard("/nonexistent/sitepack/root");
    let engine = ComponentFilterEngine::new(layout);

    let exclusions = engine.exclusions(&ComponentSet::new([Component::Database]));
    assert_eq!(2, exclusions.scope.unreadable_count);
    assert_eq!(2, exclusions.scope.unreadable.len());
}

#[test]
fn test_unreadable_cap() {
    let mut scope = FilterScope::default();
    for i in 0..(MAX_UNREADABLE_ITEMS + 10) {
        scope.add_unreadable_item(PathBuf::from(format!("/x/{}", i)));
    }

    assert_eq!(MAX_UNREADABLE_ITEMS, scope.unreadable.len());
    assert_eq!(MAX_UNREADABLE_ITEMS + 10, scope.unreadable_count);
}
