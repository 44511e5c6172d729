//! Site routing: which watched directory a path belongs to, and the set of
//! replication targets.
//!
//! The table is built once from configuration and shared read-only.

use crate::config::{SyncConfig, TransmitterEndpoint};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// A remote replication target.
#[derive(Debug, Clone)]
pub struct Site {
    pub name: String,
    pub transmitter: TransmitterEndpoint,
}

impl Site {
    /// Queue this site's task metadata is published on.
    pub fn queue_name(&self, queue_name: &str) -> String {
        format!("{}.{}", self.transmitter.queue_prefix, queue_name)
    }
}

/// A watched path resolved against the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedPath {
    /// The watched directory that contains the path.
    pub watch_dir: PathBuf,
    /// Path relative to the watched directory; receivers apply it under
    /// their storage root.
    pub rel: PathBuf,
}

/// Maps local paths to watched directories and lists the configured sites.
#[derive(Debug)]
pub struct SiteTable {
    watch_dirs: Vec<PathBuf>,
    sites: Vec<Arc<Site>>,
}

impl SiteTable {
    pub fn from_config(config: &SyncConfig) -> Self {
        let watch_dirs = config.watch_dirs.iter().map(|d| absolutize(d)).collect();
        let mut sites: Vec<Arc<Site>> = config
            .transmitters
            .iter()
            .map(|(name, transmitter)| {
                Arc::new(Site {
                    name: name.clone(),
                    transmitter: transmitter.clone(),
                })
            })
            .collect();
        sites.sort_by(|a, b| a.name.cmp(&b.name));
        Self { watch_dirs, sites }
    }

    /// Every configured site receives every task from a watched directory.
    pub fn sites(&self) -> &[Arc<Site>] {
        &self.sites
    }

    /// Resolve a local path to its watched directory, or `None` when the
    /// path is outside every watched directory (no replication).
    pub fn resolve(&self, path: &Path) -> Option<RoutedPath> {
        let candidate = absolutize(path);
        for dir in &self.watch_dirs {
            if let Ok(rel) = candidate.strip_prefix(dir) {
                return Some(RoutedPath {
                    watch_dir: dir.clone(),
                    rel: rel.to_path_buf(),
                });
            }
        }
        None
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.resolve(path).is_some()
    }
}

/// Make a path absolute against the current directory and normalize it
/// lexically, without touching the filesystem.
fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    normalize_path(&joined)
}

/// Normalize a path without requiring it to exist (unlike canonicalize).
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;

    fn table_for(dirs: &[&str]) -> SiteTable {
        let config: SyncConfig = toml::from_str(&format!(
            r#"
                queue_name = "sync"
                watch_dirs = [{}]

                [broker]
                host = "localhost"

                [transmitters.reserve]
                address = "127.0.0.1"
                port = 33800
                queue_prefix = "usync"
            "#,
            dirs.iter()
                .map(|d| format!("{d:?}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .unwrap();
        SiteTable::from_config(&config)
    }

    #[test]
    fn resolves_path_under_watch_dir() {
        let table = table_for(&["/srv/sites"]);
        let routed = table
            .resolve(Path::new("/srv/sites/a/b/c/abc-sitename/tmpFile.txt"))
            .unwrap();
        assert_eq!(routed.watch_dir, PathBuf::from("/srv/sites"));
        assert_eq!(routed.rel, PathBuf::from("a/b/c/abc-sitename/tmpFile.txt"));
    }

    #[test]
    fn unwatched_path_resolves_to_none() {
        let table = table_for(&["/srv/sites"]);
        assert!(table.resolve(Path::new("/tmp/elsewhere.txt")).is_none());
        assert!(!table.contains(Path::new("/tmp/elsewhere.txt")));
    }

    #[test]
    fn dot_segments_are_normalized() {
        let table = table_for(&["/srv/sites"]);
        let routed = table
            .resolve(Path::new("/srv/sites/./a/../a/file.txt"))
            .unwrap();
        assert_eq!(routed.rel, PathBuf::from("a/file.txt"));
    }

    #[test]
    fn queue_name_uses_site_prefix() {
        let table = table_for(&["/srv/sites"]);
        let site = &table.sites()[0];
        assert_eq!(site.queue_name("syncFiles"), "usync.syncFiles");
    }
}
