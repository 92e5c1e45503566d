//! Folder hierarchy cache used to expand recursive path filters.

use std::collections::BTreeSet;
use std::ops::Bound;

#[derive(Debug, Clone, Default)]
pub struct PathTree {
    paths: BTreeSet<String>,
}

fn normalize(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

impl PathTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(normalize(path))
    }

    /// Caches `path` and all of its parent folders. Returns true when `path`
    /// itself was not known before.
    pub fn cache_path(&mut self, path: &str) -> bool {
        let path = normalize(path);
        if path.is_empty() || self.paths.contains(path) {
            return false;
        }
        let mut current = path;
        while let Some(idx) = current.rfind('/') {
            if idx == 0 {
                break;
            }
            current = &current[..idx];
            if !self.paths.insert(current.to_string()) {
                break;
            }
        }
        self.paths.insert(path.to_string())
    }

    /// Removes `path` and every descendant. Returns true when `path` existed.
    pub fn remove_path(&mut self, path: &str) -> bool {
        let path = normalize(path);
        let descendants: Vec<String> = self.descendants(path).map(str::to_string).collect();
        for descendant in descendants {
            self.paths.remove(&descendant);
        }
        self.paths.remove(path)
    }

    pub fn all_paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.paths.iter().map(String::as_str)
    }

    /// Sub folders of `base`: direct children only, or every descendant when
    /// `recurse` is on. `base` itself is not included.
    pub fn sub_paths(&self, base: &str, recurse: bool) -> Vec<String> {
        let base = normalize(base);
        let depth = base.trim_end_matches('/').len() + 1;
        self.descendants(base)
            .filter(|path| recurse || !path[depth..].contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn descendants<'a>(&'a self, base: &str) -> impl Iterator<Item = &'a str> + 'a {
        let prefix = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };
        self.paths
            .range::<String, _>((Bound::Included(prefix.clone()), Bound::Unbounded))
            .take_while(move |path| path.starts_with(&prefix))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caching_a_path_adds_its_parents() {
        let mut tree = PathTree::new();
        assert!(tree.cache_path("/Game/Props/Chairs"));
        assert!(!tree.cache_path("/Game/Props/Chairs/"));
        assert!(tree.contains("/Game"));
        assert!(tree.contains("/Game/Props"));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn sub_paths_respect_recursion_and_boundaries() {
        let mut tree = PathTree::new();
        tree.cache_path("/Game/Props/Chairs");
        tree.cache_path("/Game/Maps");
        tree.cache_path("/GameData/Tables");

        assert_eq!(tree.sub_paths("/Game", false), vec!["/Game/Maps", "/Game/Props"]);
        assert_eq!(
            tree.sub_paths("/Game", true),
            vec!["/Game/Maps", "/Game/Props", "/Game/Props/Chairs"]
        );
    }

    #[test]
    fn removing_a_path_drops_its_subtree() {
        let mut tree = PathTree::new();
        tree.cache_path("/Game/Props/Chairs");
        tree.cache_path("/Game/Maps");
        assert!(tree.remove_path("/Game/Props"));
        assert!(!tree.contains("/Game/Props/Chairs"));
        assert!(tree.contains("/Game/Maps"));
        assert!(!tree.remove_path("/Game/Props"));
    }
}
