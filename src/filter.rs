//! Declarative asset queries.
//!
//! An [`AssetFilter`] combines up to five constraint sets. Inside a set the
//! values are alternatives (OR), across sets every active constraint must hold
//! (AND). The index evaluates filters against its secondary maps; the
//! [`AssetFilter::matches`] predicate evaluates them against loose records.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use crate::asset::AssetRecord;
use crate::error::FilterError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetFilter {
    pub package_names: BTreeSet<String>,
    pub package_paths: BTreeSet<String>,
    pub object_paths: BTreeSet<String>,
    pub class_names: BTreeSet<String>,
    /// `(tag, value)` pairs; a record passes when any pair matches exactly.
    pub tags_and_values: BTreeSet<(String, String)>,
    pub recursive_classes_exclusion_set: BTreeSet<String>,
    pub recursive_paths: bool,
    pub recursive_classes: bool,
    pub include_only_on_disk_assets: bool,
}

impl AssetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn package_name(mut self, name: &str) -> Self {
        self.package_names.insert(name.to_string());
        self
    }

    pub fn package_path(mut self, path: &str) -> Self {
        self.package_paths.insert(path.to_string());
        self
    }

    pub fn object_path(mut self, path: &str) -> Self {
        self.object_paths.insert(path.to_string());
        self
    }

    pub fn class_name(mut self, class: &str) -> Self {
        self.class_names.insert(class.to_string());
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags_and_values
            .insert((key.to_string(), value.to_string()));
        self
    }

    pub fn exclude_class(mut self, class: &str) -> Self {
        self.recursive_classes_exclusion_set
            .insert(class.to_string());
        self
    }

    pub fn recursive_paths(mut self, recursive: bool) -> Self {
        self.recursive_paths = recursive;
        self
    }

    pub fn recursive_classes(mut self, recursive: bool) -> Self {
        self.recursive_classes = recursive;
        self
    }

    pub fn only_on_disk(mut self, only_on_disk: bool) -> Self {
        self.include_only_on_disk_assets = only_on_disk;
        self
    }

    /// True when no constraint set is populated. Flags alone do not count.
    pub fn is_empty(&self) -> bool {
        self.package_names.is_empty()
            && self.package_paths.is_empty()
            && self.object_paths.is_empty()
            && self.class_names.is_empty()
            && self.tags_and_values.is_empty()
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive_paths || self.recursive_classes
    }

    /// Rejects empty keys, and recursion flags when `allow_recursion` is off.
    pub fn validate(&self, allow_recursion: bool) -> Result<(), FilterError> {
        let checks: [(&BTreeSet<String>, &'static str); 4] = [
            (&self.package_names, "package name"),
            (&self.package_paths, "package path"),
            (&self.object_paths, "object path"),
            (&self.class_names, "class name"),
        ];
        for (set, field) in checks {
            if set.iter().any(|value| value.is_empty()) {
                return Err(FilterError::EmptyKey { field });
            }
        }
        if self.tags_and_values.iter().any(|(key, _)| key.is_empty()) {
            return Err(FilterError::EmptyKey { field: "tag" });
        }
        if !allow_recursion && self.is_recursive() {
            return Err(FilterError::RecursionNotExpanded);
        }
        Ok(())
    }

    /// Validation for the constrained query path: also rejects empty filters.
    pub fn validate_constrained(&self, allow_recursion: bool) -> Result<(), FilterError> {
        self.validate(allow_recursion)?;
        if self.is_empty() {
            return Err(FilterError::NoConstraints);
        }
        Ok(())
    }

    pub fn matches_tags(&self, record: &AssetRecord) -> bool {
        self.tags_and_values.is_empty()
            || self
                .tags_and_values
                .iter()
                .any(|(key, value)| record.tag(key) == Some(value.as_str()))
    }

    /// Evaluates the filter against one record without any index.
    ///
    /// `requested_classes` is the expanded class set to use when
    /// `recursive_classes` is on; paths use prefix matching when
    /// `recursive_paths` is on.
    pub fn matches(&self, record: &AssetRecord, requested_classes: Option<&HashSet<String>>) -> bool {
        if !self.package_names.is_empty() && !self.package_names.contains(&record.package_name) {
            return false;
        }

        if !self.package_paths.is_empty() {
            let passes = if self.recursive_paths {
                self.package_paths
                    .iter()
                    .any(|path| is_path_or_descendant(&record.package_path, path))
            } else {
                self.package_paths.contains(&record.package_path)
            };
            if !passes {
                return false;
            }
        }

        if !self.object_paths.is_empty() && !self.object_paths.contains(&record.object_path) {
            return false;
        }

        if !self.class_names.is_empty() {
            let passes = match requested_classes {
                Some(classes) if self.recursive_classes => classes.contains(&record.class_name),
                _ => self.class_names.contains(&record.class_name),
            };
            if !passes {
                return false;
            }
        }

        self.matches_tags(record)
    }
}

/// True for `path == base` or `path` below `base` on a `/` boundary. A base of
/// a single character (the root `/`) accepts everything under it.
pub fn is_path_or_descendant(path: &str, base: &str) -> bool {
    let Some(rest) = path.strip_prefix(base) else {
        return false;
    };
    base.len() == 1 || rest.is_empty() || rest.starts_with('/')
}

/// Linear merge intersection of two slices sorted under `cmp`.
pub fn merge_intersect<T: Copy>(a: &[T], b: &[T], mut cmp: impl FnMut(&T, &T) -> Ordering) -> Vec<T> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut ai, mut bi) = (0usize, 0usize);
    while ai < a.len() && bi < b.len() {
        match cmp(&a[ai], &b[bi]) {
            Ordering::Less => ai += 1,
            Ordering::Greater => bi += 1,
            Ordering::Equal => {
                out.push(a[ai]);
                ai += 1;
                bi += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_keys_and_unexpanded_recursion() {
        let filter = AssetFilter::new().class_name("");
        assert_eq!(
            filter.validate(true),
            Err(FilterError::EmptyKey { field: "class name" })
        );

        let filter = AssetFilter::new().package_path("/Game").recursive_paths(true);
        assert!(filter.validate(true).is_ok());
        assert_eq!(filter.validate(false), Err(FilterError::RecursionNotExpanded));

        assert_eq!(
            AssetFilter::new().only_on_disk(true).validate_constrained(true),
            Err(FilterError::NoConstraints)
        );
    }

    #[test]
    fn recursive_path_matching_respects_separators() {
        assert!(is_path_or_descendant("/Game/Props", "/Game"));
        assert!(is_path_or_descendant("/Game", "/Game"));
        assert!(!is_path_or_descendant("/GameData", "/Game"));
        assert!(is_path_or_descendant("/Engine/Fonts", "/"));
    }

    #[test]
    fn matches_requires_every_active_constraint() {
        let chair = AssetRecord::new("/Game/Props/Chair", "Chair", "StaticMesh").with_tag("Color", "Red");
        let filter = AssetFilter::new()
            .package_path("/Game")
            .recursive_paths(true)
            .class_name("StaticMesh")
            .tag("Color", "Red")
            .tag("Color", "Green");
        assert!(filter.matches(&chair, None));

        let filter = filter.object_path("/Game/Props/Table.Table");
        assert!(!filter.matches(&chair, None));
    }

    #[test]
    fn merge_intersect_keeps_common_elements() {
        let a = [1, 3, 5, 7, 9];
        let b = [2, 3, 4, 9, 10];
        assert_eq!(merge_intersect(&a, &b, |x, y| x.cmp(y)), vec![3, 9]);
        assert!(merge_intersect(&a, &[], |x: &i32, y: &i32| x.cmp(y)).is_empty());
    }
}
