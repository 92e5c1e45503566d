//! Class inheritance knowledge.
//!
//! Two sources feed it: classes registered by the host ("loaded" classes,
//! which may also implement interfaces) and the cached map harvested from
//! class-generator assets in the index. Queries merge both at request time,
//! with loaded classes taking precedence.

use std::collections::{BTreeMap, BTreeSet, HashMap};

const MAX_INHERITANCE_DEPTH: usize = 65536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedClass {
    pub name: String,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub deprecated: bool,
}

impl LoadedClass {
    pub fn new(name: &str, super_class: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            super_class: super_class.map(str::to_string),
            interfaces: Vec::new(),
            deprecated: false,
        }
    }

    pub fn implementing(mut self, interface: &str) -> Self {
        self.interfaces.push(interface.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassHierarchy {
    loaded: BTreeMap<String, LoadedClass>,
    cached: HashMap<String, Option<String>>,
}

impl ClassHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_class(&mut self, class: LoadedClass) {
        self.loaded.insert(class.name.clone(), class);
    }

    pub fn unregister_class(&mut self, name: &str) -> bool {
        self.loaded.remove(name).is_some()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded
            .get(name)
            .is_some_and(|class| !class.deprecated)
    }

    pub fn cache_generated_class(&mut self, generated: &str, parent: Option<&str>) {
        self.cached
            .insert(generated.to_string(), parent.map(str::to_string));
    }

    pub fn uncache_generated_class(&mut self, generated: &str) -> bool {
        self.cached.remove(generated).is_some()
    }

    pub fn cached_inheritance(&self) -> &HashMap<String, Option<String>> {
        &self.cached
    }

    pub fn clear_cached(&mut self) {
        self.cached.clear();
    }

    /// Child lists for every known parent, interfaces included.
    pub fn reverse_inheritance(&self) -> HashMap<String, BTreeSet<String>> {
        reverse_inheritance(&self.cached, self.loaded.values())
    }

    /// `classes` plus every transitive subclass, stopping at (and omitting)
    /// anything in `excluded`.
    pub fn sub_classes<'a>(
        &self,
        classes: impl IntoIterator<Item = &'a str>,
        excluded: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        sub_classes(&self.reverse_inheritance(), classes, excluded)
    }

    /// Parents of `class`, nearest first. `None` when the class is unknown or
    /// its parent chain loops.
    pub fn ancestors(&self, class: &str) -> Option<Vec<String>> {
        let mut inheritance: HashMap<&str, Option<&str>> = self
            .cached
            .iter()
            .map(|(name, parent)| (name.as_str(), parent.as_deref()))
            .collect();
        for loaded in self.loaded.values().filter(|c| !c.deprecated) {
            inheritance.insert(loaded.name.as_str(), loaded.super_class.as_deref());
        }
        ancestors(&inheritance, class)
    }
}

pub fn reverse_inheritance<'a>(
    cached: &HashMap<String, Option<String>>,
    loaded: impl IntoIterator<Item = &'a LoadedClass>,
) -> HashMap<String, BTreeSet<String>> {
    let mut reverse: HashMap<String, BTreeSet<String>> = HashMap::new();
    let mut loaded_names: BTreeSet<&str> = BTreeSet::new();

    for class in loaded.into_iter().filter(|c| !c.deprecated) {
        if let Some(parent) = class.super_class.as_deref() {
            reverse
                .entry(parent.to_string())
                .or_default()
                .insert(class.name.clone());
        }
        for interface in class.interfaces.iter() {
            reverse
                .entry(interface.clone())
                .or_default()
                .insert(class.name.clone());
        }
        loaded_names.insert(class.name.as_str());
    }

    for (class, parent) in cached.iter() {
        if loaded_names.contains(class.as_str()) {
            continue;
        }
        if let Some(parent) = parent {
            reverse
                .entry(parent.clone())
                .or_default()
                .insert(class.clone());
        }
    }
    reverse
}

pub fn sub_classes<'a>(
    reverse: &HashMap<String, BTreeSet<String>>,
    classes: impl IntoIterator<Item = &'a str>,
    excluded: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut stack: Vec<&str> = classes.into_iter().collect();
    while let Some(class) = stack.pop() {
        if excluded.contains(class) || out.contains(class) {
            continue;
        }
        out.insert(class.to_string());
        if let Some(children) = reverse.get(class) {
            stack.extend(children.iter().map(String::as_str));
        }
    }
    out
}

pub fn ancestors(inheritance: &HashMap<&str, Option<&str>>, class: &str) -> Option<Vec<String>> {
    if !inheritance.contains_key(class) {
        return None;
    }

    let mut out = Vec::new();
    let mut current = class;
    for _ in 0..MAX_INHERITANCE_DEPTH {
        match inheritance.get(current).copied().flatten() {
            Some(parent) => {
                if parent == class || out.iter().any(|seen| seen == parent) {
                    tracing::error!(class, "inheritance chain loops, parent classes are cyclic");
                    return None;
                }
                out.push(parent.to_string());
                current = parent;
            }
            _ => return Some(out),
        }
    }
    tracing::error!(class, "inheritance chain exceeded max depth {MAX_INHERITANCE_DEPTH}");
    None
}
