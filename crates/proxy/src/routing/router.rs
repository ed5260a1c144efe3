//! Longest-prefix path router.

use std::collections::HashMap;

pub const DEFAULT_ROUTER: &str = "default";

/// Result of a successful lookup.
#[derive(Debug, PartialEq, Eq)]
pub struct RouteMatch<'a, T> {
    pub pattern: &'a str,
    pub target: &'a T,
    /// Request path with the matched prefix stripped, always starting with `/`.
    pub path: String,
}

/// Prefix index over `/`-delimited path segments.
///
/// Lookup cost is linear in the path length: the path is scanned right to
/// left and each `/` boundary is tried as a prefix, longest first.
#[derive(Debug, Clone)]
pub struct PrefixRouter<T> {
    entries: HashMap<String, T>,
}

impl<T> Default for PrefixRouter<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> PrefixRouter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(&self) -> &'static str {
        DEFAULT_ROUTER
    }

    pub fn insert(&mut self, pattern: &str, target: T) -> Option<T> {
        self.entries.insert(pattern.to_string(), target)
    }

    pub fn remove(&mut self, pattern: &str) -> Option<T> {
        self.entries.remove(pattern)
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.entries.contains_key(pattern)
    }

    pub fn get(&self, pattern: &str) -> Option<&T> {
        self.entries.get(pattern)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered prefixes, sorted.
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.entries.keys().cloned().collect();
        patterns.sort();
        patterns
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (String, T)> + '_ {
        self.entries.drain()
    }

    /// Find the longest registered prefix of `path`.
    ///
    /// `/api` matches `/api`, `/api/` and `/api/users` but not `/apix`.
    /// A registered `/` catches every path and leaves it unchanged.
    pub fn route(&self, path: &str) -> Option<RouteMatch<'_, T>> {
        if path != "/" {
            if let Some((pattern, target)) = self.entries.get_key_value(path) {
                return Some(RouteMatch {
                    pattern,
                    target,
                    path: "/".to_string(),
                });
            }
        }

        for (i, byte) in path.bytes().enumerate().rev() {
            if byte != b'/' || i == 0 {
                continue;
            }
            if let Some((pattern, target)) = self.entries.get_key_value(&path[..i]) {
                return Some(RouteMatch {
                    pattern,
                    target,
                    path: path[i..].to_string(),
                });
            }
        }

        self.entries
            .get_key_value("/")
            .map(|(pattern, target)| RouteMatch {
                pattern,
                target,
                path: path.to_string(),
            })
    }
}
