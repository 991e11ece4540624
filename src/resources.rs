//! Protected resource descriptors and request matching
//!
//! A resource maps a path prefix (plus an optional method set) to the roles
//! required to reach it. Matching always runs on the canonicalized request
//! path so `..` traversal cannot select a different resource than the one
//! actually being reached.

use serde::{Deserialize, Serialize};

/// A single protected URL subtree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Resource {
    /// Path prefix this resource covers; a trailing `/*` is accepted and
    /// ignored
    pub url: String,
    /// HTTP methods covered; empty means all methods
    pub methods: Vec<String>,
    /// Roles the identity must all carry
    pub roles: Vec<String>,
    /// Bypass authentication and admission entirely
    pub white_listed: bool,
}

impl Default for Resource {
    fn default() -> Self {
        Self {
            url: "/".to_string(),
            methods: Vec::new(),
            roles: Vec::new(),
            white_listed: false,
        }
    }
}

impl Resource {
    fn prefix(&self) -> &str {
        let p = self.url.trim_end_matches("/*");
        if p.is_empty() { "/" } else { p }
    }

    fn covers_path(&self, path: &str) -> bool {
        let prefix = self.prefix();
        if prefix == "/" {
            return true;
        }
        path == prefix || path.starts_with(&format!("{prefix}/"))
    }

    fn covers_method(&self, method: &str) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method) || m == "ANY")
    }
}

/// Canonicalize a request path: resolve `.` and `..` segments and collapse
/// duplicate slashes. The result is always absolute.
#[must_use]
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

/// True when the literal path carries a `..` traversal segment
#[must_use]
pub fn has_traversal(path: &str) -> bool {
    path.split('/').any(|segment| segment == "..")
}

/// Find the first configured resource covering the cleaned path and method
#[must_use]
pub fn match_resource<'a>(
    resources: &'a [Resource],
    method: &str,
    cleaned_path: &str,
) -> Option<&'a Resource> {
    resources
        .iter()
        .find(|r| r.covers_path(cleaned_path) && r.covers_method(method))
}
