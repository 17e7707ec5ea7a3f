//! Hierarchical key formatting.
//!
//! Keys look like `{category}:{segment}.{segment}…`; patterns append a
//! trailing `.*` to address a whole subtree.

use std::fmt;

/// Builder for a fully qualified store key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keypath {
    category: String,
    segments: Vec<String>,
}

impl Keypath {
    pub fn new(category: impl Into<String>) -> Self {
        Self { category: category.into(), segments: Vec::new() }
    }

    /// Append a path segment.
    pub fn push(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// The formatted key.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Pattern matching every key strictly below this path.
    pub fn subtree(&self) -> String {
        if self.segments.is_empty() {
            format!("{}:*", self.category)
        } else {
            format!("{self}.*")
        }
    }
}

impl fmt::Display for Keypath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.segments.join("."))
    }
}
