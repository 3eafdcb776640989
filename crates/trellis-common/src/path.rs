// Path normalization for the broker's node tree.
use crate::{Error, Result};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Prefix under which every connected responder is mounted.
pub const DOWNSTREAM: &str = "/downstream";

/// A normalized node path.
///
/// Paths below `/downstream/<link>` are remote: they belong to the responder
/// connected as `<link>`, and `base_path` is the same path as the responder
/// sees it (the `/downstream/<link>` prefix stripped). Everything else is
/// broker-local.
///
/// ```
/// use trellis_common::ParsedPath;
///
/// let path = ParsedPath::parse("/downstream/plc//temp/").expect("parse");
/// assert_eq!(path.as_str(), "/downstream/plc/temp");
/// assert!(path.is_remote());
/// assert_eq!(path.link(), Some("plc"));
/// assert_eq!(path.base_path(), "/temp");
/// ```
#[derive(Debug, Clone)]
pub struct ParsedPath {
    full: String,
    link: Option<String>,
    base: String,
}

impl ParsedPath {
    pub fn parse(input: &str) -> Result<Self> {
        if !input.starts_with('/') {
            return Err(Error::InvalidPath(input.to_string()));
        }
        let mut segments = Vec::new();
        for segment in input.split('/').filter(|segment| !segment.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(Error::InvalidPath(input.to_string()));
            }
            segments.push(segment);
        }
        let full = if segments.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", segments.join("/"))
        };

        let (link, base) = match segments.as_slice() {
            ["downstream", link, rest @ ..] => {
                let base = if rest.is_empty() {
                    "/".to_string()
                } else {
                    format!("/{}", rest.join("/"))
                };
                (Some((*link).to_string()), base)
            }
            _ => (None, full.clone()),
        };
        Ok(Self { full, link, base })
    }

    /// Path of the link root for `link`, e.g. `/downstream/plc`.
    pub fn link_root(link: &str) -> Result<Self> {
        if link.is_empty() || link.contains('/') {
            return Err(Error::InvalidPath(link.to_string()));
        }
        Self::parse(&format!("{DOWNSTREAM}/{link}"))
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn is_remote(&self) -> bool {
        self.link.is_some()
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    pub fn base_path(&self) -> &str {
        &self.base
    }

    /// True for `/downstream/<link>` itself.
    pub fn is_link_root(&self) -> bool {
        self.is_remote() && self.base == "/"
    }
}

impl PartialEq for ParsedPath {
    fn eq(&self, other: &Self) -> bool {
        self.full == other.full
    }
}

impl Eq for ParsedPath {}

impl Hash for ParsedPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full.hash(state);
    }
}

impl fmt::Display for ParsedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_duplicate_and_trailing_slashes() {
        let path = ParsedPath::parse("//downstream///a/b/").expect("parse");
        assert_eq!(path.as_str(), "/downstream/a/b");
        assert_eq!(path.base_path(), "/b");
    }

    #[test]
    fn root_and_local_paths_are_not_remote() {
        let root = ParsedPath::parse("/").expect("root");
        assert_eq!(root.as_str(), "/");
        assert!(!root.is_remote());

        let downstream = ParsedPath::parse("/downstream").expect("downstream");
        assert!(!downstream.is_remote());
        assert_eq!(downstream.base_path(), "/downstream");
    }

    #[test]
    fn link_root_has_slash_base() {
        let path = ParsedPath::parse("/downstream/plc").expect("parse");
        assert!(path.is_link_root());
        assert_eq!(path.base_path(), "/");
        assert_eq!(ParsedPath::link_root("plc").expect("root"), path);
    }

    #[test]
    fn rejects_relative_and_dot_segments() {
        assert!(matches!(
            ParsedPath::parse("downstream/a"),
            Err(Error::InvalidPath(_))
        ));
        assert!(ParsedPath::parse("/downstream/a/../b").is_err());
        assert!(ParsedPath::parse("/a/./b").is_err());
        assert!(ParsedPath::link_root("a/b").is_err());
        assert!(ParsedPath::link_root("").is_err());
    }

    #[test]
    fn equality_ignores_original_spelling() {
        let a = ParsedPath::parse("/downstream/x/y").expect("a");
        let b = ParsedPath::parse("/downstream//x/y/").expect("b");
        assert_eq!(a, b);
        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
