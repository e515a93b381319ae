//! Validated relative paths inside a synced tree.
//!
//! A [`SyncPath`] is an ordered list of non-empty name components; the empty
//! list is the tree root. Components never contain separators or traversal
//! tokens, so a validated path can be joined onto a store root without
//! escaping it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EspejoError, Result};

/// Relative path of an entry inside a synced tree.
///
/// # Example
///
/// ```rust
/// use espejo::SyncPath;
///
/// let path = SyncPath::parse("hello/fr/le_monde").unwrap();
/// assert_eq!(path.to_string(), "hello/fr/le_monde");
/// assert_eq!(path.name(), Some("le_monde"));
/// assert_eq!(path.parent().to_string(), "hello/fr");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncPath {
    elements: Vec<String>,
}

impl SyncPath {
    /// The tree root (empty component list).
    #[must_use]
    pub const fn root() -> Self {
        Self {
            elements: Vec::new(),
        }
    }

    /// Build a path from pre-validated components.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if any component is empty, contains a path
    /// separator, or is `.`/`..`.
    pub fn new<I, S>(elements: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let elements: Vec<String> = elements.into_iter().map(Into::into).collect();
        for el in &elements {
            validate_component(el)?;
        }
        Ok(Self { elements })
    }

    /// Parse a `/`-joined canonical string form.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on empty components (`a//b`), absolute
    /// paths, or traversal tokens.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        Self::new(s.split('/'))
    }

    /// Append one component, returning the child path.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `name` is not a valid component.
    pub fn join(&self, name: &str) -> Result<Self> {
        validate_component(name)?;
        let mut elements = self.elements.clone();
        elements.push(name.to_string());
        Ok(Self { elements })
    }

    /// Path of the containing directory; the root is its own parent.
    #[must_use]
    pub fn parent(&self) -> Self {
        let mut elements = self.elements.clone();
        elements.pop();
        Self { elements }
    }

    /// Final component, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.elements.last().map(String::as_str)
    }

    /// Path components in order.
    #[must_use]
    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// Whether this is the tree root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.elements.is_empty()
    }

    /// Number of components.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.elements.len()
    }

    /// Join onto a filesystem root. Safe because components are validated.
    #[must_use]
    pub fn to_fs_path(&self, root: &std::path::Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for el in &self.elements {
            out.push(el);
        }
        out
    }

    /// Reversible single-token encoding of the canonical form, used for
    /// scratch-file names so no scratch name collides with a real path.
    #[must_use]
    pub fn scratch_token(&self) -> String {
        hex::encode(self.to_string())
    }
}

impl std::fmt::Display for SyncPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.elements.join("/"))
    }
}

fn validate_component(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EspejoError::InvalidArgument(
            "empty path component".to_string(),
        ));
    }
    if name == "." || name == ".." {
        return Err(EspejoError::InvalidArgument(format!(
            "path traversal component: {name:?}"
        )));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(EspejoError::InvalidArgument(format!(
            "path component contains separator: {name:?}"
        )));
    }
    Ok(())
}
