use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Hierarchical, ordered name path of an object, unique within its type.
///
/// The display form joins components with `:`. The encoded form used inside
/// index cell names percent-encodes each component first, so an encoded name
/// never contains a `:` other than the component separators.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FqName(Vec<String>);

impl FqName {
    /// Build a name from its components. At least one component is required.
    pub fn new<I, S>(components: I) -> Result<Self, TypeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parts: Vec<String> = components.into_iter().map(Into::into).collect();
        if parts.is_empty() {
            return Err(TypeError::EmptyFqName);
        }
        Ok(Self(parts))
    }

    /// The name components in order.
    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The last component.
    pub fn leaf(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    /// The name of the owning object, or `None` for a top-level name.
    pub fn parent(&self) -> Option<FqName> {
        if self.0.len() < 2 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// A child name one level below this one.
    pub fn child(&self, leaf: impl Into<String>) -> FqName {
        let mut parts = self.0.clone();
        parts.push(leaf.into());
        Self(parts)
    }

    /// Encoded form used as the prefix of name-index cells.
    pub fn encode(&self) -> String {
        self.0
            .iter()
            .map(|c| urlencoding::encode(c).into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Inverse of [`FqName::encode`].
    pub fn decode(encoded: &str) -> Result<Self, TypeError> {
        let parts = encoded
            .split(':')
            .map(|c| {
                urlencoding::decode(c)
                    .map(|s| s.into_owned())
                    .map_err(|e| TypeError::InvalidFqName(format!("{encoded}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(parts)
    }
}

impl fmt::Debug for FqName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FqName({})", self)
    }
}

impl fmt::Display for FqName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(":"))
    }
}
