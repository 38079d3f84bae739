use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Hierarchical string tuple naming a region of state.
///
/// Identifiers double as view keys. Two identifiers overlap when one is a
/// prefix of the other, so `["accounts"]` overlaps every `["accounts", ..]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier {
    segments: Vec<CompactString>,
}

pub type IdentifierSet = BTreeSet<Identifier>;

impl Identifier {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn segments(&self) -> &[CompactString] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn root(&self) -> Option<&str> {
        self.segments.first().map(CompactString::as_str)
    }

    pub fn child(&self, segment: impl Into<CompactString>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn is_prefix_of(&self, other: &Identifier) -> bool {
        self.segments.len() <= other.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    pub fn overlaps(&self, other: &Identifier) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, segment) in self.segments.iter().enumerate() {
            if idx > 0 {
                f.write_str("/")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl From<&str> for Identifier {
    fn from(path: &str) -> Self {
        Self::new(path.split('/').filter(|s| !s.is_empty()))
    }
}

/// Builds an [`IdentifierSet`] from `/`-separated paths.
pub fn identifier_set<'a>(paths: impl IntoIterator<Item = &'a str>) -> IdentifierSet {
    paths.into_iter().map(Identifier::from).collect()
}

pub fn sets_overlap(a: &IdentifierSet, b: &IdentifierSet) -> bool {
    a.iter().any(|x| b.iter().any(|y| x.overlaps(y)))
}
