use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Total-order token of a transaction slot.
///
/// Root slots are `[n]`. The k-th chain of a slot at `p` is `p ++ [k]`, so a
/// successor sorts after its origin, after every earlier chain of the same
/// origin (and their descendants), and before the origin's next sibling.
///
/// Every chain adds one level, so `n` retries or continuations of one root
/// leave an `n + 1` deep path. Up to four levels stay inline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    path: SmallVec<[u64; 4]>,
}

impl Position {
    pub fn root(slot: u64) -> Self {
        let mut path = SmallVec::new();
        path.push(slot);
        Self { path }
    }

    pub fn child(&self, ordinal: u64) -> Self {
        let mut path = self.path.clone();
        path.push(ordinal);
        Self { path }
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.path
    }

    pub fn precedes(&self, other: &Position) -> bool {
        self < other
    }

    /// True when `ancestor` is a strict prefix of this position.
    pub fn is_descendant_of(&self, ancestor: &Position) -> bool {
        self.path.len() > ancestor.path.len() && self.path.starts_with(&ancestor.path)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, part) in self.path.iter().enumerate() {
            if idx > 0 {
                f.write_str(".")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Position;
    use proptest::prelude::*;

    #[test]
    fn chained_successor_nests_between_origin_and_next_root() {
        let origin = Position::root(4);
        let first = origin.child(1);
        let grandchild = first.child(7);
        let second = origin.child(2);
        let next_root = Position::root(5);

        assert!(origin.precedes(&first));
        assert!(first.precedes(&grandchild));
        assert!(grandchild.precedes(&second));
        assert!(second.precedes(&next_root));
        assert!(grandchild.is_descendant_of(&origin));
        assert!(!origin.is_descendant_of(&origin));
        assert!(!second.is_descendant_of(&first));
        assert_eq!(grandchild.to_string(), "4.1.7");
    }

    #[test]
    fn each_chain_adds_one_level() {
        let mut position = Position::root(1);
        for step in 1..=12u64 {
            let next = position.child(1);
            assert!(position.precedes(&next));
            assert_eq!(next.depth(), step as usize + 1);
            position = next;
        }
        assert!(position.precedes(&Position::root(2)));
    }

    proptest! {
        #[test]
        fn later_chains_follow_all_descendants_of_earlier_chains(
            root in 0u64..1_000,
            first in 1u64..50,
            gap in 1u64..50,
            tail in prop::collection::vec(0u64..100, 0..4),
        ) {
            let origin = Position::root(root);
            let earlier = origin.child(first);
            let mut deep = earlier.clone();
            for part in &tail {
                deep = deep.child(*part);
            }
            let later = origin.child(first + gap);
            prop_assert!(origin.precedes(&deep));
            prop_assert!(deep.precedes(&later));
            prop_assert!(later.precedes(&Position::root(root + 1)));
        }
    }
}
