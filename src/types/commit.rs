use crate::hash::Hash;

/// working-copy parent commit(s); two parents indicate an in-progress merge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParentCommits {
    pub parent1: Hash,
    pub parent2: Option<Hash>,
}

impl ParentCommits {
    pub fn new(parent1: Hash, parent2: Option<Hash>) -> Self {
        Self { parent1, parent2 }
    }

    pub fn single(parent1: Hash) -> Self {
        Self {
            parent1,
            parent2: None,
        }
    }

    /// true while a merge is in progress
    pub fn is_merge(&self) -> bool {
        self.parent2.is_some()
    }
}
