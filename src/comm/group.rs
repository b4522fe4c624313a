//! Process groups as immutable value records.
//!
//! A [`Group`] is an ordered list of distinct world ranks. The position of a
//! world rank in that list is its rank *within* the group, so renumbering
//! between the world and a group is a pure lookup and never aliases another
//! numbering space.

use std::sync::Arc;

use itertools::Itertools;

use crate::pio_error::PioError;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Group {
    ranks: Arc<[usize]>,
    /// (world rank, group rank), sorted by world rank.
    index: Arc<[(usize, usize)]>,
}

impl Group {
    /// Build a group from world ranks; duplicates are rejected.
    pub fn from_world_ranks(ranks: &[usize]) -> Result<Self, PioError> {
        let index: Vec<(usize, usize)> = ranks
            .iter()
            .enumerate()
            .map(|(g, &w)| (w, g))
            .sorted_unstable()
            .collect();
        if let Some(pair) = index.windows(2).find(|p| p[0].0 == p[1].0) {
            return Err(PioError::invalid(format!(
                "world rank {} listed twice in group",
                pair[0].0
            )));
        }
        Ok(Self {
            ranks: Arc::from(ranks),
            index: index.into(),
        })
    }

    /// World ranks `0..n`.
    pub fn world(n: usize) -> Self {
        Self {
            ranks: (0..n).collect::<Vec<_>>().into(),
            index: (0..n).map(|r| (r, r)).collect::<Vec<_>>().into(),
        }
    }

    pub fn empty() -> Self {
        Self {
            ranks: Arc::from(Vec::new()),
            index: Arc::from(Vec::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// World ranks in group order.
    pub fn world_ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// World rank of group member `rank`.
    pub fn world_rank(&self, rank: usize) -> Option<usize> {
        self.ranks.get(rank).copied()
    }

    /// Rank within this group of `world_rank`, if it is a member.
    pub fn rank_of(&self, world_rank: usize) -> Option<usize> {
        self.index
            .binary_search_by_key(&world_rank, |&(w, _)| w)
            .ok()
            .map(|i| self.index[i].1)
    }

    pub fn contains(&self, world_rank: usize) -> bool {
        self.rank_of(world_rank).is_some()
    }

    /// Subgroup made of the members at `ranks` (group-local numbering), in
    /// the order given.
    pub fn include(&self, ranks: &[usize]) -> Result<Self, PioError> {
        let mut out = Vec::with_capacity(ranks.len());
        for &r in ranks {
            let w = self.world_rank(r).ok_or_else(|| {
                PioError::invalid(format!("rank {r} outside group of {}", self.size()))
            })?;
            out.push(w);
        }
        Self::from_world_ranks(&out)
    }

    /// Members of `self` followed by members of `other` not already present.
    pub fn union(&self, other: &Group) -> Self {
        let mut out: Vec<usize> = self.ranks.to_vec();
        out.extend(other.ranks.iter().filter(|&&r| !self.contains(r)));
        let index = out
            .iter()
            .enumerate()
            .map(|(g, &w)| (w, g))
            .sorted_unstable()
            .collect::<Vec<_>>();
        Self {
            ranks: out.into(),
            index: index.into(),
        }
    }

    /// True when no world rank belongs to both groups.
    pub fn is_disjoint(&self, other: &Group) -> bool {
        !self.ranks.iter().any(|r| other.contains(*r))
    }

    /// Translate a rank of `self` into the numbering of `other`.
    pub fn translate(&self, rank: usize, other: &Group) -> Option<usize> {
        self.world_rank(rank).and_then(|w| other.rank_of(w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_renumbers() {
        let g = Group::from_world_ranks(&[10, 11, 12, 13]).unwrap();
        let sub = g.include(&[3, 1]).unwrap();
        assert_eq!(sub.world_ranks(), &[13, 11]);
        assert_eq!(sub.rank_of(11), Some(1));
        assert_eq!(g.translate(1, &sub), Some(1));
        assert_eq!(g.translate(0, &sub), None);
    }

    #[test]
    fn include_rejects_out_of_range_and_duplicates() {
        let g = Group::world(3);
        assert!(g.include(&[3]).is_err());
        assert!(g.include(&[1, 1]).is_err());
    }

    #[test]
    fn lookups_follow_group_order() {
        let g = Group::from_world_ranks(&[9, 2, 7, 0]).unwrap();
        let got: Vec<_> = [0, 2, 7, 9, 5].iter().map(|&w| g.rank_of(w)).collect();
        assert_eq!(got, vec![Some(3), Some(1), Some(2), Some(0), None]);
        let err = Group::from_world_ranks(&[4, 1, 4]).unwrap_err();
        assert!(err.to_string().contains("world rank 4"));
    }

    #[test]
    fn large_groups_build_quickly() {
        let ranks: Vec<usize> = (0..200_000).rev().collect();
        let g = Group::from_world_ranks(&ranks).unwrap();
        assert_eq!(g.rank_of(0), Some(199_999));
        assert_eq!(g.union(&Group::world(10)).size(), 200_000);
    }

    #[test]
    fn union_keeps_first_order() {
        let comp = Group::from_world_ranks(&[4, 5, 6]).unwrap();
        let io = Group::from_world_ranks(&[0, 1]).unwrap();
        let u = comp.union(&io);
        assert_eq!(u.world_ranks(), &[4, 5, 6, 0, 1]);
        assert!(comp.is_disjoint(&io));
        assert!(!u.is_disjoint(&io));
    }
}
