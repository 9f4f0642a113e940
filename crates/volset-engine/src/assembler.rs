//! Set assembler
//!
//! Maps logical byte ranges of a set onto its members and answers what a
//! level allows. Each level is a variant of [`SetLayout`]; the mapping and
//! capability questions go through the [`ExtentMapping`] and
//! [`CapabilityRules`] traits.

use std::sync::atomic::{AtomicUsize, Ordering};
use volset_common::{Error, MemberState, RemovalPolicy, Result, SetLevel};

/// A piece of a logical request that lands on one member
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Member index
    pub member: usize,
    /// Offset in the member's data region
    pub member_offset: u64,
    /// Length in bytes
    pub length: u64,
    /// Offset into the caller's buffer
    pub buffer_offset: usize,
}

/// Logical to member address translation
pub trait ExtentMapping {
    /// Bytes exposed by the set
    fn logical_size(&self) -> u64;

    /// Split a logical range into member segments, in buffer order
    fn map(&self, offset: u64, length: u64) -> Result<Vec<Segment>>;

    /// Reject ranges outside the logical size
    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        let end = offset.checked_add(length);
        if end.is_none_or(|end| end > self.logical_size()) {
            return Err(Error::invalid_argument(format!(
                "range {offset}+{length} outside logical size {}",
                self.logical_size()
            )));
        }
        Ok(())
    }
}

/// What a level allows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Members can join after creation
    pub can_add_members: bool,
    /// Hot spares are supported
    pub can_add_spares: bool,
    /// Members may differ in size
    pub sizes_can_vary: bool,
    /// Which members may leave
    pub removal_policy: RemovalPolicy,
}

/// Fixed capability table per level
pub trait CapabilityRules {
    /// Capabilities of this level
    fn capabilities(&self) -> Capabilities;
}

impl CapabilityRules for SetLevel {
    fn capabilities(&self) -> Capabilities {
        match self {
            Self::Stripe => Capabilities {
                can_add_members: false,
                can_add_spares: false,
                sizes_can_vary: false,
                removal_policy: RemovalPolicy::None,
            },
            Self::Concat => Capabilities {
                can_add_members: true,
                can_add_spares: false,
                sizes_can_vary: true,
                removal_policy: RemovalPolicy::LastMember,
            },
            Self::Mirror => Capabilities {
                can_add_members: true,
                can_add_spares: true,
                sizes_can_vary: false,
                removal_policy: RemovalPolicy::AnyMember,
            },
            Self::Lvg => Capabilities {
                can_add_members: true,
                can_add_spares: false,
                sizes_can_vary: true,
                removal_policy: RemovalPolicy::AnyMember,
            },
        }
    }
}

/// Member placement in a concatenated address space
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberRange {
    /// Member index
    pub member: usize,
    /// First logical byte
    pub start: u64,
    /// Data bytes
    pub size: u64,
}

impl MemberRange {
    const fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Members laid end to end, possibly with holes left by removed members
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConcatMap {
    ranges: Vec<MemberRange>,
}

impl ConcatMap {
    /// Build from member ranges in any order
    #[must_use]
    pub fn new(mut ranges: Vec<MemberRange>) -> Self {
        ranges.retain(|r| r.size > 0);
        ranges.sort_by_key(|r| r.start);
        Self { ranges }
    }

    /// Build with each member starting where the previous one ends
    #[must_use]
    pub fn cumulative(sizes: &[u64]) -> Self {
        let mut start = 0;
        let ranges = sizes
            .iter()
            .enumerate()
            .map(|(member, &size)| {
                let range = MemberRange {
                    member,
                    start,
                    size,
                };
                start += size;
                range
            })
            .collect();
        Self::new(ranges)
    }

    /// Member ranges sorted by start
    #[must_use]
    pub fn ranges(&self) -> &[MemberRange] {
        &self.ranges
    }

    /// Range of one member
    #[must_use]
    pub fn range_of(&self, member: usize) -> Option<MemberRange> {
        self.ranges.iter().copied().find(|r| r.member == member)
    }
}

impl ExtentMapping for ConcatMap {
    fn logical_size(&self) -> u64 {
        self.ranges.last().map_or(0, MemberRange::end)
    }

    fn map(&self, offset: u64, length: u64) -> Result<Vec<Segment>> {
        self.check_range(offset, length)?;
        let mut segments = Vec::new();
        let mut pos = offset;
        let end = offset + length;

        while pos < end {
            let index = self.ranges.partition_point(|r| r.start <= pos);
            let range = index
                .checked_sub(1)
                .map(|i| self.ranges[i])
                .filter(|r| pos < r.end())
                .ok_or_else(|| {
                    Error::invalid_argument(format!("offset {pos} falls outside every member"))
                })?;
            let take = (end - pos).min(range.end() - pos);
            segments.push(Segment {
                member: range.member,
                member_offset: pos - range.start,
                length: take,
                buffer_offset: (pos - offset) as usize,
            });
            pos += take;
        }
        Ok(segments)
    }
}

/// Chunks distributed round robin across equally sized members
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StripeMap {
    members: usize,
    chunk_size: u64,
    member_size: u64,
}

impl StripeMap {
    /// Create a stripe of `members` members, each `member_size` bytes
    #[must_use]
    pub const fn new(members: usize, chunk_size: u64, member_size: u64) -> Self {
        Self {
            members,
            chunk_size,
            member_size,
        }
    }
}

impl ExtentMapping for StripeMap {
    fn logical_size(&self) -> u64 {
        self.members as u64 * self.member_size
    }

    fn map(&self, offset: u64, length: u64) -> Result<Vec<Segment>> {
        self.check_range(offset, length)?;
        let mut segments = Vec::new();
        let mut pos = offset;
        let end = offset + length;
        let width = self.members as u64;

        while pos < end {
            let chunk = pos / self.chunk_size;
            let within = pos % self.chunk_size;
            let take = (end - pos).min(self.chunk_size - within);
            segments.push(Segment {
                member: (chunk % width) as usize,
                member_offset: (chunk / width) * self.chunk_size + within,
                length: take,
                buffer_offset: (pos - offset) as usize,
            });
            pos += take;
        }
        Ok(segments)
    }
}

/// Every member holds the full logical range
#[derive(Debug)]
pub struct MirrorMap {
    copies: usize,
    size: u64,
    next_reader: AtomicUsize,
}

impl Clone for MirrorMap {
    fn clone(&self) -> Self {
        Self {
            copies: self.copies,
            size: self.size,
            next_reader: AtomicUsize::new(self.next_reader.load(Ordering::Relaxed)),
        }
    }
}

impl MirrorMap {
    /// Create a mirror of `copies` members of `size` bytes each
    #[must_use]
    pub const fn new(copies: usize, size: u64) -> Self {
        Self {
            copies,
            size,
            next_reader: AtomicUsize::new(0),
        }
    }

    /// Pick the member to read from, rotating over Open members
    #[must_use]
    pub fn select_reader(&self, states: &[MemberState]) -> Option<usize> {
        let count = states.len();
        if count == 0 {
            return None;
        }
        let start = self.next_reader.fetch_add(1, Ordering::Relaxed) % count;
        (0..count)
            .map(|step| (start + step) % count)
            .find(|&i| states[i] == MemberState::Open)
    }
}

impl ExtentMapping for MirrorMap {
    fn logical_size(&self) -> u64 {
        self.size
    }

    /// One segment per copy
    fn map(&self, offset: u64, length: u64) -> Result<Vec<Segment>> {
        self.check_range(offset, length)?;
        Ok((0..self.copies)
            .map(|member| Segment {
                member,
                member_offset: offset,
                length,
                buffer_offset: 0,
            })
            .collect())
    }
}

/// Address mapping for each set level
#[derive(Clone, Debug)]
pub enum SetLayout {
    /// Concatenation
    Concat(ConcatMap),
    /// Mirror
    Mirror(MirrorMap),
    /// Stripe
    Stripe(StripeMap),
    /// Logical volume group: a concatenation addressed through volume extents
    Lvg(ConcatMap),
}

impl SetLayout {
    /// Level of this layout
    #[must_use]
    pub const fn level(&self) -> SetLevel {
        match self {
            Self::Concat(_) => SetLevel::Concat,
            Self::Mirror(_) => SetLevel::Mirror,
            Self::Stripe(_) => SetLevel::Stripe,
            Self::Lvg(_) => SetLevel::Lvg,
        }
    }

    fn mapping(&self) -> &dyn ExtentMapping {
        match self {
            Self::Concat(map) | Self::Lvg(map) => map,
            Self::Mirror(map) => map,
            Self::Stripe(map) => map,
        }
    }
}

impl ExtentMapping for SetLayout {
    fn logical_size(&self) -> u64 {
        self.mapping().logical_size()
    }

    fn map(&self, offset: u64, length: u64) -> Result<Vec<Segment>> {
        self.mapping().map(offset, length)
    }
}

impl CapabilityRules for SetLayout {
    fn capabilities(&self) -> Capabilities {
        self.level().capabilities()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_table() {
        let stripe = SetLevel::Stripe.capabilities();
        assert!(!stripe.can_add_members);
        assert_eq!(stripe.removal_policy, RemovalPolicy::None);

        let concat = SetLevel::Concat.capabilities();
        assert!(concat.can_add_members && concat.sizes_can_vary);
        assert_eq!(concat.removal_policy, RemovalPolicy::LastMember);

        let mirror = SetLevel::Mirror.capabilities();
        assert!(mirror.can_add_spares && !mirror.sizes_can_vary);
        assert_eq!(mirror.removal_policy, RemovalPolicy::AnyMember);

        let lvg = SetLevel::Lvg.capabilities();
        assert!(lvg.can_add_members && !lvg.can_add_spares);
        assert_eq!(lvg.removal_policy, RemovalPolicy::AnyMember);
    }

    #[test]
    fn test_concat_splits_at_member_boundary() {
        let map = ConcatMap::cumulative(&[100, 50, 200]);
        assert_eq!(map.logical_size(), 350);

        let segments = map.map(90, 70).unwrap();
        assert_eq!(
            segments,
            vec![
                Segment {
                    member: 0,
                    member_offset: 90,
                    length: 10,
                    buffer_offset: 0
                },
                Segment {
                    member: 1,
                    member_offset: 0,
                    length: 50,
                    buffer_offset: 10
                },
                Segment {
                    member: 2,
                    member_offset: 0,
                    length: 10,
                    buffer_offset: 60
                },
            ]
        );
        assert!(map.map(340, 20).is_err());
    }

    #[test]
    fn test_concat_with_hole() {
        let map = ConcatMap::new(vec![
            MemberRange {
                member: 2,
                start: 300,
                size: 100,
            },
            MemberRange {
                member: 0,
                start: 0,
                size: 100,
            },
        ]);
        assert_eq!(map.logical_size(), 400);
        assert_eq!(map.map(310, 10).unwrap()[0].member, 2);
        assert!(map.map(150, 10).is_err());
        assert_eq!(map.range_of(2).map(|r| r.start), Some(300));
    }

    #[test]
    fn test_stripe_round_robin() {
        let map = StripeMap::new(3, 4096, 4 * 4096);
        assert_eq!(map.logical_size(), 12 * 4096);

        let segments = map.map(4096 * 4 + 100, 8192).unwrap();
        // chunk 4 -> member 1 row 1, chunk 5 -> member 2 row 1, chunk 6 -> member 0 row 2
        let placed: Vec<_> = segments
            .iter()
            .map(|s| (s.member, s.member_offset, s.length))
            .collect();
        assert_eq!(
            placed,
            vec![
                (1, 4096 + 100, 4096 - 100),
                (2, 4096, 4096),
                (0, 2 * 4096, 100)
            ]
        );
        assert_eq!(segments[2].buffer_offset, 8092);
    }

    #[test]
    fn test_mirror_reader_rotation_skips_inactive() {
        let map = MirrorMap::new(3, 1 << 20);
        let states = [MemberState::Open, MemberState::Rebuilding, MemberState::Open];
        let picks: Vec<_> = (0..4).filter_map(|_| map.select_reader(&states)).collect();
        assert!(picks.iter().all(|&i| i != 1));
        assert!(picks.contains(&0) && picks.contains(&2));
        assert_eq!(map.select_reader(&[MemberState::Broken]), None);
        assert_eq!(map.map(0, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_layout_dispatch() {
        let layout = SetLayout::Lvg(ConcatMap::cumulative(&[10, 10]));
        assert_eq!(layout.level(), SetLevel::Lvg);
        assert_eq!(layout.logical_size(), 20);
        assert_eq!(
            layout.capabilities().removal_policy,
            RemovalPolicy::AnyMember
        );
    }
}
