use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AllocError, AllocResult};

/// A closed interval `[start, end]` of ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdRange {
    pub start: u64,
    pub end: u64,
}

impl IdRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// A range holding a single id.
    pub fn unit(id: u64) -> Self {
        Self { start: id, end: id }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.start <= id && id <= self.end
    }

    pub fn overlaps(&self, other: &IdRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Number of ids in the range.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Debug for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Which end of the free space an allocation is taken from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocPolicy {
    /// First free unit from the low end.
    #[default]
    Ascending,
    /// First free unit from the high end.
    Descending,
}

/// Sort `ranges` and reject inverted or overlapping ones.
pub fn validate_ranges(path: &str, mut ranges: Vec<IdRange>) -> AllocResult<Vec<IdRange>> {
    for r in &ranges {
        if r.start > r.end {
            return Err(AllocError::InvalidRange {
                path: path.to_string(),
                start: r.start,
                end: r.end,
            });
        }
    }
    ranges.sort();
    for pair in ranges.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(AllocError::OverlappingRanges {
                path: path.to_string(),
                first: pair[0].to_string(),
                second: pair[1].to_string(),
            });
        }
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_is_inclusive() {
        let r = IdRange::new(5, 9);
        assert!(r.contains(5));
        assert!(r.contains(9));
        assert!(!r.contains(4));
        assert!(!r.contains(10));
        assert_eq!(r.size(), 5);
        assert_eq!(IdRange::unit(7).size(), 1);
    }

    #[test]
    fn overlap_detection() {
        assert!(IdRange::new(1, 5).overlaps(&IdRange::new(5, 9)));
        assert!(IdRange::new(1, 10).overlaps(&IdRange::new(3, 4)));
        assert!(!IdRange::new(1, 4).overlaps(&IdRange::new(5, 9)));
    }

    #[test]
    fn validate_sorts() {
        let ranges = validate_ranges("p", vec![IdRange::new(20, 30), IdRange::new(1, 10)]).unwrap();
        assert_eq!(ranges, vec![IdRange::new(1, 10), IdRange::new(20, 30)]);
    }

    #[test]
    fn validate_rejects_overlap() {
        let err = validate_ranges("p", vec![IdRange::new(1, 10), IdRange::new(10, 20)]).unwrap_err();
        assert!(matches!(err, AllocError::OverlappingRanges { .. }));
    }

    #[test]
    fn validate_rejects_inverted() {
        let err = validate_ranges("p", vec![IdRange::new(9, 1)]).unwrap_err();
        assert!(matches!(err, AllocError::InvalidRange { start: 9, end: 1, .. }));
    }

    #[test]
    fn policy_serde_names() {
        assert_eq!(serde_json::to_string(&AllocPolicy::Descending).unwrap(), "\"descending\"");
    }
}
