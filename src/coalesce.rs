//! # Address Coalescing
//!
//! Folds a scattered set of register addresses into the minimal list of
//! contiguous read blocks. One bulk read per block replaces one read per
//! register, which is the difference between a handful of round-trips and
//! dozens on a slow heat-pump controller.
//!
//! Guarantees:
//! - every input address falls in exactly one range
//! - every address inside a range was present in the input (no gaps read)
//! - ranges are non-overlapping, maximal and sorted ascending by start

/// Inclusive range of consecutive register addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    /// First address of the block.
    pub start: u16,
    /// Last address of the block (inclusive).
    pub end: u16,
}

impl AddressRange {
    /// Number of registers covered by the block.
    #[inline]
    pub fn count(&self) -> u16 {
        self.end - self.start + 1
    }

    /// Whether `address` falls inside the block.
    #[inline]
    pub fn contains(&self, address: u16) -> bool {
        address >= self.start && address <= self.end
    }
}

/// Coalesce distinct register addresses into minimal contiguous ranges.
///
/// The input does not need to be sorted; it must not contain duplicates
/// (the registry enforces address uniqueness before calling this).
///
/// # Example
///
/// ```rust
/// use pump2mqtt::coalesce::{coalesce_addresses, AddressRange};
///
/// let ranges = coalesce_addresses(&[10, 11, 12, 20, 21, 30]);
/// assert_eq!(
///     ranges,
///     vec![
///         AddressRange { start: 10, end: 12 },
///         AddressRange { start: 20, end: 21 },
///         AddressRange { start: 30, end: 30 },
///     ]
/// );
/// ```
pub fn coalesce_addresses(addresses: &[u16]) -> Vec<AddressRange> {
    let mut sorted: Vec<u16> = addresses.to_vec();
    sorted.sort_unstable();

    let mut ranges = Vec::new();
    let mut iter = sorted.into_iter();

    let Some(first) = iter.next() else {
        return ranges;
    };

    let mut current = AddressRange {
        start: first,
        end: first,
    };

    for address in iter {
        if address == current.end + 1 {
            current.end = address;
        } else {
            ranges.push(current);
            current = AddressRange {
                start: address,
                end: address,
            };
        }
    }
    ranges.push(current);

    ranges
}

/// Split any range wider than `max_count` registers into consecutive
/// blocks of at most `max_count`, preserving order and coverage.
///
/// Keeps the read plan inside the protocol's per-request block limit.
/// `max_count` must be non-zero.
pub fn split_ranges(ranges: Vec<AddressRange>, max_count: u16) -> Vec<AddressRange> {
    let mut split = Vec::with_capacity(ranges.len());
    for range in ranges {
        let mut start = range.start;
        while range.end - start >= max_count {
            split.push(AddressRange {
                start,
                end: start + max_count - 1,
            });
            start += max_count;
        }
        split.push(AddressRange {
            start,
            end: range.end,
        });
    }
    split
}

// ============================================================================
// Tests
// ============================================================================
