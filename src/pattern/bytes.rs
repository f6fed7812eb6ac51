//! Single byte patterns with wildcards and address capture.
//!
//! A [`BytePattern`] is compiled into a list of segments, each a run of bytes of one kind:
//!
//! - **Literal** bytes that must match exactly
//! - **Masked literal** bytes where only the masked bits must match
//! - **Any** bytes that match a single byte of any value
//! - **Any repeating** runs that match zero or more bytes
//! - **Address** bytes that match anything and are captured, in increasing memory order
//!
//! Matching proceeds left to right. An any-repeating segment scans forward for the next literal
//! and re-enters matching from there; when the remainder fails, scanning resumes one byte past the
//! last literal hit, so a pattern never backtracks more than linearly over its input.
//!
//! # Pattern Encodings
//!
//! Patterns are written either as `u16` items (see [`BytePattern::new`]) or as parallel
//! mask/pattern byte arrays (see [`BytePattern::from_mask`]).
//!
//! ```rust
//! use detourcore::pattern::{AddressKind, AddressMeaning, BytePattern, ADDRESS};
//!
//! // jmp rel32; pop rdi
//! let meaning = AddressMeaning::relative(AddressKind::REL32, 5)?;
//! let pattern = BytePattern::new(meaning, true, &[0xe9, ADDRESS, ADDRESS, ADDRESS, ADDRESS, 0x5f])?;
//!
//! let found = pattern.try_match_at(&[0xe9, 0x10, 0x00, 0x00, 0x00, 0x5f]).unwrap();
//! assert_eq!(found.length, 6);
//! assert_eq!(found.address, 0x10);
//! # Ok::<(), detourcore::Error>(())
//! ```

use crate::{pattern::AddressMeaning, Result};

/// High byte marking a `u16` pattern item as special.
const SPECIAL_MASK: u16 = 0xFF00;

/// Special value in the mask/pattern encoding: one byte of any value.
pub const B_ANY: u8 = 0x00;
/// Special value in the mask/pattern encoding: any number of bytes of any value.
pub const B_ANY_REPEATING: u8 = 0x01;
/// Special value in the mask/pattern encoding: one captured address byte.
pub const B_ADDRESS: u8 = 0x02;

/// `u16` item for one byte of any value.
pub const ANY: u16 = SPECIAL_MASK | B_ANY as u16;
/// `u16` item for any number of bytes of any value.
pub const ANY_REPEATING: u16 = SPECIAL_MASK | B_ANY_REPEATING as u16;
/// `u16` item for one captured address byte.
pub const ADDRESS: u16 = SPECIAL_MASK | B_ADDRESS as u16;

/// Size of the buffer captured address bytes are written to.
pub const ADDRESS_BUFFER_LEN: usize = std::mem::size_of::<u64>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Literal,
    MaskedLiteral,
    Any,
    AnyRepeating,
    Address,
}

impl SegmentKind {
    fn min_length(self) -> usize {
        match self {
            SegmentKind::AnyRepeating => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PatternSegment {
    start: usize,
    length: usize,
    kind: SegmentKind,
}

impl PatternSegment {
    fn slice_of<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.start..self.start + self.length]
    }
}

/// A successful match of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    /// Offset into the scanned data where the match begins
    pub offset: usize,
    /// Number of bytes the match covers
    pub length: usize,
    /// Captured address bytes, read as a little-endian value padded with zeros
    pub address: u64,
}

/// A compiled byte pattern; see the [module documentation](self).
#[derive(Debug, Clone)]
pub struct BytePattern {
    pattern: Vec<u8>,
    bitmask: Vec<u8>,
    segments: Vec<PatternSegment>,
    min_length: usize,
    address_bytes: usize,
    meaning: AddressMeaning,
    must_match_at_start: bool,
}

impl BytePattern {
    /// Compiles a pattern from `u16` items.
    ///
    /// If the high byte of an item is zero, the low byte is matched exactly. If it is `0xFF`, the
    /// low byte is a special value ([`ANY`], [`ANY_REPEATING`], [`ADDRESS`]). Any other high byte
    /// is a mask selecting which bits of the low byte must match.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unknown special values, for patterns without a
    /// meaningful segment and for patterns capturing more than [`ADDRESS_BUFFER_LEN`] address
    /// bytes.
    pub fn new(meaning: AddressMeaning, must_match_at_start: bool, items: &[u16]) -> Result<Self> {
        let mut pattern = Vec::with_capacity(items.len());
        let mut bitmask = Vec::with_capacity(items.len());

        for &item in items {
            let mask = (item >> 8) as u8;
            let value = (item & 0xFF) as u8;
            match mask {
                0x00 => {
                    bitmask.push(0xFF);
                    pattern.push(value);
                }
                0xFF => {
                    bitmask.push(0x00);
                    pattern.push(value);
                }
                _ => {
                    bitmask.push(mask);
                    pattern.push(value & mask);
                }
            }
        }

        Self::from_mask(meaning, must_match_at_start, &bitmask, &pattern)
    }

    /// Compiles a pattern from parallel mask and pattern arrays.
    ///
    /// A mask byte of `0xFF` makes the pattern byte a literal, `0x00` makes it a special value
    /// ([`B_ANY`], [`B_ANY_REPEATING`], [`B_ADDRESS`]) and anything else masks the literal.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `mask` is shorter than `pattern`, for unknown special
    /// values, for patterns without a meaningful segment and for more than
    /// [`ADDRESS_BUFFER_LEN`] address bytes.
    pub fn from_mask(
        meaning: AddressMeaning,
        must_match_at_start: bool,
        mask: &[u8],
        pattern: &[u8],
    ) -> Result<Self> {
        if mask.len() < pattern.len() {
            return Err(malformed_error!("Mask buffer shorter than pattern"));
        }

        let kinds = pattern
            .iter()
            .zip(mask)
            .map(|(&value, &mask)| match mask {
                0x00 => match value {
                    B_ANY => Ok(SegmentKind::Any),
                    B_ANY_REPEATING => Ok(SegmentKind::AnyRepeating),
                    B_ADDRESS => Ok(SegmentKind::Address),
                    other => Err(malformed_error!(
                        "Pattern contained unknown special value {:#04x}",
                        other
                    )),
                },
                0xFF => Ok(SegmentKind::Literal),
                _ => Ok(SegmentKind::MaskedLiteral),
            })
            .collect::<Result<Vec<_>>>()?;

        let (segments, min_length, address_bytes) = compute_segments(&kinds)?;

        Ok(BytePattern {
            pattern: pattern.to_vec(),
            bitmask: mask[..pattern.len()].to_vec(),
            segments,
            min_length,
            address_bytes,
            meaning,
            must_match_at_start,
        })
    }

    /// The smallest number of bytes this pattern can match.
    #[must_use]
    pub fn min_length(&self) -> usize {
        self.min_length
    }

    /// Number of address bytes this pattern captures.
    #[must_use]
    pub fn address_bytes(&self) -> usize {
        self.address_bytes
    }

    /// How captured addresses are interpreted.
    #[must_use]
    pub fn meaning(&self) -> AddressMeaning {
        self.meaning
    }

    /// Whether the pattern only matches at the very start of the scanned data.
    #[must_use]
    pub fn must_match_at_start(&self) -> bool {
        self.must_match_at_start
    }

    /// A copy of this pattern that only matches at the start of the scanned data.
    #[must_use]
    pub fn anchored(&self) -> BytePattern {
        BytePattern {
            must_match_at_start: true,
            ..self.clone()
        }
    }

    /// The first literal run of the pattern and its fixed offset from the start of a match.
    ///
    /// Any-repeating segments before it contribute nothing to the offset. The returned slice is
    /// empty if the pattern has no literal at all.
    #[must_use]
    pub fn first_literal_segment(&self) -> (&[u8], usize) {
        match self.next_literal_segment(0) {
            (Some(segment), offset) => (segment.slice_of(&self.pattern), offset),
            (None, offset) => (&[], offset),
        }
    }

    /// The first literal run and its offset, if that offset is the same for every match.
    ///
    /// `None` when the pattern has no literal or an any-repeating run precedes the first one.
    pub(crate) fn fixed_first_literal(&self) -> Option<(&[u8], usize)> {
        let mut offset = 0;
        for segment in &self.segments {
            match segment.kind {
                SegmentKind::Literal => return Some((segment.slice_of(&self.pattern), offset)),
                SegmentKind::AnyRepeating => return None,
                _ => offset += segment.length,
            }
        }
        None
    }

    /// Tries to match the pattern at the very start of `data`.
    ///
    /// Returns `None` for no match; this is a normal negative result.
    #[must_use]
    pub fn try_match_at(&self, data: &[u8]) -> Option<PatternMatch> {
        if data.len() < self.min_length {
            return None;
        }

        let mut address = [0u8; ADDRESS_BUFFER_LEN];
        let length = self.match_from(data, &mut address, 0, 0)?;
        Some(PatternMatch {
            offset: 0,
            length,
            address: u64::from_le_bytes(address),
        })
    }

    /// Finds the first match of the pattern within `data`.
    #[must_use]
    pub fn try_find_match(&self, data: &[u8]) -> Option<PatternMatch> {
        if data.len() < self.min_length {
            return None;
        }

        let mut address = [0u8; ADDRESS_BUFFER_LEN];
        let (offset, length) = if self.must_match_at_start {
            (0, self.match_from(data, &mut address, 0, 0)?)
        } else {
            self.scan_for_next_literal(data, &mut address, 0)?
        };

        Some(PatternMatch {
            offset,
            length,
            address: u64::from_le_bytes(address),
        })
    }

    /// Matches segments `first_segment..` at the start of `data`, returning the matched length.
    ///
    /// `address_pos` is the number of address bytes already captured into `address`.
    fn match_from(
        &self,
        data: &[u8],
        address: &mut [u8; ADDRESS_BUFFER_LEN],
        mut address_pos: usize,
        first_segment: usize,
    ) -> Option<usize> {
        let mut pos = 0;

        for (index, segment) in self.segments.iter().enumerate().skip(first_segment) {
            if segment.kind != SegmentKind::AnyRepeating && data.len() - pos < segment.length {
                return None;
            }

            match segment.kind {
                SegmentKind::Literal => {
                    if segment.slice_of(&self.pattern) != &data[pos..pos + segment.length] {
                        return None;
                    }
                }
                SegmentKind::MaskedLiteral => {
                    let expected = segment.slice_of(&self.pattern);
                    let mask = segment.slice_of(&self.bitmask);
                    let actual = &data[pos..pos + segment.length];
                    let equal = expected
                        .iter()
                        .zip(mask)
                        .zip(actual)
                        .all(|((e, m), a)| (e ^ a) & m == 0);
                    if !equal {
                        return None;
                    }
                }
                SegmentKind::Any => {}
                SegmentKind::Address => {
                    // construction bounds the total to ADDRESS_BUFFER_LEN
                    address[address_pos..address_pos + segment.length]
                        .copy_from_slice(&data[pos..pos + segment.length]);
                    address_pos += segment.length;
                }
                SegmentKind::AnyRepeating => {
                    let (offset, length) = self.scan_for_next_literal_from(
                        &data[pos..],
                        address,
                        address_pos,
                        index + 1,
                    )?;
                    return Some(pos + offset + length);
                }
            }

            pos += segment.length;
        }

        Some(pos)
    }

    fn scan_for_next_literal(
        &self,
        data: &[u8],
        address: &mut [u8; ADDRESS_BUFFER_LEN],
        segment_index: usize,
    ) -> Option<(usize, usize)> {
        self.scan_for_next_literal_from(data, address, 0, segment_index)
    }

    /// Finds the next literal at or after `segment_index` in `data` and tries to match the
    /// remaining segments at each hit, resuming one byte past a failed hit.
    ///
    /// Returns the offset of the match start and its length.
    fn scan_for_next_literal_from(
        &self,
        data: &[u8],
        address: &mut [u8; ADDRESS_BUFFER_LEN],
        address_pos: usize,
        segment_index: usize,
    ) -> Option<(usize, usize)> {
        let (literal, base_offset) = self.next_literal_segment(segment_index);
        let literal = literal.map_or(&[][..], |segment| segment.slice_of(&self.pattern));
        if base_offset + literal.len() > data.len() {
            return None;
        }

        let mut scan_offset = 0;
        loop {
            let haystack = data.get(base_offset + scan_offset..)?;
            let found = index_of(haystack, literal)?;

            let offset = scan_offset + found;
            if let Some(length) = self.match_from(&data[offset..], address, address_pos, segment_index)
            {
                return Some((offset, length));
            }

            scan_offset += found + 1;
        }
    }

    /// The next literal segment at or after `segment_index`, and its offset from that segment.
    fn next_literal_segment(&self, segment_index: usize) -> (Option<&PatternSegment>, usize) {
        let mut offset = 0;
        for segment in self.segments.iter().skip(segment_index) {
            match segment.kind {
                SegmentKind::Literal => return (Some(segment), offset),
                SegmentKind::Any | SegmentKind::Address | SegmentKind::MaskedLiteral => {
                    offset += segment.length;
                }
                SegmentKind::AnyRepeating => {}
            }
        }

        (None, offset)
    }
}

fn index_of(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Groups per-byte kinds into segments.
///
/// Leading and trailing any-repeating runs are dropped. A single any segment directly after an
/// any-repeating segment is swapped in front of it, so an any-repeating run is always followed by
/// a fixed-length segment.
fn compute_segments(kinds: &[SegmentKind]) -> Result<(Vec<PatternSegment>, usize, usize)> {
    if kinds.is_empty() {
        return Err(malformed_error!("Pattern cannot be empty"));
    }

    let min_length = kinds.iter().map(|kind| kind.min_length()).sum::<usize>();
    let address_bytes = kinds
        .iter()
        .filter(|kind| **kind == SegmentKind::Address)
        .count();
    if address_bytes > ADDRESS_BUFFER_LEN {
        return Err(malformed_error!(
            "Pattern captures {} address bytes, at most {} are supported",
            address_bytes,
            ADDRESS_BUFFER_LEN
        ));
    }

    let mut segments: Vec<PatternSegment> = Vec::new();
    for (index, &kind) in kinds.iter().enumerate() {
        match segments.last_mut() {
            Some(last) if last.kind == kind => last.length += 1,
            None if kind == SegmentKind::AnyRepeating => {}
            _ => {
                let count = segments.len();
                if count >= 2
                    && segments[count - 1].kind == SegmentKind::Any
                    && segments[count - 2].kind == SegmentKind::AnyRepeating
                {
                    segments.swap(count - 2, count - 1);
                }

                segments.push(PatternSegment {
                    start: index,
                    length: 1,
                    kind,
                });
            }
        }
    }

    let count = segments.len();
    if count >= 2
        && segments[count - 1].kind == SegmentKind::Any
        && segments[count - 2].kind == SegmentKind::AnyRepeating
    {
        segments.swap(count - 2, count - 1);
    }
    if segments
        .last()
        .is_some_and(|segment| segment.kind == SegmentKind::AnyRepeating)
    {
        segments.pop();
    }

    if segments.is_empty() || min_length == 0 {
        return Err(malformed_error!("Pattern has no meaningful segments"));
    }

    Ok((segments, min_length, address_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::AddressKind;

    fn abs() -> AddressMeaning {
        AddressMeaning::absolute(AddressKind::ABS64).unwrap()
    }

    #[test]
    fn literal_match() {
        let pattern = BytePattern::new(abs(), false, &[0x48, 0x8b, 0xc4]).unwrap();
        assert_eq!(pattern.min_length(), 3);

        let found = pattern.try_match_at(&[0x48, 0x8b, 0xc4, 0x90]).unwrap();
        assert_eq!(found.length, 3);
        assert!(pattern.try_match_at(&[0x90, 0x48, 0x8b, 0xc4]).is_none());

        let found = pattern.try_find_match(&[0x90, 0x90, 0x48, 0x8b, 0xc4]).unwrap();
        assert_eq!(found.offset, 2);
        assert_eq!(found.length, 3);
    }

    #[test]
    fn masked_literal_match() {
        // REX prefix with any low nibble
        let pattern = BytePattern::new(abs(), false, &[0xf040, 0xb8]).unwrap();
        assert!(pattern.try_match_at(&[0x48, 0xb8]).is_some());
        assert!(pattern.try_match_at(&[0x41, 0xb8]).is_some());
        assert!(pattern.try_match_at(&[0x50, 0xb8]).is_none());
    }

    #[test]
    fn address_capture() {
        let pattern = BytePattern::new(
            abs(),
            false,
            &[0x48, 0xb8, ADDRESS, ADDRESS, ADDRESS, ADDRESS, ADDRESS, ADDRESS, ADDRESS, ADDRESS, 0xff, 0xe0],
        )
        .unwrap();
        assert_eq!(pattern.address_bytes(), 8);

        let data = [
            0xcc, 0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0xff, 0xe0,
        ];
        let found = pattern.try_find_match(&data).unwrap();
        assert_eq!(found.offset, 1);
        assert_eq!(found.length, 12);
        assert_eq!(found.address, 0x1122_3344_5566_7788);
    }

    #[test]
    fn oversized_address_is_rejected() {
        let mut items = vec![0x90];
        items.extend(std::iter::repeat(ADDRESS).take(10));
        assert!(matches!(
            BytePattern::new(abs(), true, &items),
            Err(crate::Error::Malformed { .. })
        ));

        // split across two runs, still over the limit
        let mut split = vec![0x90];
        split.extend(std::iter::repeat(ADDRESS).take(5));
        split.push(0x90);
        split.extend(std::iter::repeat(ADDRESS).take(4));
        assert!(BytePattern::new(abs(), true, &split).is_err());

        let mut exact = vec![0x90];
        exact.extend(std::iter::repeat(ADDRESS).take(ADDRESS_BUFFER_LEN));
        assert_eq!(
            BytePattern::new(abs(), true, &exact).unwrap().address_bytes(),
            ADDRESS_BUFFER_LEN
        );
    }

    #[test]
    fn any_repeating_scans_forward() {
        let pattern = BytePattern::new(abs(), false, &[0xaa, ANY_REPEATING, 0xbb, 0xcc]).unwrap();
        assert_eq!(pattern.min_length(), 3);

        let found = pattern
            .try_match_at(&[0xaa, 0x01, 0xbb, 0x02, 0xbb, 0xcc])
            .unwrap();
        assert_eq!(found.length, 6);

        assert!(pattern.try_match_at(&[0xaa, 0xbb, 0xcc]).is_some());
        assert!(pattern.try_match_at(&[0xaa, 0x01, 0xbb, 0x02]).is_none());
    }

    #[test]
    fn any_repeating_then_address() {
        let pattern = BytePattern::new(
            abs(),
            false,
            &[0xaa, ANY_REPEATING, 0xbb, ADDRESS, ADDRESS],
        )
        .unwrap();
        let found = pattern
            .try_match_at(&[0xaa, 0x00, 0x00, 0xbb, 0x34, 0x12, 0x99])
            .unwrap();
        assert_eq!(found.length, 6);
        assert_eq!(found.address, 0x1234);
    }

    #[test]
    fn leading_and_trailing_repeats_are_ignored() {
        let pattern =
            BytePattern::new(abs(), false, &[ANY_REPEATING, 0x12, 0x34, ANY_REPEATING]).unwrap();
        assert_eq!(pattern.min_length(), 2);
        assert_eq!(pattern.first_literal_segment(), (&[0x12, 0x34][..], 0));
        assert_eq!(pattern.try_match_at(&[0x12, 0x34, 0x56]).unwrap().length, 2);
    }

    #[test]
    fn first_literal_offset() {
        let pattern = BytePattern::new(abs(), false, &[ANY, ADDRESS, 0xf0ff, 0x11, 0x22]).unwrap();
        assert_eq!(pattern.first_literal_segment(), (&[0x11, 0x22][..], 3));

        let no_literal = BytePattern::new(abs(), false, &[ANY, ADDRESS]).unwrap();
        assert_eq!(no_literal.first_literal_segment().0.len(), 0);
    }

    #[test]
    fn pattern_without_literal_scans_every_offset() {
        let pattern = BytePattern::new(abs(), false, &[0xf0f0, ADDRESS]).unwrap();
        let found = pattern.try_find_match(&[0x01, 0x02, 0xf5, 0x42]).unwrap();
        assert_eq!(found.offset, 2);
        assert_eq!(found.address, 0x42);
    }

    #[test]
    fn must_match_at_start() {
        let pattern = BytePattern::new(abs(), true, &[0x11, 0x22]).unwrap();
        assert!(pattern.try_find_match(&[0x00, 0x11, 0x22]).is_none());
        assert!(pattern.try_find_match(&[0x11, 0x22, 0x00]).is_some());
    }

    #[test]
    fn short_input_does_not_match() {
        let pattern = BytePattern::new(abs(), false, &[0x11, 0x22, 0x33]).unwrap();
        assert!(pattern.try_match_at(&[0x11, 0x22]).is_none());
        assert!(pattern.try_find_match(&[]).is_none());
    }

    #[test]
    fn malformed_patterns() {
        assert!(BytePattern::new(abs(), false, &[]).is_err());
        assert!(BytePattern::new(abs(), false, &[ANY_REPEATING]).is_err());
        assert!(BytePattern::new(abs(), false, &[0xFF03]).is_err());
        assert!(BytePattern::from_mask(abs(), false, &[0xff], &[0x11, 0x22]).is_err());
        assert!(BytePattern::from_mask(abs(), false, &[0x00], &[0x07]).is_err());
    }

    #[test]
    fn mask_encoding_matches_item_encoding() {
        let items = BytePattern::new(abs(), false, &[0xe8, ADDRESS, ADDRESS, 0x0f40]).unwrap();
        let masked = BytePattern::from_mask(
            abs(),
            false,
            &[0xff, 0x00, 0x00, 0x0f],
            &[0xe8, B_ADDRESS, B_ADDRESS, 0x00],
        )
        .unwrap();

        let data = [0x00, 0xe8, 0x34, 0x12, 0xa0];
        assert_eq!(items.try_find_match(&data), masked.try_find_match(&data));
        assert_eq!(items.try_find_match(&data).unwrap().address, 0x1234);
    }

    #[test]
    fn rematching_at_found_offset_is_deterministic() {
        let pattern = BytePattern::new(
            abs(),
            false,
            &[0xaa, ANY_REPEATING, 0xbb, ADDRESS, ADDRESS, 0xcc],
        )
        .unwrap();
        let data = [0x00, 0xaa, 0xbb, 0x00, 0xbb, 0x01, 0x02, 0xcc, 0x00];

        let found = pattern.try_find_match(&data).unwrap();
        let again = pattern.anchored().try_find_match(&data[found.offset..]).unwrap();
        assert_eq!(again.offset, 0);
        assert_eq!(again.length, found.length);
        assert_eq!(again.address, found.address);
    }
}
