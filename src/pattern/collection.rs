//! Indexed sets of byte patterns.
//!
//! Scanning code for one of many stub shapes pattern by pattern is wasteful: almost every
//! position fails on the first literal byte. A [`BytePatternCollection`] groups its patterns by
//! the fixed offset of their first literal run and indexes each group by the first byte of that
//! run. Searching then only tries patterns whose first literal byte is actually present at the
//! candidate position.
//!
//! Patterns without any literal cannot be indexed, and neither can patterns whose first literal
//! follows an any-repeating run, since its offset varies. They are kept aside and tried last.

use crate::pattern::{BytePattern, PatternMatch};

/// Patterns sharing the offset of their first literal run.
#[derive(Debug, Clone)]
struct HomogeneousCollection {
    offset: usize,
    min_length: usize,
    lut: Vec<Vec<usize>>,
}

impl HomogeneousCollection {
    fn new(offset: usize) -> Self {
        HomogeneousCollection {
            offset,
            min_length: usize::MAX,
            lut: vec![Vec::new(); 256],
        }
    }
}

/// A set of [`BytePattern`]s indexed for fast matching.
///
/// # Examples
///
/// ```rust
/// use detourcore::pattern::{AddressKind, AddressMeaning, BytePattern, BytePatternCollection, ADDRESS};
///
/// let rel = AddressMeaning::relative(AddressKind::REL32, 5)?;
/// let abs = AddressMeaning::absolute(AddressKind::ABS64)?;
/// let collection = BytePatternCollection::new([
///     BytePattern::new(rel, false, &[0xe9, ADDRESS, ADDRESS, ADDRESS, ADDRESS, 0x5f])?,
///     BytePattern::new(abs, false, &[0x48, 0xb8, ADDRESS, ADDRESS, ADDRESS, ADDRESS,
///                                    ADDRESS, ADDRESS, ADDRESS, ADDRESS, 0xff, 0xe0])?,
/// ]);
///
/// let (pattern, found) = collection.try_find_match(&[0x90, 0xe9, 1, 0, 0, 0, 0x5f]).unwrap();
/// assert_eq!(found.offset, 1);
/// assert_eq!(pattern.meaning(), rel);
/// # Ok::<(), detourcore::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct BytePatternCollection {
    patterns: Vec<BytePattern>,
    collections: Vec<HomogeneousCollection>,
    empty_patterns: Vec<usize>,
    possible_first_bytes: [bool; 256],
    min_length: usize,
    max_min_length: usize,
    max_address_length: usize,
}

impl BytePatternCollection {
    /// Builds the lookup tables for `patterns`.
    pub fn new(patterns: impl IntoIterator<Item = BytePattern>) -> Self {
        let patterns: Vec<BytePattern> = patterns.into_iter().collect();

        let mut collections: Vec<HomogeneousCollection> = Vec::new();
        let mut empty_patterns = Vec::new();
        let mut possible_first_bytes = [false; 256];

        for (index, pattern) in patterns.iter().enumerate() {
            let Some((&[first, ..], offset)) = pattern.fixed_first_literal() else {
                empty_patterns.push(index);
                continue;
            };

            let position = match collections.binary_search_by_key(&offset, |c| c.offset) {
                Ok(position) => position,
                Err(position) => {
                    collections.insert(position, HomogeneousCollection::new(offset));
                    position
                }
            };

            let collection = &mut collections[position];
            collection.lut[usize::from(first)].push(index);
            collection.min_length = collection.min_length.min(pattern.min_length());
            possible_first_bytes[usize::from(first)] = true;
        }

        let min_length = patterns.iter().map(BytePattern::min_length).min().unwrap_or(0);
        let max_min_length = patterns.iter().map(BytePattern::min_length).max().unwrap_or(0);
        let max_address_length = patterns
            .iter()
            .map(BytePattern::address_bytes)
            .max()
            .unwrap_or(0);

        BytePatternCollection {
            patterns,
            collections,
            empty_patterns,
            possible_first_bytes,
            min_length,
            max_min_length,
            max_address_length,
        }
    }

    /// The smallest minimum length of any contained pattern.
    #[must_use]
    pub fn min_length(&self) -> usize {
        self.min_length
    }

    /// The largest minimum length of any contained pattern.
    ///
    /// Reading this many bytes is enough to give every pattern a chance to match.
    #[must_use]
    pub fn max_min_length(&self) -> usize {
        self.max_min_length
    }

    /// The largest number of address bytes any contained pattern captures.
    #[must_use]
    pub fn max_address_length(&self) -> usize {
        self.max_address_length
    }

    /// Number of contained patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// `true` if the collection holds no patterns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Iterates the contained patterns in the order they were given.
    pub fn iter(&self) -> impl Iterator<Item = &BytePattern> {
        self.patterns.iter()
    }

    /// Tries every pattern at the very start of `data`, returning the first that matches.
    #[must_use]
    pub fn try_match_at(&self, data: &[u8]) -> Option<(&BytePattern, PatternMatch)> {
        if self.patterns.is_empty() || data.len() < self.min_length {
            return None;
        }

        for collection in &self.collections {
            if data.len() <= collection.offset || data.len() < collection.min_length {
                continue;
            }

            for &index in &collection.lut[usize::from(data[collection.offset])] {
                let pattern = &self.patterns[index];
                if let Some(found) = pattern.try_match_at(data) {
                    return Some((pattern, found));
                }
            }
        }

        self.empty_patterns.iter().find_map(|&index| {
            let pattern = &self.patterns[index];
            pattern.try_match_at(data).map(|found| (pattern, found))
        })
    }

    /// Finds the earliest indexed match within `data`.
    ///
    /// Patterns that cannot be indexed are only tried once the indexed search is exhausted.
    #[must_use]
    pub fn try_find_match(&self, data: &[u8]) -> Option<(&BytePattern, PatternMatch)> {
        if self.patterns.is_empty() || data.len() < self.min_length {
            return None;
        }

        let mut scan_base = 0;
        while let Some(index) = data[scan_base..]
            .iter()
            .position(|byte| self.possible_first_bytes[usize::from(*byte)])
        {
            let offset = scan_base + index;
            let value = usize::from(data[offset]);

            for collection in &self.collections {
                if offset < collection.offset {
                    continue;
                }
                let start = offset - collection.offset;
                if data.len() - start < collection.min_length {
                    continue;
                }

                for &pattern_index in &collection.lut[value] {
                    let pattern = &self.patterns[pattern_index];
                    if start != 0 && pattern.must_match_at_start() {
                        continue;
                    }
                    if let Some(found) = pattern.try_match_at(&data[start..]) {
                        return Some((
                            pattern,
                            PatternMatch {
                                offset: start,
                                ..found
                            },
                        ));
                    }
                }
            }

            scan_base = offset + 1;
        }

        self.empty_patterns.iter().find_map(|&index| {
            let pattern = &self.patterns[index];
            pattern.try_find_match(data).map(|found| (pattern, found))
        })
    }
}

impl<'a> IntoIterator for &'a BytePatternCollection {
    type Item = &'a BytePattern;
    type IntoIter = std::slice::Iter<'a, BytePattern>;

    fn into_iter(self) -> Self::IntoIter {
        self.patterns.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{AddressKind, AddressMeaning, ADDRESS, ANY, ANY_REPEATING};

    fn rel(offset: i32) -> AddressMeaning {
        AddressMeaning::relative(AddressKind::REL32, offset).unwrap()
    }

    fn abs() -> AddressMeaning {
        AddressMeaning::absolute(AddressKind::ABS64).unwrap()
    }

    fn thunks() -> BytePatternCollection {
        BytePatternCollection::new([
            BytePattern::new(rel(5), false, &[0xe9, ADDRESS, ADDRESS, ADDRESS, ADDRESS, 0x5f])
                .unwrap(),
            BytePattern::new(
                abs(),
                false,
                &[
                    0x48, 0xb8, ADDRESS, ADDRESS, ADDRESS, ADDRESS, ADDRESS, ADDRESS, ADDRESS,
                    ADDRESS, 0xff, 0xe0,
                ],
            )
            .unwrap(),
            BytePattern::new(rel(6), true, &[ANY, 0xff, 0x25, ADDRESS, ADDRESS, ADDRESS, ADDRESS])
                .unwrap(),
        ])
    }

    #[test]
    fn statistics() {
        let collection = thunks();
        assert_eq!(collection.len(), 3);
        assert_eq!(collection.min_length(), 6);
        assert_eq!(collection.max_min_length(), 12);
        assert_eq!(collection.max_address_length(), 8);
    }

    #[test]
    fn match_at_start() {
        let collection = thunks();
        let (pattern, found) = collection
            .try_match_at(&[0xe9, 0x01, 0x23, 0x45, 0x67, 0x5f])
            .unwrap();
        assert_eq!(pattern.meaning(), rel(5));
        assert_eq!(found.length, 6);
        assert_eq!(found.address, 0x6745_2301);

        assert!(collection.try_match_at(&[0xe9, 0x01, 0x23, 0x45, 0x67, 0x90]).is_none());
    }

    #[test]
    fn find_uses_literal_offset() {
        let collection = thunks();
        let data = [0x90, 0x90, 0x41, 0xff, 0x25, 0x10, 0x00, 0x00, 0x00];

        // anchored pattern must not match away from the start
        assert!(collection.try_find_match(&data).is_none());

        let (pattern, found) = collection.try_find_match(&data[2..]).unwrap();
        assert!(pattern.must_match_at_start());
        assert_eq!(found.offset, 0);
        assert_eq!(found.length, 7);
        assert_eq!(found.address, 0x10);
    }

    #[test]
    fn find_returns_earliest_candidate() {
        let collection = thunks();
        let mut data = vec![0xcc, 0xe9, 0x00, 0x00, 0x00, 0x00, 0x5f];
        data.extend([0x48, 0xb8, 1, 2, 3, 4, 5, 6, 7, 8, 0xff, 0xe0]);

        let (_, found) = collection.try_find_match(&data).unwrap();
        assert_eq!(found.offset, 1);

        let (pattern, found) = collection.try_find_match(&data[2..]).unwrap();
        assert_eq!(pattern.meaning(), abs());
        assert_eq!(found.offset, 5);
        assert_eq!(found.address, 0x0807_0605_0403_0201);
    }

    #[test]
    fn empty_patterns_are_tried_last() {
        let collection = BytePatternCollection::new([
            BytePattern::new(abs(), false, &[0xf0f0, ADDRESS]).unwrap(),
            BytePattern::new(abs(), false, &[0x11, ANY_REPEATING, 0x22]).unwrap(),
        ]);

        let (pattern, found) = collection.try_find_match(&[0x11, 0x00, 0x22]).unwrap();
        assert_eq!(pattern.first_literal_segment().0, &[0x11]);
        assert_eq!(found.length, 3);

        let (pattern, found) = collection.try_find_match(&[0x00, 0xf3, 0x99]).unwrap();
        assert!(pattern.first_literal_segment().0.is_empty());
        assert_eq!(found.offset, 1);
        assert_eq!(found.address, 0x99);
    }

    #[test]
    fn floating_literals_are_not_indexed() {
        let collection = BytePatternCollection::new([
            BytePattern::new(abs(), true, &[ADDRESS, ANY_REPEATING, 0x22, 0x33]).unwrap(),
            BytePattern::new(rel(5), false, &[0xe9, ADDRESS, ADDRESS, ADDRESS, ADDRESS, 0x5f])
                .unwrap(),
        ]);

        let data = [0x44, 0x00, 0x00, 0x22, 0x33];
        let (pattern, found) = collection.try_find_match(&data).unwrap();
        assert!(pattern.must_match_at_start());
        assert_eq!(found.offset, 0);
        assert_eq!(found.length, 5);
        assert_eq!(found.address, 0x44);

        let (_, found) = collection.try_match_at(&data).unwrap();
        assert_eq!(found.address, 0x44);
    }

    #[test]
    fn empty_collection_never_matches() {
        let collection = BytePatternCollection::new(Vec::new());
        assert!(collection.is_empty());
        assert!(collection.try_find_match(&[0x00; 16]).is_none());
        assert!(collection.try_match_at(&[0x00; 16]).is_none());
    }
}
