#![no_main]

use libfuzzer_sys::fuzz_target;
use detourcore::pattern::{AddressMeaning, AddressKind, BytePattern, BytePatternCollection};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let split = (data[0] as usize) % data.len();
    let (items, haystack) = data[1..].split_at(split.min(data.len() - 1));

    let raw: Vec<u16> = items
        .chunks(2)
        .map(|c| u16::from_le_bytes([c[0], *c.get(1).unwrap_or(&0)]))
        .collect();
    let Ok(meaning) = AddressMeaning::absolute(AddressKind::ABS64) else {
        return;
    };
    let Ok(pattern) = BytePattern::new(meaning, false, &raw) else {
        return;
    };

    let single = pattern.try_find_match(haystack);
    let collection = BytePatternCollection::new([pattern]);
    let _ = (single, collection.try_find_match(haystack));
});
