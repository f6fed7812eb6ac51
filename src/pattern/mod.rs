//! Byte pattern matching for compiler-generated code stubs.
//!
//! Runtimes rarely hand out the address of a method's real machine code. The nominal entry point
//! usually leads through precode, fixup thunks, tiering counters or plain jump stubs first. This
//! module provides the matcher used to recognise those stubs and extract the address they lead to.
//!
//! # Key Components
//!
//! - [`BytePattern`] - A single pattern of literal, masked, wildcard and address bytes
//! - [`BytePatternCollection`] - Many patterns indexed by their first literal byte
//! - [`AddressKind`] / [`AddressMeaning`] - Interpretation of captured address bytes
//!
//! Failing to match is a normal result (`None`); only malformed patterns are errors, and those
//! are reported when the pattern is constructed.

mod address;
mod bytes;
mod collection;

pub use address::{AddressKind, AddressMeaning};
pub use bytes::{
    BytePattern, PatternMatch, ADDRESS, ADDRESS_BUFFER_LEN, ANY, ANY_REPEATING, B_ADDRESS, B_ANY,
    B_ANY_REPEATING,
};
pub use collection::BytePatternCollection;
