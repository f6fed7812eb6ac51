// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::missing_safety_doc)]
// Patching code is unsafe by nature:
// - 'platform/system' changes page protections and writes into executable memory
// - 'platform/arch' reads machine code at arbitrary addresses and stores jump cells atomically
// - 'detour/function' transmutes addresses into function pointers

//! # detourcore
//!
//! Redirect already-compiled methods to other code at runtime, and keep any number of such
//! redirections on the same method in a defined order.
//!
//! ## Features
//!
//! - **Platform abstraction** - An architecture, an OS and a runtime provider bundled into a
//!   [`platform::PlatformTriple`], with combined feature flags and ABI
//! - **Thunk walking** - Byte patterns that see through compiler and runtime stubs to the real
//!   method body
//! - **Native detours** - The smallest jump encoding that fits, with undo, retargeting and an
//!   alternate entry that still runs the original code
//! - **ABI detection** - Argument order, return buffers and struct classification, declared or
//!   measured by a self-test
//! - **Hook chains** - Priorities and before/after constraints linearised into one chain per
//!   method, updated safely while calls run through it
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use detourcore::prelude::*;
//!
//! #[inline(never)]
//! extern "C" fn answer() -> i32 { 41 }
//! extern "C" fn better_answer() -> i32 { 42 }
//!
//! let triple = PlatformTriple::current()?;
//! let factory = DetourFactory::new(triple)?;
//! let detour = unsafe {
//!     factory.create_detour(
//!         &MethodHandle::function(answer as usize),
//!         &MethodHandle::function(better_answer as usize),
//!         true,
//!     )?
//! };
//! assert_eq!(std::hint::black_box(answer as extern "C" fn() -> i32)(), 42);
//!
//! drop(detour);
//! assert_eq!(std::hint::black_box(answer as extern "C" fn() -> i32)(), 41);
//! # Ok::<(), detourcore::Error>(())
//! ```
//!
//! ## Platform support
//!
//! Concrete providers exist for x86_64 Linux. On other targets the crate builds, and
//! [`platform::PlatformTriple::current`] reports [`Error::UnsupportedPlatform`]; custom
//! providers can still be bundled with [`platform::PlatformTriple::new`].
//!
//! ## Logging
//!
//! Diagnostics go through the [`log`] facade. Install any logger to see patches, relinks and
//! thunk walks.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use detourcore::prelude::*;
///
/// let manager = DetourManager::new(PlatformTriple::current()?)?;
/// let info = manager.detour_info(&MethodHandle::function(0x1000))?;
/// assert!(info.hooks.is_empty());
/// # Ok::<(), detourcore::Error>(())
/// ```
pub mod prelude;

/// Ambient configuration of a platform triple
///
/// See [`config::PlatformConfig`] for the available knobs and presets.
pub mod config;

/// Byte patterns over machine code
///
/// Patterns with wildcard bytes, wildcard runs and captured addresses, used to recognise the
/// stubs a call passes through before it reaches a method body.
///
/// # Key Types
///
/// - [`pattern::BytePattern`] - One pattern and the meaning of its captured address
/// - [`pattern::BytePatternCollection`] - A set of patterns searched together
/// - [`pattern::AddressMeaning`] - How a captured address becomes a jump target
pub mod pattern;

/// Architecture, operating system and runtime providers
///
/// # Key Types
///
/// - [`platform::PlatformTriple`] - The facade over the three providers
/// - [`platform::arch::Architecture`] - Jump encodings and relocation
/// - [`platform::system::System`] - Memory allocation and patching
/// - [`platform::runtime::Runtime`] - Method entry points and compilation
/// - [`platform::abi::Abi`] - Calling convention descriptions
pub mod platform;

/// Native and method-level detours
///
/// See [`detour::NativeDetour`] for patching machine code directly, and
/// [`detour::DetourFactory`] for detours between methods.
pub mod detour;

/// Ordered hook chains
///
/// See [`manager::DetourManager`].
pub mod manager;

/// `detourcore` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `detourcore` Error type
///
/// The error type of all fallible operations in this crate. See [`Error`] for the variants.
pub use error::Error;
