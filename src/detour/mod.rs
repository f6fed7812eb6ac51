//! Native and method-level detours.
//!
//! # Key Components
//!
//! - [`SimpleNativeDetour`] - A jump patched over the start of some code, with its backup
//! - [`NativeDetour`] - A simple detour plus an alternate entry that still runs the original code
//! - [`DetourFactory`] / [`CoreDetour`] - Detours between methods, resolved through the platform
//!   triple and kept up to date when the runtime recompiles either side
//! - [`ReentrancyGuard`] - Detection of a thread re-entering a detour it is updating
//! - [`Function`] - Typed `extern "C"` function pointers
//!
//! # Examples
//!
//! ```rust,no_run
//! use detourcore::platform::PlatformTriple;
//!
//! #[inline(never)]
//! extern "C" fn original(x: i32) -> i32 { x + 1 }
//! extern "C" fn replacement(x: i32) -> i32 { x * 10 }
//!
//! let triple = PlatformTriple::current()?;
//! let mut detour = unsafe {
//!     triple.create_native_detour(original as usize, replacement as usize, None)?
//! };
//! assert_eq!(std::hint::black_box(original as extern "C" fn(i32) -> i32)(4), 40);
//!
//! detour.undo()?;
//! assert_eq!(std::hint::black_box(original as extern "C" fn(i32) -> i32)(4), 5);
//! # Ok::<(), detourcore::Error>(())
//! ```

mod factory;
mod function;
mod guard;
mod native;
mod simple;

pub use factory::{CoreDetour, DetourFactory, RelocatedCallback};
pub use function::Function;
pub(crate) use guard::current_thread_id;
pub use guard::{ReentrancyGuard, ReentrancyScope};
pub use native::NativeDetour;
pub use simple::SimpleNativeDetour;
