use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Provider failures are separate variants: a caller can tell "memory could not be patched"
/// from "the method body could not be found" from "the calling convention is unknown" by
/// matching on the variant.
///
/// # Error Categories
///
/// ## Platform Errors
/// - [`Error::UnsupportedPlatform`] - No provider exists for the running OS/CPU/runtime
/// - [`Error::FeatureNotSupported`] - A provider method was used without its feature flag
/// - [`Error::UnrecognizedAbi`] - The ABI self-test observed an unknown argument layout
///
/// ## Memory Errors
/// - [`Error::Protection`] - Page permissions could not be changed
/// - [`Error::Allocation`] - Executable memory could not be obtained
/// - [`Error::Io`] - Other OS-level failures
///
/// ## Method Resolution Errors
/// - [`Error::MethodBodyNotFound`] - The thunk walk could not reach a code body
/// - [`Error::Compile`] - The runtime failed to (re)compile a method
/// - [`Error::Encoding`] - Relocating instructions for an alternate entry failed
///
/// ## Usage Errors
/// - [`Error::Disposed`] - A handle was used after undo or disposal
/// - [`Error::InvalidState`] - Double apply, removing a hook that was never added, ...
/// - [`Error::InvalidArgument`] - Self-detours, empty requests
/// - [`Error::Malformed`] - Malformed byte patterns or address kinds
///
/// ## Chain Errors
/// - [`Error::DependencyCycle`] - Detour ordering constraints form a cycle
/// - [`Error::ChainUpdateReentry`] - The updating thread called into its own chain
/// - [`Error::LockError`] - Thread synchronization failure
///
/// # Examples
///
/// ```rust,no_run
/// use detourcore::{Error, platform::PlatformTriple};
///
/// match PlatformTriple::current() {
///     Ok(triple) => println!("Running on {}", triple.architecture().kind()),
///     Err(Error::UnsupportedPlatform(what)) => eprintln!("No detour support: {what}"),
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Platform errors
    /// No provider exists for the running OS, CPU or runtime.
    ///
    /// Raised when the process-wide platform triple is first built. It is fatal: nothing in
    /// this crate can operate without all three providers.
    #[error("Unsupported platform - {0}")]
    UnsupportedPlatform(String),

    /// A feature-gated provider method was invoked without the feature being present.
    #[error("Feature not supported by this platform - {0}")]
    FeatureNotSupported(&'static str),

    /// The ABI self-test observed an argument layout that matches none of the known orders.
    ///
    /// Never guessed around; the observation is included for diagnosis.
    #[error("Unrecognized ABI - observed {observed}")]
    UnrecognizedAbi {
        /// Rendering of the observed probe values
        observed: String,
    },

    // Memory errors
    /// Changing page protection for a patch failed.
    #[error("Failed to change protection of {len} bytes at {address:#x} - {source}")]
    Protection {
        /// Start of the region
        address: usize,
        /// Length of the region
        len: usize,
        /// The OS error
        source: std::io::Error,
    },

    /// Executable memory could not be allocated.
    #[error("Allocation failed - {0}")]
    Allocation(String),

    /// OS-level I/O error.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    // Method resolution errors
    /// The native body of a method could not be located.
    #[error("Method body not found - {0}")]
    MethodBodyNotFound(String),

    /// The runtime failed to compile a method.
    #[error("Compilation failed - {0}")]
    Compile(String),

    /// Decoding or re-encoding machine code failed.
    #[error("Instruction encoding failed - {0}")]
    Encoding(String),

    // Usage errors
    /// A detour or handle was used after it was undone or disposed.
    #[error("Use of a disposed {0}")]
    Disposed(&'static str),

    /// An operation is not valid in the object's current state.
    #[error("Invalid state - {0}")]
    InvalidState(String),

    /// An argument was rejected.
    #[error("Invalid argument - {0}")]
    InvalidArgument(String),

    /// Malformed input, mostly byte patterns and address kinds.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    // Chain errors
    /// The before/after constraints of the detours on one method form a cycle.
    ///
    /// The dependency graph is restored to its state before the offending insertion.
    #[error("Dependency cycle detected - {0}")]
    DependencyCycle(String),

    /// A call entered a detour chain on the very thread that is currently relinking it.
    ///
    /// Waiting would never finish, so the call fails instead.
    #[error("Call entered a detour chain while the same thread was updating it")]
    ChainUpdateReentry,

    /// Failed to lock target.
    ///
    /// A mutex or rwlock was poisoned by a panic on another thread.
    #[error("Failed to lock target")]
    LockError,
}
