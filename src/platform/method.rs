//! Method handles.
//!
//! A [`MethodHandle`] identifies a method without saying where its code currently is; the
//! [`crate::platform::runtime::Runtime`] resolves it to an entry point. The same method may be
//! reachable through several representations (for example a dynamically generated method wrapped
//! in an owner object), so handles are canonicalised before they are used as map keys.

use std::fmt;

/// Opaque identifier of a method in the host runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodHandle {
    /// A function whose code lives at a fixed address
    Function(usize),
    /// A method known to its runtime by an opaque token
    Token(u64),
    /// A method wrapped in an owner object
    Wrapped {
        /// Identity of the owner object
        owner: u64,
        /// The wrapped method
        method: Box<MethodHandle>,
    },
}

impl MethodHandle {
    /// A handle for the machine code function at `address`.
    #[must_use]
    pub fn function(address: usize) -> Self {
        MethodHandle::Function(address)
    }

    /// Wraps `method` in the owner object `owner`.
    #[must_use]
    pub fn wrapped(owner: u64, method: MethodHandle) -> Self {
        MethodHandle::Wrapped {
            owner,
            method: Box::new(method),
        }
    }

    /// The canonical representation: the innermost wrapped method.
    #[must_use]
    pub fn canonical(&self) -> &MethodHandle {
        let mut current = self;
        while let MethodHandle::Wrapped { method, .. } = current {
            current = method;
        }
        current
    }

    /// The code address, for handles that carry one directly.
    #[must_use]
    pub fn function_address(&self) -> Option<usize> {
        match self.canonical() {
            MethodHandle::Function(address) => Some(*address),
            _ => None,
        }
    }
}

impl fmt::Display for MethodHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodHandle::Function(address) => write!(f, "fn@{address:#x}"),
            MethodHandle::Token(token) => write!(f, "method#{token:#x}"),
            MethodHandle::Wrapped { owner, method } => write!(f, "{method} (owner {owner:#x})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_unwraps_all_layers() {
        let inner = MethodHandle::Token(7);
        let wrapped = MethodHandle::wrapped(1, MethodHandle::wrapped(2, inner.clone()));

        assert_ne!(wrapped, inner);
        assert_eq!(wrapped.canonical(), &inner);
        assert_eq!(inner.canonical(), &inner);
    }

    #[test]
    fn function_address() {
        let handle = MethodHandle::wrapped(3, MethodHandle::function(0x1000));
        assert_eq!(handle.function_address(), Some(0x1000));
        assert_eq!(MethodHandle::Token(1).function_address(), None);
    }
}
