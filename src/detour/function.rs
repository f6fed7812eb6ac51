//! Typed function pointers.

/// A plain machine code function pointer.
///
/// Lets hooks and their originals be handled as typed `extern "C"` pointers instead of raw
/// addresses.
///
/// # Safety
/// Implementors must be pointer-sized function pointers, so that converting to and from an
/// address is lossless.
pub unsafe trait Function: Copy + Send + Sync + 'static {
    /// Number of arguments.
    const ARITY: usize;

    /// The code address.
    fn to_address(self) -> usize;

    /// Reinterprets `address` as this function type.
    ///
    /// # Safety
    /// `address` must be the entry of a function with exactly this signature.
    unsafe fn from_address(address: usize) -> Self;
}

macro_rules! count {
    () => { 0 };
    ($head:ident $($tail:ident)*) => { 1 + count!($($tail)*) };
}

macro_rules! impl_function {
    ($($arg:ident),*) => {
        unsafe impl<R: 'static, $($arg: 'static),*> Function for extern "C" fn($($arg),*) -> R {
            const ARITY: usize = count!($($arg)*);

            fn to_address(self) -> usize {
                self as usize
            }

            unsafe fn from_address(address: usize) -> Self {
                std::mem::transmute::<usize, Self>(address)
            }
        }

        unsafe impl<R: 'static, $($arg: 'static),*> Function
            for unsafe extern "C" fn($($arg),*) -> R
        {
            const ARITY: usize = count!($($arg)*);

            fn to_address(self) -> usize {
                self as usize
            }

            unsafe fn from_address(address: usize) -> Self {
                std::mem::transmute::<usize, Self>(address)
            }
        }
    };
}

impl_function!();
impl_function!(A);
impl_function!(A, B);
impl_function!(A, B, C);
impl_function!(A, B, C, D);
impl_function!(A, B, C, D, E);
impl_function!(A, B, C, D, E, F);

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn add(a: i32, b: i32) -> i32 {
        a + b
    }

    #[test]
    fn addresses_round_trip() {
        let f: extern "C" fn(i32, i32) -> i32 = add;
        assert_eq!(<extern "C" fn(i32, i32) -> i32 as Function>::ARITY, 2);
        assert_eq!(<unsafe extern "C" fn() as Function>::ARITY, 0);

        let address = f.to_address();
        assert_ne!(address, 0);
        let back = unsafe { <extern "C" fn(i32, i32) -> i32>::from_address(address) };
        assert_eq!(back(2, 3), 5);
    }
}
