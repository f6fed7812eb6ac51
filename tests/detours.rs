//! Native and method detours on real code.
//!
//! Scratch functions live in anonymous executable mappings, so every test patches memory of its
//! own; detours between Rust functions use functions no other test touches.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

mod common;

use std::hint::black_box;

use common::{executable, init_logging, jump_target, read_code};
use detourcore::{
    detour::{DetourFactory, Function},
    platform::{arch::DetourKind, method::MethodHandle, PlatformTriple},
    Error,
};

/// `mov eax, 7; ret`, padded with `nop`s
fn seven() -> Vec<u8> {
    let mut code = vec![0xb8, 0x07, 0x00, 0x00, 0x00, 0xc3];
    code.resize(32, 0x90);
    code
}

type Getter = extern "C" fn() -> u32;

extern "C" fn forty_two() -> u32 {
    black_box(42)
}

extern "C" fn forty_three() -> u32 {
    black_box(43)
}

fn call(address: usize) -> u32 {
    let function = unsafe { <Getter as Function>::from_address(address) };
    black_box(function)()
}

#[test]
fn simple_detour_writes_a_jump_and_undoes_it() {
    init_logging();
    let triple = PlatformTriple::current().unwrap();
    let code = executable(&seven());
    let from = code.as_ptr() as usize;
    let original = read_code(from, 16);
    assert_eq!(call(from), 7);

    let mut detour = unsafe {
        triple
            .create_simple_detour(from, forty_two as usize, None)
            .unwrap()
    };
    assert!(detour.is_applied());
    assert_eq!(detour.source(), from);
    assert_eq!(jump_target(from), forty_two as usize);
    assert_eq!(detour.backup(), &original[..detour.kind().size()]);
    assert_eq!(call(from), 42);

    detour.undo().unwrap();
    assert!(!detour.is_applied());
    assert_eq!(read_code(from, 16), original);
    assert_eq!(call(from), 7);
    assert!(matches!(detour.undo(), Err(Error::Disposed(_))));
}

#[test]
fn retarget_redirects_the_jump() {
    init_logging();
    let triple = PlatformTriple::current().unwrap();
    let code = executable(&seven());
    let from = code.as_ptr() as usize;
    let original = read_code(from, 16);

    let mut detour = unsafe {
        triple
            .create_simple_detour(from, forty_two as usize, None)
            .unwrap()
    };
    unsafe { detour.retarget(forty_three as usize).unwrap() };
    assert_eq!(detour.destination(), forty_three as usize);
    assert_eq!(jump_target(from), forty_three as usize);
    assert_eq!(call(from), 43);

    detour.undo().unwrap();
    assert_eq!(read_code(from, 16), original);
}

#[test]
fn size_hint_limits_the_encoding() {
    init_logging();
    let triple = PlatformTriple::current().unwrap();
    let code = executable(&seven());
    let from = code.as_ptr() as usize;
    // In the same mapping, so a rel32 jump reaches
    let to = from + 16;

    let detour = unsafe { triple.create_simple_detour(from, to, Some(5)).unwrap() };
    assert_eq!(detour.kind(), DetourKind::Rel32);
    assert_eq!(read_code(from, 1), [0xe9]);
    assert_eq!(jump_target(from), to);
}

#[test]
fn retarget_out_of_range_grows_to_the_smallest_encoding() {
    init_logging();
    let triple = PlatformTriple::current().unwrap();
    let code = executable(&seven());
    let from = code.as_ptr() as usize;
    let original = read_code(from, 16);

    let mut detour = unsafe { triple.create_simple_detour(from, from + 16, None).unwrap() };
    assert_eq!(detour.kind(), DetourKind::Rel32);

    // Never called, only decoded
    let far = from ^ (1 << 46);
    unsafe { detour.retarget(far).unwrap() };
    assert_eq!(detour.kind(), DetourKind::Rel32Ind64);
    assert_eq!(detour.backup(), &original[..DetourKind::Rel32Ind64.size()]);
    assert_eq!(jump_target(from), far);

    unsafe { detour.retarget(forty_two as usize).unwrap() };
    assert_eq!(detour.kind(), DetourKind::Rel32Ind64);
    assert_eq!(call(from), 42);

    detour.undo().unwrap();
    assert_eq!(read_code(from, 16), original);
    assert_eq!(call(from), 7);
}

#[test]
fn alternate_entry_runs_the_original_code() {
    init_logging();
    let triple = PlatformTriple::current().unwrap();
    let code = executable(&seven());
    let from = code.as_ptr() as usize;

    let mut detour = unsafe {
        triple
            .create_native_detour(from, forty_two as usize, None)
            .unwrap()
    };
    let alt_entry = detour.alt_entry().unwrap();
    assert_ne!(alt_entry, from);
    assert_eq!(call(from), 42);
    assert_eq!(call(alt_entry), 7);

    unsafe { detour.retarget(forty_three as usize).unwrap() };
    assert_eq!(call(from), 43);
    assert_eq!(call(alt_entry), 7);

    detour.undo().unwrap();
    assert_eq!(call(from), 7);
}

#[inline(never)]
extern "C" fn scaled(x: u64) -> u64 {
    black_box(x).wrapping_mul(3).wrapping_add(black_box(1))
}

#[inline(never)]
extern "C" fn scaled_replacement(x: u64) -> u64 {
    black_box(x).wrapping_mul(100)
}

#[test]
fn core_detour_between_functions() {
    init_logging();
    let factory = DetourFactory::new(PlatformTriple::current().unwrap()).unwrap();
    let source = MethodHandle::function(scaled as usize);
    let target = MethodHandle::function(scaled_replacement as usize);
    let call = |x| black_box(scaled as extern "C" fn(u64) -> u64)(x);
    assert_eq!(call(2), 7);

    let detour = unsafe { factory.create_detour(&source, &target, false).unwrap() };
    assert!(!detour.is_applied());
    assert_eq!(detour.original_entry().unwrap(), None);

    unsafe { detour.apply().unwrap() };
    assert!(detour.is_applied());
    assert_eq!(detour.source_entry().unwrap(), Some(scaled as usize));
    assert_eq!(call(2), 200);
    assert!(matches!(
        unsafe { detour.apply() },
        Err(Error::InvalidState(_))
    ));

    let original = detour.original_entry().unwrap().unwrap();
    let original = unsafe { <extern "C" fn(u64) -> u64>::from_address(original) };
    assert_eq!(black_box(original)(2), 7);

    detour.undo().unwrap();
    assert_eq!(call(2), 7);
    assert!(matches!(detour.undo(), Err(Error::Disposed(_))));

    unsafe { detour.apply().unwrap() };
    assert_eq!(call(3), 300);
    drop(detour);
    assert_eq!(call(3), 10);
}

#[test]
fn detouring_a_method_to_itself_is_rejected() {
    init_logging();
    let factory = DetourFactory::new(PlatformTriple::current().unwrap()).unwrap();
    let method = MethodHandle::function(scaled as usize);
    let wrapped = MethodHandle::wrapped(9, method.clone());

    let result = unsafe { factory.create_detour(&method, &wrapped, true) };
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}
