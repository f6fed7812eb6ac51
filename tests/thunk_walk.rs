//! Resolving methods that sit behind runtime stubs, and detours that follow recompilation.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

mod common;

use std::hint::black_box;

use common::{absolute_jump, triple_with, TestRuntime};
use detourcore::{
    config::PlatformConfig,
    detour::DetourFactory,
    platform::{method::MethodHandle, PlatformTriple},
    Error,
};

type Unary = extern "C" fn(u64) -> u64;

#[inline(never)]
extern "C" fn body_plain(x: u64) -> u64 {
    black_box(x).wrapping_add(black_box(1_000))
}

#[inline(never)]
extern "C" fn body_lazy(x: u64) -> u64 {
    black_box(x).wrapping_add(black_box(2_000))
}

fn call_entry(entry: usize, x: u64) -> u64 {
    let function: Unary = unsafe { std::mem::transmute::<usize, Unary>(entry) };
    black_box(function)(x)
}

#[test]
fn walks_through_jump_stubs() {
    let runtime = TestRuntime::new();
    runtime.add_compiled(1, body_plain as usize);
    // A stub in front of the stub
    let first = runtime.entry(1);
    runtime.add_raw(2, |_| absolute_jump(first));

    let triple = triple_with(runtime.clone());
    assert_eq!(
        triple.resolve_entry_point(&MethodHandle::Token(1)).unwrap(),
        body_plain as usize
    );
    assert_eq!(
        triple
            .resolve_entry_point(&MethodHandle::wrapped(5, MethodHandle::Token(2)))
            .unwrap(),
        body_plain as usize
    );
    assert_eq!(runtime.compiles(), 0);
    assert_eq!(call_entry(runtime.entry(2), 1), 1_001);
}

#[test]
fn compiles_through_fixup_precode_once() {
    let runtime = TestRuntime::new();
    runtime.add_uncompiled(1, body_lazy as usize);
    let triple = triple_with(runtime.clone());

    assert_eq!(
        triple.resolve_entry_point(&MethodHandle::Token(1)).unwrap(),
        body_lazy as usize
    );
    assert_eq!(runtime.compiles(), 1);

    // Compiled now; resolving again does not compile
    assert_eq!(
        triple.resolve_entry_point(&MethodHandle::Token(1)).unwrap(),
        body_lazy as usize
    );
    assert_eq!(runtime.compiles(), 1);
}

#[test]
fn precode_that_survives_compilation_is_an_error() {
    let runtime = TestRuntime::new();
    runtime.add_broken(1);
    let triple = triple_with(runtime.clone());

    let result = triple.resolve_entry_point(&MethodHandle::Token(1));
    assert!(matches!(result, Err(Error::MethodBodyNotFound(_))));
    assert_eq!(runtime.compiles(), 1);
}

#[test]
fn self_referencing_stub_settles() {
    let runtime = TestRuntime::new();
    runtime.add_raw(1, absolute_jump);
    let triple = triple_with(runtime.clone());

    let entry = runtime.entry(1);
    assert_eq!(
        triple.resolve_entry_point(&MethodHandle::Token(1)).unwrap(),
        entry
    );
}

#[test]
fn stub_cycles_exhaust_the_walk() {
    let runtime = TestRuntime::new();
    // Two stubs in one mapping jumping to each other
    runtime.add_raw(1, |base| {
        let mut code = absolute_jump(base + 16);
        code.resize(16, 0xcc);
        code.extend(absolute_jump(base));
        code
    });

    let triple = triple_with(runtime.clone());
    let result = triple.resolve_entry_point(&MethodHandle::Token(1));
    assert!(matches!(result, Err(Error::MethodBodyNotFound(_))));
}

#[test]
fn unknown_methods_have_no_body() {
    let triple = triple_with(TestRuntime::new());
    assert!(matches!(
        triple.resolve_entry_point(&MethodHandle::Token(77)),
        Err(Error::MethodBodyNotFound(_))
    ));
}

#[test]
fn walk_bound_comes_from_the_config() {
    let runtime = TestRuntime::new();
    runtime.add_compiled(1, body_plain as usize);
    let mut entry = runtime.entry(1);
    for token in 2..6 {
        runtime.add_raw(token, |_| absolute_jump(entry));
        entry = runtime.entry(token);
    }

    let triple = triple_with(runtime.clone());
    let short = PlatformTriple::with_config(
        triple.architecture().clone(),
        triple.system().clone(),
        runtime.clone(),
        PlatformConfig::default().with_max_thunk_walk_iterations(3),
    )
    .unwrap();

    assert_eq!(
        triple.resolve_entry_point(&MethodHandle::Token(5)).unwrap(),
        body_plain as usize
    );
    assert!(matches!(
        short.resolve_entry_point(&MethodHandle::Token(5)),
        Err(Error::MethodBodyNotFound(_))
    ));
}

#[inline(never)]
extern "C" fn recompiled_source_v1(x: u64) -> u64 {
    black_box(x).wrapping_add(black_box(10))
}

#[inline(never)]
extern "C" fn recompiled_source_v2(x: u64) -> u64 {
    black_box(x).wrapping_add(black_box(20))
}

#[inline(never)]
extern "C" fn recompiled_target_v1(x: u64) -> u64 {
    black_box(x).wrapping_mul(black_box(3))
}

#[inline(never)]
extern "C" fn recompiled_target_v2(x: u64) -> u64 {
    black_box(x).wrapping_mul(black_box(4))
}

#[test]
fn detours_follow_recompiled_methods() {
    let runtime = TestRuntime::new();
    runtime.add_compiled(1, recompiled_source_v1 as usize);
    runtime.add_uncompiled(2, recompiled_target_v1 as usize);
    let triple = triple_with(runtime.clone());

    let factory = DetourFactory::new(triple).unwrap();
    assert_eq!(runtime.subscribers(), 1);

    let detour = unsafe {
        factory
            .create_detour(&MethodHandle::Token(1), &MethodHandle::Token(2), true)
            .unwrap()
    };
    assert_eq!(call_entry(runtime.entry(1), 5), 15);
    assert_eq!(call_entry(runtime.entry(2), 5), 15);

    // The source moves: the fresh code is detoured
    runtime.recompile(1, recompiled_source_v2 as usize);
    assert!(detour.is_applied());
    assert_eq!(
        detour.source_entry().unwrap(),
        Some(recompiled_source_v2 as usize)
    );
    assert_eq!(call_entry(runtime.entry(1), 5), 15);

    // The target moves: the detour now leads to the fresh code
    runtime.recompile(2, recompiled_target_v2 as usize);
    assert_eq!(call_entry(runtime.entry(1), 5), 20);

    let original = detour.original_entry().unwrap().unwrap();
    assert_eq!(call_entry(original, 5), 25);

    drop(detour);
    assert_eq!(call_entry(runtime.entry(1), 5), 25);
}
