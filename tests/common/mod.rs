//! Fixtures shared by the integration tests.
//!
//! - executable scratch code in anonymous mappings
//! - decoding of the jumps a detour writes
//! - a runtime whose methods sit behind generated stubs and compile on demand

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use detourcore::{
    platform::{
        abi::Abi,
        arch::{Architecture, X86_64Architecture},
        features::RuntimeFeature,
        method::MethodHandle,
        runtime::{CompileNotifier, CompiledCallback, CompiledMethod, Runtime, RuntimeKind},
        system::{LinuxSystem, System},
        PlatformTriple,
    },
    Error, Result,
};
use iced_x86::{Decoder, DecoderOptions, Mnemonic, OpKind};
use memmap2::{Mmap, MmapMut};

/// Bytes reported as the size of freshly compiled code.
pub const COMPILED_SIZE: usize = 64;

/// `call rel32; pop rsi`, the shape of a fixup precode that compiles its method on first call.
pub const FIXUP_PRECODE: [u8; 8] = [0xe8, 0x00, 0x00, 0x00, 0x00, 0x5e, 0xcc, 0xcc];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `mov rax, target; jmp rax`
pub fn absolute_jump(target: usize) -> Vec<u8> {
    let mut code = vec![0x48, 0xb8];
    code.extend_from_slice(&(target as u64).to_le_bytes());
    code.extend_from_slice(&[0xff, 0xe0]);
    code
}

/// An anonymous read+execute mapping starting with `code`.
pub fn executable(code: &[u8]) -> Mmap {
    let mut map = MmapMut::map_anon(4096).unwrap();
    map[..code.len()].copy_from_slice(code);
    map.make_exec().unwrap()
}

/// Where the jump at `address` leads. Indirect jumps are followed through their cell.
pub fn jump_target(address: usize) -> usize {
    let code = unsafe { std::slice::from_raw_parts(address as *const u8, 16) };
    let mut decoder = Decoder::with_ip(64, code, address as u64, DecoderOptions::NONE);
    let jump = decoder.decode();
    assert_eq!(jump.mnemonic(), Mnemonic::Jmp, "no jump at {address:#x}");

    match jump.op0_kind() {
        OpKind::NearBranch64 => jump.near_branch_target() as usize,
        OpKind::Memory => {
            assert!(jump.is_ip_rel_memory_operand());
            let cell = jump.ip_rel_memory_address() as usize;
            unsafe { std::ptr::read_volatile(cell as *const usize) }
        }
        other => panic!("unexpected jump operand {other:?} at {address:#x}"),
    }
}

/// Bytes currently at `address`.
pub fn read_code(address: usize, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(address as *const u8, len) }.to_vec()
}

/// A triple of the host providers around `runtime`.
pub fn triple_with(runtime: Arc<dyn Runtime>) -> Arc<PlatformTriple> {
    init_logging();
    let system: Arc<dyn System> = Arc::new(LinuxSystem::new());
    let architecture: Arc<dyn Architecture> =
        Arc::new(X86_64Architecture::new(system.clone()).unwrap());
    Arc::new(PlatformTriple::new(architecture, system, runtime).unwrap())
}

struct TestMethod {
    entry: Mmap,
    body: usize,
    compiled: bool,
    compilable: bool,
}

/// A runtime whose methods are reached through stubs.
///
/// Compiled methods are entered through `mov rax, body; jmp rax`; uncompiled ones through a
/// fixup precode that compiling replaces. Every compilation installs a fresh entry stub and is
/// reported to subscribers.
#[derive(Default)]
pub struct TestRuntime {
    methods: Mutex<HashMap<u64, TestMethod>>,
    retired: Mutex<Vec<Mmap>>,
    notifier: CompileNotifier,
    compiles: AtomicUsize,
}

impl TestRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, token: u64, entry: Mmap, body: usize, compiled: bool, compilable: bool) {
        self.methods.lock().unwrap().insert(
            token,
            TestMethod {
                entry,
                body,
                compiled,
                compilable,
            },
        );
    }

    /// A compiled method with its body at `body`.
    pub fn add_compiled(&self, token: u64, body: usize) {
        self.insert(token, executable(&absolute_jump(body)), body, true, true);
    }

    /// A method that is compiled to `body` on demand.
    pub fn add_uncompiled(&self, token: u64, body: usize) {
        self.insert(token, executable(&FIXUP_PRECODE), body, false, true);
    }

    /// A method that stays behind its precode however often it is compiled.
    pub fn add_broken(&self, token: u64) {
        self.insert(token, executable(&FIXUP_PRECODE), 0, false, false);
    }

    /// A method entered through arbitrary `code`. The stub is written by `build`, which gets
    /// the address the stub will live at.
    pub fn add_raw(&self, token: u64, build: impl FnOnce(usize) -> Vec<u8>) {
        let mut map = MmapMut::map_anon(4096).unwrap();
        let code = build(map.as_ptr() as usize);
        map[..code.len()].copy_from_slice(&code);
        self.insert(token, map.make_exec().unwrap(), 0, true, false);
    }

    /// Moves a method to a new body, as tiered recompilation would.
    pub fn recompile(&self, token: u64, body: usize) {
        let method = {
            let mut methods = self.methods.lock().unwrap();
            let method = methods.get_mut(&token).unwrap();
            let stale = std::mem::replace(&mut method.entry, executable(&absolute_jump(body)));
            self.retired.lock().unwrap().push(stale);
            method.body = body;
            method.compiled = true;
            MethodHandle::Token(token)
        };
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.notifier
            .notify(&CompiledMethod {
                method,
                code_start: body,
                code_size: COMPILED_SIZE,
            })
            .unwrap();
    }

    /// Current entry point of `token`.
    pub fn entry(&self, token: u64) -> usize {
        self.methods.lock().unwrap()[&token].entry.as_ptr() as usize
    }

    /// Number of compilations so far.
    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn subscribers(&self) -> usize {
        self.notifier.subscriber_count().unwrap()
    }
}

impl Runtime for TestRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Unknown
    }

    fn features(&self) -> RuntimeFeature {
        RuntimeFeature::REQUIRES_BODY_THUNK_WALKING
            | RuntimeFeature::REQUIRES_CUSTOM_METHOD_COMPILE
            | RuntimeFeature::COMPILE_METHOD_HOOK
            | RuntimeFeature::HAS_KNOWN_ABI
    }

    fn abi(&self) -> Option<Abi> {
        Some(Abi::system_v_amd64())
    }

    fn entry_point(&self, method: &MethodHandle) -> Result<usize> {
        match method.canonical() {
            MethodHandle::Token(token) => self
                .methods
                .lock()
                .unwrap()
                .get(token)
                .map(|method| method.entry.as_ptr() as usize)
                .ok_or_else(|| Error::MethodBodyNotFound(format!("unknown token {token}"))),
            other => Err(Error::MethodBodyNotFound(format!("{other} is not a test method"))),
        }
    }

    fn compile(&self, method: &MethodHandle) -> Result<()> {
        let MethodHandle::Token(token) = method.canonical() else {
            return Err(Error::Compile(format!("{method} is not a test method")));
        };

        let body = {
            let methods = self.methods.lock().unwrap();
            let Some(test_method) = methods.get(token) else {
                return Err(Error::Compile(format!("unknown token {token}")));
            };
            if !test_method.compilable || test_method.compiled {
                self.compiles.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            test_method.body
        };
        self.recompile(*token, body);
        Ok(())
    }

    fn subscribe_compiled(&self, callback: CompiledCallback) -> Result<()> {
        self.notifier.subscribe(callback)
    }
}
