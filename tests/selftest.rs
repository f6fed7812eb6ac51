//! The calling convention self-test on the host.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

mod common;

use std::sync::Arc;

use common::{init_logging, TestRuntime};
use detourcore::{
    config::PlatformConfig,
    platform::{
        abi::{PrimitiveType, SpecialArgumentKind, StructLayout, TypeClassification, TypeLayout},
        arch::{Architecture, X86_64Architecture},
        selftest::detect_abi,
        system::{LinuxSystem, System},
        PlatformTriple,
    },
};

fn homogeneous(primitive: PrimitiveType, count: usize) -> TypeLayout {
    TypeLayout::Struct(StructLayout::new(vec![
        TypeLayout::Primitive(primitive);
        count
    ]))
}

fn host() -> (Arc<dyn Architecture>, Arc<dyn System>) {
    init_logging();
    let system: Arc<dyn System> = Arc::new(LinuxSystem::new());
    let architecture: Arc<dyn Architecture> =
        Arc::new(X86_64Architecture::new(system.clone()).unwrap());
    (architecture, system)
}

#[test]
fn detects_the_system_v_convention() {
    let (architecture, system) = host();
    let abi = detect_abi(&architecture, &system, None).unwrap();

    assert_eq!(
        abi.argument_order(),
        [
            SpecialArgumentKind::ReturnBuffer,
            SpecialArgumentKind::ThisPointer,
            SpecialArgumentKind::UserArguments,
        ]
    );
    assert!(abi.returns_return_buffer());

    let pair = homogeneous(PrimitiveType::U64, 2);
    let triple = homogeneous(PrimitiveType::U64, 3);
    let doubles = homogeneous(PrimitiveType::F64, 2);
    let large = homogeneous(PrimitiveType::U64, 5);

    assert_eq!(abi.classify(&pair, true), TypeClassification::InRegister);
    assert_eq!(abi.classify(&pair, false), TypeClassification::InRegister);
    assert_eq!(abi.classify(&doubles, true), TypeClassification::InRegister);
    assert_eq!(abi.classify(&triple, true), TypeClassification::ByReference);
    assert_eq!(abi.classify(&large, true), TypeClassification::ByReference);
    assert_eq!(abi.classify(&large, false), TypeClassification::OnStack);
}

#[test]
fn triple_replaces_the_declared_abi_when_asked() {
    let (architecture, system) = host();
    let triple = PlatformTriple::with_config(
        architecture,
        system,
        TestRuntime::new(),
        PlatformConfig::default().with_abi_selftest(true),
    )
    .unwrap();

    assert_eq!(
        triple.abi().argument_order(),
        [
            SpecialArgumentKind::ReturnBuffer,
            SpecialArgumentKind::ThisPointer,
            SpecialArgumentKind::UserArguments,
        ]
    );
    assert!(triple.abi().returns_return_buffer());
}
