//! Empirical calling convention detection.
//!
//! Instead of trusting what a runtime declares, the self-test detours a probe function that takes
//! a this pointer, two recognisable user arguments and a large by-value return to a target that
//! receives everything as plain machine words. Which words come out equal reveals where the
//! return buffer, the this pointer and the user arguments sit.
//!
//! How structs travel is described with [`StructKindFlags`]: every struct shape is mapped to a
//! kind, and a [`SelftestClassifier`] answers classification queries by looking that kind up in
//! the sets of kinds observed in registers.

use std::{
    hint::black_box,
    ptr::addr_of_mut,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use log::{debug, info};
use strum::{Display, EnumIter};

use crate::{
    detour::SimpleNativeDetour,
    platform::{
        abi::{Abi, PrimitiveType, SpecialArgumentKind, StructLayout, TypeClassification, TypeLayout},
        arch::Architecture,
        system::System,
    },
    Error, Result,
};

/// Where the return buffer, the this pointer and the user arguments sit, in argument order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum ArgumentOrder {
    /// Return buffer, this, arguments
    RetThisArgs,
    /// This, return buffer, arguments
    ThisRetArgs,
    /// This, arguments, return buffer
    ThisArgsRet,
    /// Return buffer, arguments, this
    RetArgsThis,
    /// Arguments, this, return buffer
    ArgsThisRet,
    /// Arguments, return buffer, this
    ArgsRetThis,
}

impl ArgumentOrder {
    /// The order as an [`Abi`] argument order.
    #[must_use]
    pub fn special_arguments(self) -> Vec<SpecialArgumentKind> {
        use SpecialArgumentKind::{ReturnBuffer as Ret, ThisPointer as This, UserArguments as Args};
        match self {
            ArgumentOrder::RetThisArgs => vec![Ret, This, Args],
            ArgumentOrder::ThisRetArgs => vec![This, Ret, Args],
            ArgumentOrder::ThisArgsRet => vec![This, Args, Ret],
            ArgumentOrder::RetArgsThis => vec![Ret, Args, This],
            ArgumentOrder::ArgsThisRet => vec![Args, This, Ret],
            ArgumentOrder::ArgsRetThis => vec![Args, Ret, This],
        }
    }
}

/// Classifies the five machine words the probe passed.
///
/// The probe is called as `instance.probe(record, instance, record)` with a large return value,
/// so the user argument block reads `record, instance, record`. The block is located by pointer
/// identity; of the two remaining words one must be the this pointer and the other the return
/// buffer.
///
/// # Errors
/// Returns [`Error::UnrecognizedAbi`] unless exactly one documented order explains the words.
pub fn classify_argument_order(
    words: [usize; 5],
    instance: usize,
    record: usize,
) -> Result<ArgumentOrder> {
    let mut found = None;
    for start in 0..=2 {
        if words[start..start + 3] != [record, instance, record] {
            continue;
        }

        let mut rest = (0..5).filter(|index| !(start..start + 3).contains(index));
        let (Some(first), Some(second)) = (rest.next(), rest.next()) else {
            continue;
        };
        let (this, ret) = if words[first] == instance && words[second] != instance {
            (first, second)
        } else if words[second] == instance && words[first] != instance {
            (second, first)
        } else {
            continue;
        };
        if words[ret] == record {
            continue;
        }

        let order = match (start, this < ret) {
            (0, true) => ArgumentOrder::ArgsThisRet,
            (0, false) => ArgumentOrder::ArgsRetThis,
            (1, true) => ArgumentOrder::ThisArgsRet,
            (1, false) => ArgumentOrder::RetArgsThis,
            (_, true) => ArgumentOrder::ThisRetArgs,
            (_, false) => ArgumentOrder::RetThisArgs,
        };
        if found.replace(order).is_some() {
            found = None;
            break;
        }
    }

    found.ok_or_else(|| Error::UnrecognizedAbi {
        observed: format!(
            "{words:#x?} for instance {instance:#x} and record {record:#x}"
        ),
    })
}

#[allow(missing_docs)]
mod struct_kind_flags {
    use bitflags::bitflags;

    bitflags! {
        /// Struct shapes, as far as calling conventions distinguish them.
        ///
        /// `HFA_*` are homogeneous float aggregates, `INT*`, `LONG*`, `BYTE*` and `SHORT*` are
        /// homogeneous integer aggregates of that many fields, `ODD_SIZE*` are structs of an unusual
        /// size and `X*` are all other structs of that size.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[allow(missing_docs)]
        pub struct StructKindFlags: u64 {
            const HFA_FLOAT1 = 0x1;
            const HFA_FLOAT2 = 0x2;
            const HFA_FLOAT3 = 0x4;
            const HFA_FLOAT4 = 0x8;
            const HFA_DOUBLE1 = 0x10;
            const HFA_DOUBLE2 = 0x20;
            const HFA_DOUBLE3 = 0x40;
            const HFA_DOUBLE4 = 0x80;
            const INT1 = 0x100;
            const INT2 = 0x200;
            const INT3 = 0x400;
            const INT4 = 0x800;
            const LONG1 = 0x1000;
            const LONG2 = 0x2000;
            const LONG3 = 0x4000;
            const LONG4 = 0x8000;
            const BYTE1 = 0x1_0000;
            const BYTE2 = 0x2_0000;
            const BYTE3 = 0x4_0000;
            const BYTE4 = 0x8_0000;
            const SHORT1 = 0x10_0000;
            const SHORT2 = 0x20_0000;
            const SHORT3 = 0x40_0000;
            const SHORT4 = 0x80_0000;
            const ODD_SIZE3 = 0x100_0000;
            const ODD_SIZE5 = 0x200_0000;
            const ODD_SIZE6 = 0x400_0000;
            const ODD_SIZE7 = 0x800_0000;
            const ODD_SIZE9 = 0x1000_0000;
            const X1 = 1 << 32;
            const X2 = 1 << 33;
            const X3 = 1 << 34;
            const X4 = 1 << 35;
            const X5 = 1 << 36;
            const X6 = 1 << 37;
            const X7 = 1 << 38;
            const X8 = 1 << 39;
            const X9 = 1 << 40;
            const X10 = 1 << 41;
            const X11 = 1 << 42;
            const X12 = 1 << 43;
            const X13 = 1 << 44;
            const X14 = 1 << 45;
            const X15 = 1 << 46;
            const X16 = 1 << 47;
            const EMPTY = 1 << 63;
        }
    }
}
pub use struct_kind_flags::StructKindFlags;

/// Field families of homogeneous structs.
#[derive(Clone, Copy, PartialEq, Eq)]
enum FieldFamily {
    Float,
    Double,
    Int,
    Long,
    Byte,
    Short,
}

impl FieldFamily {
    fn of(field: &TypeLayout) -> Option<Self> {
        match field {
            TypeLayout::Reference | TypeLayout::Pointer | TypeLayout::ByRef => {
                Some(FieldFamily::Long)
            }
            TypeLayout::Primitive(primitive) => match primitive {
                PrimitiveType::F32 => Some(FieldFamily::Float),
                PrimitiveType::F64 => Some(FieldFamily::Double),
                PrimitiveType::I32 | PrimitiveType::U32 => Some(FieldFamily::Int),
                PrimitiveType::I64 | PrimitiveType::U64 => Some(FieldFamily::Long),
                PrimitiveType::ISize | PrimitiveType::USize => Some(FieldFamily::Long),
                PrimitiveType::I8 | PrimitiveType::U8 => Some(FieldFamily::Byte),
                PrimitiveType::I16 | PrimitiveType::U16 => Some(FieldFamily::Short),
                PrimitiveType::Bool | PrimitiveType::Char => None,
            },
            _ => None,
        }
    }

    fn first_flag(self) -> StructKindFlags {
        match self {
            FieldFamily::Float => StructKindFlags::HFA_FLOAT1,
            FieldFamily::Double => StructKindFlags::HFA_DOUBLE1,
            FieldFamily::Int => StructKindFlags::INT1,
            FieldFamily::Long => StructKindFlags::LONG1,
            FieldFamily::Byte => StructKindFlags::BYTE1,
            FieldFamily::Short => StructKindFlags::SHORT1,
        }
    }
}

fn x_kind(size: usize) -> Option<StructKindFlags> {
    if (1..=16).contains(&size) {
        StructKindFlags::from_bits(StructKindFlags::X1.bits() << (size - 1))
    } else {
        None
    }
}

/// Maps a type to its struct kind, or `None` if it is too large to have one.
///
/// Odd sizes are checked before field types.
#[must_use]
pub fn struct_kind(ty: &TypeLayout) -> Option<StructKindFlags> {
    let fields: Vec<&TypeLayout> = match ty {
        TypeLayout::Struct(layout) => {
            if let [TypeLayout::Struct(_)] = layout.fields.as_slice() {
                return struct_kind(&layout.fields[0]);
            }
            if layout.fields.is_empty() {
                return if layout.size == 1 {
                    Some(StructKindFlags::EMPTY)
                } else {
                    x_kind(layout.size)
                };
            }
            layout.fields.iter().collect()
        }
        TypeLayout::Void => return None,
        other => vec![other],
    };

    let size = ty.size();
    match size {
        3 => return Some(StructKindFlags::ODD_SIZE3),
        5 => return Some(StructKindFlags::ODD_SIZE5),
        6 => return Some(StructKindFlags::ODD_SIZE6),
        7 => return Some(StructKindFlags::ODD_SIZE7),
        9 => return Some(StructKindFlags::ODD_SIZE9),
        _ => {}
    }

    if fields.len() > 4 {
        return x_kind(size);
    }

    let Some(family) = FieldFamily::of(fields[0]) else {
        return x_kind(size);
    };
    if fields[1..]
        .iter()
        .any(|field| FieldFamily::of(field) != Some(family))
    {
        return x_kind(size);
    }

    StructKindFlags::from_bits(family.first_flag().bits() << (fields.len() - 1))
}

/// A representative type of a single struct kind.
fn representative(kind: StructKindFlags) -> TypeLayout {
    let homogeneous = |primitive: PrimitiveType, count: u32| {
        TypeLayout::Struct(StructLayout::new(
            (0..count).map(|_| TypeLayout::Primitive(primitive)).collect(),
        ))
    };

    let bits = kind.bits();
    let nth = |first: StructKindFlags| (bits / first.bits()).trailing_zeros() + 1;

    if kind == StructKindFlags::EMPTY {
        TypeLayout::Struct(StructLayout::new(Vec::new()))
    } else if kind == StructKindFlags::X1 {
        homogeneous(PrimitiveType::Bool, 1)
    } else if bits >= StructKindFlags::X2.bits() {
        let size = (bits / StructKindFlags::X1.bits()).trailing_zeros() as usize + 1;
        TypeLayout::Struct(StructLayout::with_size(size, 1, Vec::new()))
    } else if bits >= StructKindFlags::ODD_SIZE3.bits() {
        let size = [3, 5, 6, 7, 9][(bits / StructKindFlags::ODD_SIZE3.bits()).trailing_zeros() as usize];
        homogeneous(PrimitiveType::U8, size)
    } else if bits >= StructKindFlags::SHORT1.bits() {
        homogeneous(PrimitiveType::I16, nth(StructKindFlags::SHORT1))
    } else if bits >= StructKindFlags::BYTE1.bits() {
        homogeneous(PrimitiveType::U8, nth(StructKindFlags::BYTE1))
    } else if bits >= StructKindFlags::LONG1.bits() {
        homogeneous(PrimitiveType::I64, nth(StructKindFlags::LONG1))
    } else if bits >= StructKindFlags::INT1.bits() {
        homogeneous(PrimitiveType::I32, nth(StructKindFlags::INT1))
    } else if bits >= StructKindFlags::HFA_DOUBLE1.bits() {
        homogeneous(PrimitiveType::F64, nth(StructKindFlags::HFA_DOUBLE1))
    } else {
        homogeneous(PrimitiveType::F32, nth(StructKindFlags::HFA_FLOAT1))
    }
}

/// The kinds that `abi` passes in registers, as a return value if `is_return`.
#[must_use]
pub fn register_kinds(abi: &Abi, is_return: bool) -> StructKindFlags {
    StructKindFlags::all()
        .iter()
        .filter(|kind| {
            abi.classify(&representative(*kind), is_return) == TypeClassification::InRegister
        })
        .fold(StructKindFlags::empty(), |acc, kind| acc | kind)
}

/// Classifies types by looking their [`StructKindFlags`] up in observed register sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelftestClassifier {
    /// Kinds returned in registers
    pub returned_by_value: StructKindFlags,
    /// Kinds passed in registers
    pub passed_by_value: StructKindFlags,
}

impl SelftestClassifier {
    /// Classifies `ty` as an argument, or as the return type if `is_return`.
    ///
    /// Types without a kind are too large for registers; returns then go through a return
    /// buffer and arguments are copied onto the stack.
    #[must_use]
    pub fn classify(&self, ty: &TypeLayout, is_return: bool) -> TypeClassification {
        let compare = if is_return {
            self.returned_by_value
        } else {
            self.passed_by_value
        };

        match struct_kind(ty) {
            Some(kind) if compare.contains(kind) => TypeClassification::InRegister,
            _ if is_return => TypeClassification::ByReference,
            _ => TypeClassification::OnStack,
        }
    }
}

/// Large enough to be returned through a return buffer on every supported convention.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct ProbeReturn {
    words: [usize; 5],
}

#[repr(C)]
#[derive(Debug, Default)]
struct ProbeRecord {
    marker: usize,
}

#[repr(C)]
#[derive(Debug, Default)]
struct ProbeInstance {
    marker: usize,
}

static OBSERVED: Mutex<Option<[usize; 5]>> = Mutex::new(None);
static PROBE_INSTANCE: AtomicUsize = AtomicUsize::new(0);
static PROBE_RECORD: AtomicUsize = AtomicUsize::new(0);
static SELFTEST: Mutex<()> = Mutex::new(());

#[inline(never)]
extern "C" fn argument_order_probe(
    this: *mut ProbeInstance,
    first: *mut ProbeRecord,
    instance: *mut ProbeInstance,
    second: *mut ProbeRecord,
) -> ProbeReturn {
    black_box((this, first, instance, second));
    ProbeReturn::default()
}

extern "C" fn argument_order_target(a: usize, b: usize, c: usize, d: usize, e: usize) -> usize {
    if let Ok(mut observed) = OBSERVED.lock() {
        *observed = Some([a, b, c, d, e]);
    }
    let instance = PROBE_INSTANCE.load(Ordering::SeqCst);
    let record = PROBE_RECORD.load(Ordering::SeqCst);
    [a, b, c, d, e]
        .into_iter()
        .find(|word| *word != instance && *word != record)
        .unwrap_or(a)
}

#[inline(never)]
extern "C" fn return_buffer_probe() -> ProbeReturn {
    black_box(ProbeReturn::default())
}

/// Detours the probe, calls it and classifies what the target saw.
///
/// # Safety
/// Patches the code of a private probe function of this crate.
unsafe fn detect_argument_order(
    architecture: &Arc<dyn Architecture>,
    system: &Arc<dyn System>,
) -> Result<ArgumentOrder> {
    type Probe = extern "C" fn(
        *mut ProbeInstance,
        *mut ProbeRecord,
        *mut ProbeInstance,
        *mut ProbeRecord,
    ) -> ProbeReturn;

    let probe: Probe = argument_order_probe;
    let mut detour = SimpleNativeDetour::apply(
        architecture.clone(),
        system.clone(),
        probe as usize,
        argument_order_target as usize,
        None,
    )?;

    *lock!(OBSERVED) = None;
    let mut instance = ProbeInstance { marker: 1 };
    let mut record = ProbeRecord { marker: 2 };
    let instance_ptr = addr_of_mut!(instance);
    let record_ptr = addr_of_mut!(record);
    PROBE_INSTANCE.store(instance_ptr as usize, Ordering::SeqCst);
    PROBE_RECORD.store(record_ptr as usize, Ordering::SeqCst);

    let probe: Probe = black_box(probe);
    black_box(probe(instance_ptr, record_ptr, instance_ptr, record_ptr));
    detour.undo()?;

    let observed = lock!(OBSERVED).take().ok_or_else(|| Error::UnrecognizedAbi {
        observed: "probe was not redirected".to_string(),
    })?;
    debug!("Argument order probe observed {observed:x?}");
    classify_argument_order(observed, instance_ptr as usize, record_ptr as usize)
}

/// Whether a callee hands back the return buffer it was given.
fn detect_returns_return_buffer() -> bool {
    type Reinterpreted = extern "C" fn(*mut ProbeReturn) -> *mut ProbeReturn;

    let probe: extern "C" fn() -> ProbeReturn = return_buffer_probe;
    // SAFETY: a large return value is passed as a hidden first pointer argument, which is exactly
    // the signature the probe is reinterpreted as
    let probe: Reinterpreted = unsafe { std::mem::transmute(probe) };

    let mut buffer = ProbeReturn::default();
    let buffer_ptr = addr_of_mut!(buffer);
    black_box(probe)(buffer_ptr) == buffer_ptr
}

/// Determines the calling convention by running the probes.
///
/// The argument order and the return buffer behaviour are observed; the register sets of the
/// struct classifier are derived from `reference` (the declared ABI, falling back to the system
/// default).
///
/// # Errors
/// Returns [`Error::UnrecognizedAbi`] if the observation matches no known order or no reference
/// classification is available, and propagates detour failures.
pub fn detect_abi(
    architecture: &Arc<dyn Architecture>,
    system: &Arc<dyn System>,
    reference: Option<&Abi>,
) -> Result<Abi> {
    let _serial = lock!(SELFTEST);

    let fallback = system.default_abi();
    let reference = reference
        .or(fallback.as_ref())
        .ok_or_else(|| Error::UnrecognizedAbi {
            observed: "no classification rules to compare against".to_string(),
        })?;

    // SAFETY: only this module's probe function is patched, and undone before returning
    let order = unsafe { detect_argument_order(architecture, system)? };
    let returns_return_buffer = detect_returns_return_buffer();

    let classifier = SelftestClassifier {
        returned_by_value: register_kinds(reference, true),
        passed_by_value: register_kinds(reference, false),
    };
    info!(
        "ABI self-test: order {order}, returns return buffer {returns_return_buffer}"
    );

    Ok(Abi::new(
        order.special_arguments(),
        Arc::new(move |ty, is_return| classifier.classify(ty, is_return)),
        returns_return_buffer,
    ))
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    const RET: usize = 0x100;
    const INSTANCE: usize = 0x200;
    const RECORD: usize = 0x300;

    fn words(order: ArgumentOrder) -> [usize; 5] {
        let mut out = Vec::new();
        for kind in order.special_arguments() {
            match kind {
                SpecialArgumentKind::ReturnBuffer => out.push(RET),
                SpecialArgumentKind::ThisPointer => out.push(INSTANCE),
                _ => out.extend_from_slice(&[RECORD, INSTANCE, RECORD]),
            }
        }
        [out[0], out[1], out[2], out[3], out[4]]
    }

    #[test]
    fn every_order_is_recognised() {
        for order in ArgumentOrder::iter() {
            assert_eq!(
                classify_argument_order(words(order), INSTANCE, RECORD).unwrap(),
                order
            );
        }
    }

    #[test]
    fn unrelated_words_are_rejected() {
        assert!(matches!(
            classify_argument_order([1, 2, 3, 4, 5], INSTANCE, RECORD),
            Err(Error::UnrecognizedAbi { .. })
        ));
        assert!(matches!(
            classify_argument_order([RECORD, INSTANCE, RECORD, INSTANCE, INSTANCE], INSTANCE, RECORD),
            Err(Error::UnrecognizedAbi { .. })
        ));
    }

    #[test]
    fn struct_kinds() {
        let fields = |primitive: PrimitiveType, count: usize| {
            TypeLayout::Struct(StructLayout::new(vec![
                TypeLayout::Primitive(primitive);
                count
            ]))
        };

        assert_eq!(
            struct_kind(&TypeLayout::Struct(StructLayout::new(Vec::new()))),
            Some(StructKindFlags::EMPTY)
        );
        assert_eq!(struct_kind(&fields(PrimitiveType::F32, 3)), Some(StructKindFlags::HFA_FLOAT3));
        assert_eq!(struct_kind(&fields(PrimitiveType::F64, 4)), Some(StructKindFlags::HFA_DOUBLE4));
        assert_eq!(struct_kind(&fields(PrimitiveType::I32, 2)), Some(StructKindFlags::INT2));
        assert_eq!(struct_kind(&fields(PrimitiveType::U8, 3)), Some(StructKindFlags::ODD_SIZE3));
        assert_eq!(struct_kind(&fields(PrimitiveType::U8, 4)), Some(StructKindFlags::BYTE4));
        assert_eq!(struct_kind(&TypeLayout::Pointer), Some(StructKindFlags::LONG1));
        assert_eq!(
            struct_kind(&TypeLayout::Primitive(PrimitiveType::I16)),
            Some(StructKindFlags::SHORT1)
        );

        let mixed = TypeLayout::Struct(StructLayout::new(vec![
            TypeLayout::Primitive(PrimitiveType::I32),
            TypeLayout::Primitive(PrimitiveType::F32),
        ]));
        assert_eq!(struct_kind(&mixed), Some(StructKindFlags::X8));

        let wrapped = TypeLayout::Struct(StructLayout::new(vec![fields(PrimitiveType::I64, 2)]));
        assert_eq!(struct_kind(&wrapped), Some(StructKindFlags::LONG2));

        assert_eq!(struct_kind(&fields(PrimitiveType::I64, 3)), Some(StructKindFlags::LONG3));
        let large = TypeLayout::Struct(StructLayout::with_size(24, 8, Vec::new()));
        assert_eq!(struct_kind(&large), None);
    }

    #[test]
    fn representatives_round_trip() {
        // three bytes and three shorts have odd sizes, which take precedence
        let shadowed = StructKindFlags::BYTE3 | StructKindFlags::SHORT3;
        for kind in StructKindFlags::all().difference(shadowed).iter() {
            assert_eq!(struct_kind(&representative(kind)), Some(kind), "{kind:?}");
        }
    }

    #[test]
    fn classifier_lookup() {
        let classifier = SelftestClassifier {
            returned_by_value: StructKindFlags::LONG1 | StructKindFlags::LONG2,
            passed_by_value: StructKindFlags::LONG1,
        };
        let two_longs = TypeLayout::Struct(StructLayout::new(vec![
            TypeLayout::Primitive(PrimitiveType::I64),
            TypeLayout::Primitive(PrimitiveType::I64),
        ]));

        assert_eq!(classifier.classify(&two_longs, true), TypeClassification::InRegister);
        assert_eq!(classifier.classify(&two_longs, false), TypeClassification::OnStack);

        let huge = TypeLayout::Struct(StructLayout::with_size(64, 8, Vec::new()));
        assert_eq!(classifier.classify(&huge, true), TypeClassification::ByReference);
    }

    #[test]
    fn system_v_register_kinds() {
        let kinds = register_kinds(&Abi::system_v_amd64(), true);
        assert!(kinds.contains(StructKindFlags::LONG2));
        assert!(kinds.contains(StructKindFlags::HFA_FLOAT4));
        assert!(!kinds.contains(StructKindFlags::LONG3));
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn returns_return_buffer_on_system_v() {
        assert!(detect_returns_return_buffer());
    }
}
