//! Calling convention descriptions.
//!
//! An [`Abi`] records where the special arguments of a method (this pointer, return buffer,
//! generic context) sit relative to the user arguments, whether the callee hands the return buffer
//! back, and how a given type is physically passed. Types are described with [`TypeLayout`], a
//! small structural model that is sufficient for classification.
//!
//! # Examples
//!
//! ```rust
//! use detourcore::platform::abi::{Abi, PrimitiveType, StructLayout, TypeClassification, TypeLayout};
//!
//! let abi = Abi::system_v_amd64();
//! let big = TypeLayout::Struct(StructLayout::new(vec![
//!     TypeLayout::Primitive(PrimitiveType::I64),
//!     TypeLayout::Primitive(PrimitiveType::I64),
//!     TypeLayout::Primitive(PrimitiveType::I64),
//! ]));
//!
//! assert_eq!(abi.classify(&big, true), TypeClassification::ByReference);
//! assert_eq!(abi.classify(&TypeLayout::Pointer, true), TypeClassification::InRegister);
//! ```

use std::{fmt, sync::Arc};

use strum::{Display, EnumIter};

/// How a value is physically passed or returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum TypeClassification {
    /// The value travels in one or more registers
    InRegister,
    /// The value travels behind a pointer; for returns, a caller-provided return buffer
    ByReference,
    /// The value is copied onto the stack
    OnStack,
}

/// Arguments that are not written by the user but placed by the calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum SpecialArgumentKind {
    /// The instance pointer of an instance method
    ThisPointer,
    /// The hidden pointer to the caller-allocated return value
    ReturnBuffer,
    /// The hidden generic context of shared generic code
    GenericContext,
    /// The block of user-visible arguments
    UserArguments,
}

/// Primitive value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[allow(missing_docs)]
pub enum PrimitiveType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    Char,
    I32,
    U32,
    I64,
    U64,
    ISize,
    USize,
    F32,
    F64,
}

impl PrimitiveType {
    /// Size in bytes.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            PrimitiveType::Bool | PrimitiveType::I8 | PrimitiveType::U8 => 1,
            PrimitiveType::I16 | PrimitiveType::U16 | PrimitiveType::Char => 2,
            PrimitiveType::I32 | PrimitiveType::U32 | PrimitiveType::F32 => 4,
            PrimitiveType::I64 | PrimitiveType::U64 | PrimitiveType::F64 => 8,
            PrimitiveType::ISize | PrimitiveType::USize => std::mem::size_of::<usize>(),
        }
    }

    /// `true` for floating point types.
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, PrimitiveType::F32 | PrimitiveType::F64)
    }
}

/// Structural description of a type, as far as calling conventions care.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeLayout {
    /// No value
    Void,
    /// A garbage-collected object reference
    Reference,
    /// An unmanaged pointer
    Pointer,
    /// A by-reference parameter
    ByRef,
    /// A primitive value
    Primitive(PrimitiveType),
    /// A value type made of fields
    Struct(StructLayout),
}

impl TypeLayout {
    /// Size of a value of this type in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            TypeLayout::Void => 0,
            TypeLayout::Reference | TypeLayout::Pointer | TypeLayout::ByRef => {
                std::mem::size_of::<usize>()
            }
            TypeLayout::Primitive(primitive) => primitive.size(),
            TypeLayout::Struct(layout) => layout.size,
        }
    }

    /// Alignment of a value of this type in bytes.
    #[must_use]
    pub fn align(&self) -> usize {
        match self {
            TypeLayout::Void => 1,
            TypeLayout::Struct(layout) => layout.align,
            other => other.size().max(1),
        }
    }
}

/// Layout of a value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructLayout {
    /// Size in bytes, including padding
    pub size: usize,
    /// Alignment in bytes
    pub align: usize,
    /// Instance fields in declaration order
    pub fields: Vec<TypeLayout>,
}

impl StructLayout {
    /// Lays `fields` out sequentially with natural alignment, like `#[repr(C)]`.
    ///
    /// A struct without fields occupies one byte.
    #[must_use]
    pub fn new(fields: Vec<TypeLayout>) -> Self {
        let mut size = 0usize;
        let mut align = 1usize;
        for field in &fields {
            let field_align = field.align();
            align = align.max(field_align);
            size = size.next_multiple_of(field_align) + field.size();
        }

        StructLayout {
            size: size.next_multiple_of(align).max(1),
            align,
            fields,
        }
    }

    /// Uses an explicit size, for types with custom layout.
    #[must_use]
    pub fn with_size(size: usize, align: usize, fields: Vec<TypeLayout>) -> Self {
        StructLayout {
            size,
            align,
            fields,
        }
    }
}

/// Classifies a value type for a given runtime and architecture.
///
/// Receives only types that were not already settled by [`Abi::classify`]'s
/// pre-classification.
pub type Classifier = Arc<dyn Fn(&TypeLayout, bool) -> TypeClassification + Send + Sync>;

/// A calling convention description. Immutable once built.
#[derive(Clone)]
pub struct Abi {
    argument_order: Vec<SpecialArgumentKind>,
    classifier: Classifier,
    returns_return_buffer: bool,
}

impl Abi {
    /// Creates an ABI description.
    pub fn new(
        argument_order: Vec<SpecialArgumentKind>,
        classifier: Classifier,
        returns_return_buffer: bool,
    ) -> Self {
        Abi {
            argument_order,
            classifier,
            returns_return_buffer,
        }
    }

    /// The System V AMD64 convention used by Linux and macOS on x86_64.
    #[must_use]
    pub fn system_v_amd64() -> Self {
        Abi::new(
            vec![
                SpecialArgumentKind::ReturnBuffer,
                SpecialArgumentKind::ThisPointer,
                SpecialArgumentKind::UserArguments,
            ],
            Arc::new(classify_system_v_amd64),
            true,
        )
    }

    /// Order of the special arguments and the user argument block.
    #[must_use]
    pub fn argument_order(&self) -> &[SpecialArgumentKind] {
        &self.argument_order
    }

    /// Whether callees return the return buffer pointer they were given.
    #[must_use]
    pub fn returns_return_buffer(&self) -> bool {
        self.returns_return_buffer
    }

    /// Classifies `ty` as an argument, or as the return type if `is_return`.
    ///
    /// `void`, references, pointers and by-reference parameters are always one machine word and
    /// go in a register; everything else is up to the convention's classifier.
    #[must_use]
    pub fn classify(&self, ty: &TypeLayout, is_return: bool) -> TypeClassification {
        match ty {
            TypeLayout::Void | TypeLayout::Reference | TypeLayout::Pointer | TypeLayout::ByRef => {
                TypeClassification::InRegister
            }
            _ => (self.classifier)(ty, is_return),
        }
    }
}

impl fmt::Debug for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Abi")
            .field("argument_order", &self.argument_order)
            .field("returns_return_buffer", &self.returns_return_buffer)
            .finish_non_exhaustive()
    }
}

/// System V AMD64 classification.
///
/// Values larger than 32 bytes, and values larger than 16 bytes with any field that is not a
/// float, are passed in memory.
#[must_use]
pub fn classify_system_v_amd64(ty: &TypeLayout, is_return: bool) -> TypeClassification {
    let in_memory = if is_return {
        TypeClassification::ByReference
    } else {
        TypeClassification::OnStack
    };

    let size = ty.size();
    if size > 32 {
        return in_memory;
    }
    if size > 16 && any_field_not_float(ty) {
        return in_memory;
    }
    TypeClassification::InRegister
}

fn any_field_not_float(ty: &TypeLayout) -> bool {
    match ty {
        TypeLayout::Struct(layout) => layout.fields.iter().any(|field| match field {
            // a nested value type is never treated as a float itself
            TypeLayout::Struct(_) => true,
            TypeLayout::Primitive(primitive) => !primitive.is_float(),
            _ => true,
        }),
        TypeLayout::Primitive(primitive) => !primitive.is_float(),
        _ => true,
    }
}
