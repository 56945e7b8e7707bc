//! Type representation (spec §3 Type/Member).
//!
//! Types and frames form cycles (types refer to types, members refer to types, frames contain
//! variables that refer to types). Per design notes §9 ("cyclic graphs -> arena+index") each
//! [`crate::dwarf::ObjectInfo`] owns a flat arena of [`Type`]s; cross-references are plain
//! [`TypeId`] indices into that arena, resolved by lookup rather than by pointer.

use crate::dwarf::eval::DwarfExpression;

/// Index into an [`crate::dwarf::ObjectInfo`]'s type arena.
pub type TypeId = usize;

/// A reference to a type owned by a *different* `ObjectInfo`, used only for the "full type"
/// cross-unit completeness link (spec §4.3 "Types completeness post-pass").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeRef {
    pub object_index: usize,
    pub type_id: TypeId,
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Base {
        encoding: Option<u8>,
    },
    Pointer(Option<TypeId>),
    Reference(Option<TypeId>),
    Array {
        element: Option<TypeId>,
        count: Option<u64>,
    },
    Struct(Vec<Member>),
    Class(Vec<Member>),
    Union(Vec<Member>),
    Typedef(Option<TypeId>),
    Const(Option<TypeId>),
    Volatile(Option<TypeId>),
    Subroutine,
    /// Unrecognized DWARF tag; kept so offset-based references still resolve to *something*.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Type {
    pub name: Option<String>,
    pub byte_size: usize,
    pub kind: TypeKind,
    /// Filled in by the cross-unit completeness post-pass when this type is otherwise nameless
    /// (an opaque forward declaration) but a fully-defined type of the same name exists in
    /// another `ObjectInfo`.
    pub full_type: Option<TypeRef>,
}

impl Type {
    pub fn is_wrapper(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Typedef(_) | TypeKind::Const(_) | TypeKind::Volatile(_)
        )
    }

    pub fn wrapped(&self) -> Option<TypeId> {
        match self.kind {
            TypeKind::Typedef(t) | TypeKind::Const(t) | TypeKind::Volatile(t) => t,
            _ => None,
        }
    }

    pub fn members(&self) -> &[Member] {
        match &self.kind {
            TypeKind::Struct(m) | TypeKind::Class(m) | TypeKind::Union(m) => m,
            _ => &[],
        }
    }
}

/// A struct/union/class member: a name, a byte size, a type reference and a location expression
/// (spec §3 Member). The common `DW_OP_plus_uconst k` form is pre-resolved into a fixed integer
/// offset at load time (spec §4.3 "Member offset resolution").
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub byte_size: usize,
    pub type_id: Option<TypeId>,
    pub location: MemberLocation,
}

#[derive(Debug, Clone)]
pub enum MemberLocation {
    FixedOffset(u64),
    Expression(DwarfExpression),
}
