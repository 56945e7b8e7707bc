//! Frames and variables (spec §3 Frame/Variable/LocationList).

use crate::dwarf::eval::DwarfExpression;
use crate::dwarf::type_::TypeId;

/// Index into an [`crate::dwarf::ObjectInfo`]'s frame arena.
pub type FrameId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Function,
    LexicalBlock,
    InlinedSubroutine,
}

/// `(instruction-address range, DwarfExpression)`. Resolution picks the first entry whose range
/// contains the current IP, or the "always valid" sentinel (`range: None`).
#[derive(Debug, Clone)]
pub struct LocationListEntry {
    pub range: Option<(u64, u64)>,
    pub expr: DwarfExpression,
}

#[derive(Debug, Clone, Default)]
pub struct LocationList {
    pub entries: Vec<LocationListEntry>,
}

impl LocationList {
    pub fn single(expr: DwarfExpression) -> Self {
        Self {
            entries: vec![LocationListEntry { range: None, expr }],
        }
    }

    /// Picks the first entry whose range contains `pc`, or the always-valid sentinel.
    pub fn resolve_for_pc(&self, pc: u64) -> Option<&DwarfExpression> {
        self.entries
            .iter()
            .find(|e| match e.range {
                Some((lo, hi)) => pc >= lo && pc < hi,
                None => true,
            })
            .map(|e| &e.expr)
    }
}

/// Either a fixed address (globals) or a location list (locals).
#[derive(Debug, Clone)]
pub enum VarAddress {
    Fixed(u64),
    List(LocationList),
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub type_id: Option<TypeId>,
    pub address: VarAddress,
    /// Offset (relative to the enclosing frame's `low_pc`) below which the variable is not yet in
    /// scope; `None` means valid for the whole frame.
    pub start_scope: Option<u64>,
}

impl Variable {
    pub fn fixed_address(&self) -> Option<u64> {
        match &self.address {
            VarAddress::Fixed(a) => Some(*a),
            VarAddress::List(_) => None,
        }
    }

    /// True if the variable is in scope at `ip`, given the enclosing frame started at `frame_low_pc`.
    pub fn in_scope_at(&self, ip: u64, frame_low_pc: u64) -> bool {
        match self.start_scope {
            Some(off) => ip >= frame_low_pc + off,
            None => true,
        }
    }
}

/// A function or nested lexical scope (spec §3 Frame).
#[derive(Debug, Clone)]
pub struct Frame {
    pub tag: FrameTag,
    pub name: Option<String>,
    pub low_pc: u64,
    pub high_pc: u64,
    pub frame_base: Option<LocationList>,
    /// Sorted by name for binary-search lookup (spec §4.3 "Variable / Frame post-pass").
    pub locals: Vec<Variable>,
    pub children: Vec<FrameId>,
    pub abstract_origin: Option<FrameId>,
}

impl Frame {
    pub fn contains_ip(&self, ip: u64) -> bool {
        ip >= self.low_pc && ip < self.high_pc
    }

    pub fn find_local(&self, name: &str) -> Option<&Variable> {
        self.locals
            .binary_search_by(|v| v.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.locals[i])
    }
}
