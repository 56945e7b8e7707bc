//! Debug information: types, frames, variables, location expressions (spec §4.3).
//!
//! DWARF/ELF byte-format parsing itself is out of scope (spec §1): this module is the "opaque
//! debug-info loader" the rest of the checker consumes, built on top of `gimli`/`object` exactly
//! the way the teacher's `debugee::dwarf` module is, but yielding the flat, index-based
//! [`ObjectInfo`] arenas described in spec §3 instead of borrowed `gimli` DIE cursors.

pub mod eval;
pub mod frame;
mod loader;
pub mod type_;
pub mod unwind;

use std::path::{Path, PathBuf};

pub use frame::{Frame, FrameId, FrameTag, LocationList, LocationListEntry, VarAddress, Variable};
pub use type_::{Member, MemberLocation, Type, TypeId, TypeKind, TypeRef};

use crate::error::Result;

/// Per-ELF-module debug information (spec §3 ObjectInfo).
#[derive(Debug)]
pub struct ObjectInfo {
    pub path: PathBuf,
    /// `true` for the main executable (offsets are absolute); `false` for a shared object (offsets
    /// are relative to `base_addr`).
    pub executable: bool,
    pub base_addr: u64,
    pub text_start: u64,
    pub text_end: u64,
    pub ro_start: u64,
    pub ro_end: u64,
    pub rw_start: u64,
    pub rw_end: u64,

    pub(crate) types: Vec<Type>,
    pub(crate) frames: Vec<Frame>,
    /// Functions only (not nested scopes), sorted by `low_pc` for `find_function`'s binary search.
    top_level_functions: Vec<FrameId>,
    /// Sorted by name for `find_global`'s binary search.
    pub globals: Vec<Variable>,
    type_name_index: std::collections::HashMap<String, Vec<TypeId>>,
}

impl ObjectInfo {
    pub fn contains_text(&self, addr: u64) -> bool {
        addr >= self.text_start && addr < self.text_end
    }

    pub fn contains_rw(&self, addr: u64) -> bool {
        addr >= self.rw_start && addr < self.rw_end
    }

    pub fn contains_any_segment(&self, addr: u64) -> bool {
        self.contains_text(addr)
            || self.contains_rw(addr)
            || (addr >= self.ro_start && addr < self.ro_end)
    }

    pub fn rw_range(&self) -> (u64, u64) {
        (self.rw_start, self.rw_end)
    }

    pub fn type_by_id(&self, id: TypeId) -> Option<&Type> {
        self.types.get(id)
    }

    pub fn frame_by_id(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id)
    }

    /// Binary-searches the function index by `low_pc`, then confirms `addr` falls below the
    /// candidate's `high_pc` (spec §4.1 `find_function`).
    pub fn find_function(&self, addr: u64) -> Option<&Frame> {
        let idx = self
            .top_level_functions
            .partition_point(|&id| self.frames[id].low_pc <= addr);
        if idx == 0 {
            return None;
        }
        let candidate = &self.frames[self.top_level_functions[idx - 1]];
        candidate.contains_ip(addr).then_some(candidate)
    }

    pub fn find_global(&self, name: &str) -> Option<&Variable> {
        self.globals
            .binary_search_by(|v| v.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.globals[i])
    }

    /// Resolves a type, walking through typedef/const/volatile wrappers to the canonical
    /// subtype, and following the cross-unit `full_type` link if the result is still nameless
    /// (spec §4.3 "Types completeness post-pass").
    pub fn canonical_type<'a>(&'a self, mut id: TypeId) -> Option<&'a Type> {
        let mut guard = 0;
        loop {
            let ty = self.types.get(id)?;
            if !ty.is_wrapper() {
                return Some(ty);
            }
            match ty.wrapped() {
                Some(next) => id = next,
                None => return Some(ty),
            }
            guard += 1;
            if guard > self.types.len() + 1 {
                // cyclic typedef chain in malformed debug info; bail rather than loop forever
                return self.types.get(id);
            }
        }
    }

    pub fn find_type_by_name(&self, name: &str) -> Option<TypeId> {
        self.type_name_index.get(name).and_then(|v| v.first().copied())
    }

    pub fn for_each_frame(&self, mut f: impl FnMut(&Frame)) {
        fn walk(object: &ObjectInfo, id: FrameId, f: &mut impl FnMut(&Frame)) {
            let frame = &object.frames[id];
            f(frame);
            for &child in &frame.children {
                walk(object, child, f);
            }
        }
        for &id in &self.top_level_functions {
            walk(self, id, &mut f);
        }
    }
}

/// Loads debug information for a single ELF module, mapped at `load_addr`. Returns `Ok(None)` if
/// the mapping is not an ELF object `statecheck` knows how to introspect (e.g. the vdso).
pub fn load_object_info(path: &Path, load_addr: u64) -> Result<Option<ObjectInfo>> {
    loader::load(path, load_addr)
}

/// Links cross-unit "full type" completeness: for every opaque (zero-size, memberless) named
/// type in every `ObjectInfo`, search all loaded objects for a fully-defined type of the same
/// name and record the link (spec §4.3 "Types completeness post-pass"). Must run before the
/// `ObjectInfo`s are published behind `Rc` (the pass mutates them in place).
pub fn link_full_types(objects: &mut [ObjectInfo]) {
    let mut fully_defined: std::collections::HashMap<String, TypeRef> = std::collections::HashMap::new();
    for (object_index, obj) in objects.iter().enumerate() {
        for (type_id, ty) in obj.types.iter().enumerate() {
            let Some(name) = &ty.name else { continue };
            if ty.byte_size > 0 || !ty.members().is_empty() {
                fully_defined
                    .entry(name.clone())
                    .or_insert(TypeRef { object_index, type_id });
            }
        }
    }

    for (object_index, obj) in objects.iter_mut().enumerate() {
        for type_id in 0..obj.types.len() {
            let is_opaque = {
                let ty = &obj.types[type_id];
                ty.byte_size == 0 && ty.members().is_empty() && ty.name.is_some()
            };
            if !is_opaque {
                continue;
            }
            let name = obj.types[type_id].name.clone().unwrap();
            if let Some(&full) = fully_defined.get(&name) {
                if !(full.object_index == object_index && full.type_id == type_id) {
                    obj.types[type_id].full_type = Some(full);
                }
            }
        }
    }
}
