//! The concrete `gimli`/`object` backed debug-info loader.
//!
//! Grounded on the teacher's `debugee::dwarf::loader` (section loading) and `unit::parser`/`die`
//! (DIE walking), adapted to produce the owned, index-based [`super::ObjectInfo`] arenas instead
//! of borrowed `gimli` cursors, and to look up separate debug info by build-id when an object
//! carries none itself (spec §4.3 "Separate debug info").

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use fallible_iterator::FallibleIterator;
use gimli::{
    AttributeValue, Section, DW_AT_byte_size, DW_AT_count, DW_AT_data_member_location,
    DW_AT_encoding, DW_AT_frame_base, DW_AT_high_pc, DW_AT_location, DW_AT_low_pc, DW_AT_name,
    DW_AT_type, DW_AT_upper_bound, DW_TAG_array_type, DW_TAG_base_type, DW_TAG_class_type,
    DW_TAG_const_type, DW_TAG_formal_parameter, DW_TAG_inlined_subroutine, DW_TAG_lexical_block,
    DW_TAG_member, DW_TAG_pointer_type, DW_TAG_reference_type, DW_TAG_structure_type,
    DW_TAG_subprogram,
    DW_TAG_subrange_type, DW_TAG_subroutine_type, DW_TAG_typedef, DW_TAG_union_type,
    DW_TAG_variable, DW_TAG_volatile_type, Reader, RunTimeEndian, SectionId,
};
use object::{Object, ObjectSection};

use crate::dwarf::eval::{DwarfExpression, Op};
use crate::dwarf::frame::{Frame, FrameTag, LocationList, LocationListEntry, VarAddress, Variable};
use crate::dwarf::type_::{Member, MemberLocation, Type, TypeKind};
use crate::dwarf::ObjectInfo;
use crate::error::{Error, Result};

type R = gimli::EndianRcSlice<RunTimeEndian>;

fn load_section(object: &object::File, id: SectionId, endian: RunTimeEndian) -> R {
    let data = object
        .section_by_name(id.name())
        .and_then(|s| s.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[][..]));
    gimli::EndianRcSlice::new(Rc::from(&*data), endian)
}

fn load_dwarf(object: &object::File) -> gimli::Dwarf<R> {
    let endian = if object.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };
    gimli::Dwarf::load(|id| -> std::result::Result<R, gimli::Error> {
        Ok(load_section(object, id, endian))
    })
    .unwrap_or_else(|_: gimli::Error| empty_dwarf(endian))
}

/// An empty `Dwarf<R>`, used as the `gimli::Dwarf::load` fallback (that closure never actually
/// errors, but `R` has no `Default` impl so the fallback must be built explicitly).
fn empty_dwarf(endian: RunTimeEndian) -> gimli::Dwarf<R> {
    gimli::Dwarf::load(|_id| -> std::result::Result<R, gimli::Error> {
        Ok(gimli::EndianRcSlice::new(Rc::from(&[][..]), endian))
    })
    .unwrap()
}

/// Reads the `NT_GNU_BUILD_ID` note and derives the split-debug path
/// `/usr/lib/debug/.build-id/XX/YYYY.debug` (spec §4.3 "Separate debug info").
fn build_id_debug_path(object: &object::File) -> Option<PathBuf> {
    let build_id = object.build_id().ok().flatten()?;
    if build_id.len() < 2 {
        return None;
    }
    let (first, rest) = build_id.split_at(1);
    let hex = |b: &[u8]| b.iter().map(|b| format!("{b:02x}")).collect::<String>();
    Some(PathBuf::from(format!(
        "/usr/lib/debug/.build-id/{}/{}.debug",
        hex(first),
        hex(rest)
    )))
}

pub fn load(path: &Path, load_addr: u64) -> Result<Option<ObjectInfo>> {
    let data = fs::read(path)?;
    let object = match object::File::parse(&*data) {
        Ok(o) => o,
        Err(_) => return Ok(None),
    };

    let mut dwarf = load_dwarf(&object);
    if dwarf.debug_info.reader().is_empty() {
        if let Some(debug_path) = build_id_debug_path(&object) {
            if let Ok(debug_data) = fs::read(&debug_path) {
                if let Ok(debug_object) = object::File::parse(&*debug_data) {
                    dwarf = load_dwarf(&debug_object);
                }
            }
        }
    }
    if dwarf.debug_info.reader().is_empty() {
        return Err(Error::NoDebugInformation(path.display().to_string()));
    }

    let executable = object.kind() == object::ObjectKind::Executable;
    let base_addr = if executable { 0 } else { load_addr };

    let mut segments = Segments::default();
    for section in object.sections() {
        let flags = section.flags();
        let (addr, size) = (section.address(), section.size());
        if size == 0 {
            continue;
        }
        if let object::SectionFlags::Elf { sh_flags } = flags {
            const SHF_ALLOC: u64 = 1 << 1;
            const SHF_WRITE: u64 = 1 << 0;
            const SHF_EXECINSTR: u64 = 1 << 2;
            if sh_flags & SHF_ALLOC == 0 {
                continue;
            }
            if sh_flags & SHF_EXECINSTR != 0 {
                segments.extend_text(addr, addr + size);
            } else if sh_flags & SHF_WRITE != 0 {
                segments.extend_rw(addr, addr + size);
            } else {
                segments.extend_ro(addr, addr + size);
            }
        }
    }

    let mut builder = ObjectBuilder::new(base_addr);

    // `dwarf.units()` is a `FallibleIterator`, not a `std::iter::Iterator`: a malformed
    // `.debug_info` surfaces as `Err` here rather than simply ending iteration early.
    let mut units = dwarf.units();
    while let Some(header) = units.next().map_err(Error::DwarfParsing)? {
        let unit = dwarf.unit(header).map_err(Error::DwarfParsing)?;
        builder.load_unit(&dwarf, &unit)?;
    }

    builder.finish_post_pass();

    Ok(Some(ObjectInfo {
        path: path.to_path_buf(),
        executable,
        base_addr,
        text_start: base_addr + segments.text.0,
        text_end: base_addr + segments.text.1,
        ro_start: base_addr + segments.ro.0,
        ro_end: base_addr + segments.ro.1,
        rw_start: base_addr + segments.rw.0,
        rw_end: base_addr + segments.rw.1,
        types: builder.types,
        frames: builder.frames,
        top_level_functions: builder.top_level_functions,
        globals: builder.globals,
        type_name_index: builder.type_name_index,
    }))
}

#[derive(Default)]
struct Segments {
    text: (u64, u64),
    ro: (u64, u64),
    rw: (u64, u64),
}

impl Segments {
    fn extend_text(&mut self, lo: u64, hi: u64) {
        self.text = union_range(self.text, lo, hi);
    }
    fn extend_ro(&mut self, lo: u64, hi: u64) {
        self.ro = union_range(self.ro, lo, hi);
    }
    fn extend_rw(&mut self, lo: u64, hi: u64) {
        self.rw = union_range(self.rw, lo, hi);
    }
}

fn union_range(existing: (u64, u64), lo: u64, hi: u64) -> (u64, u64) {
    if existing == (0, 0) {
        (lo, hi)
    } else {
        (existing.0.min(lo), existing.1.max(hi))
    }
}

/// Accumulates the flat arenas while walking every compile unit's DIE tree.
struct ObjectBuilder {
    base_addr: u64,
    types: Vec<Type>,
    frames: Vec<Frame>,
    top_level_functions: Vec<usize>,
    globals: Vec<Variable>,
    type_name_index: HashMap<String, Vec<usize>>,
    /// Maps a unit-qualified DIE offset to an already-built type index, so member/subtype
    /// references resolve even when the referenced DIE appears later in the tree.
    type_offsets: HashMap<(usize, usize), usize>,
}

impl ObjectBuilder {
    fn new(base_addr: u64) -> Self {
        Self {
            base_addr,
            types: Vec::new(),
            frames: Vec::new(),
            top_level_functions: Vec::new(),
            globals: Vec::new(),
            type_name_index: HashMap::new(),
            type_offsets: HashMap::new(),
        }
    }

    fn load_unit(&mut self, dwarf: &gimli::Dwarf<R>, unit: &gimli::Unit<R>) -> Result<()> {
        let unit_id = unit.header.offset().as_debug_info_offset().map(|o| o.0).unwrap_or(0);

        // Pass 1: register every type DIE's arena slot up front so forward references resolve.
        let mut cursor = unit.entries();
        while let Ok(Some((_, entry))) = cursor.next_dfs() {
            if is_type_tag(entry.tag()) {
                let idx = self.types.len();
                self.types.push(Type {
                    name: None,
                    byte_size: 0,
                    kind: TypeKind::Unknown,
                    full_type: None,
                });
                self.type_offsets
                    .insert((unit_id, entry.offset().0), idx);
            }
        }

        // Pass 2: fill in type bodies and walk functions/variables.
        let mut tree = unit.entries_tree(None).map_err(Error::DwarfParsing)?;
        let root = tree.root().map_err(Error::DwarfParsing)?;
        self.walk_children(dwarf, unit, unit_id, root, None, None)?;

        self.globals.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }

    fn walk_children(
        &mut self,
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        unit_id: usize,
        node: gimli::EntriesTreeNode<R>,
        enclosing_function: Option<usize>,
        enclosing_frame_low_pc: Option<u64>,
    ) -> Result<()> {
        let mut children = node.children();
        while let Some(child) = children.next().map_err(Error::DwarfParsing)? {
            let entry = child.entry();
            let tag = entry.tag();

            if is_type_tag(tag) {
                self.load_type(dwarf, unit, unit_id, entry)?;
                // Types may have children (struct members handled inside load_type, subrange for
                // arrays handled inside load_type); skip generic recursion for these.
                continue;
            }

            match tag {
                DW_TAG_subprogram | DW_TAG_inlined_subroutine | DW_TAG_lexical_block => {
                    let frame_tag = match tag {
                        DW_TAG_subprogram => FrameTag::Function,
                        DW_TAG_inlined_subroutine => FrameTag::InlinedSubroutine,
                        _ => FrameTag::LexicalBlock,
                    };
                    let frame_id = self.load_frame(dwarf, unit, unit_id, entry, frame_tag)?;
                    if let Some(parent) = enclosing_function {
                        self.frames[parent].children.push(frame_id);
                    } else if frame_tag == FrameTag::Function {
                        self.top_level_functions.push(frame_id);
                    }
                    let low_pc = self.frames[frame_id].low_pc;
                    self.walk_children(dwarf, unit, unit_id, child, Some(frame_id), Some(low_pc))?;
                    if let Some(parent) = enclosing_function {
                        self.frames[parent]
                            .locals
                            .sort_by(|a, b| a.name.cmp(&b.name));
                        let _ = parent;
                    }
                    self.frames[frame_id].locals.sort_by(|a, b| a.name.cmp(&b.name));
                }
                DW_TAG_variable | DW_TAG_formal_parameter => {
                    if let Some(var) =
                        self.load_variable(dwarf, unit, unit_id, entry, enclosing_frame_low_pc)?
                    {
                        match enclosing_function {
                            Some(frame_id) => self.frames[frame_id].locals.push(var),
                            None => self.globals.push(var),
                        }
                    }
                    self.walk_children(
                        dwarf,
                        unit,
                        unit_id,
                        child,
                        enclosing_function,
                        enclosing_frame_low_pc,
                    )?;
                }
                _ => {
                    self.walk_children(
                        dwarf,
                        unit,
                        unit_id,
                        child,
                        enclosing_function,
                        enclosing_frame_low_pc,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn load_frame(
        &mut self,
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        unit_id: usize,
        entry: &gimli::DebuggingInformationEntry<R>,
        tag: FrameTag,
    ) -> Result<usize> {
        let name = die_name(dwarf, unit, entry);
        let low_pc = attr_addr(entry, DW_AT_low_pc).unwrap_or(0);
        let high_pc = match entry.attr_value(DW_AT_high_pc).ok().flatten() {
            Some(AttributeValue::Addr(a)) => a,
            Some(AttributeValue::Udata(off)) => low_pc + off,
            _ => low_pc,
        };
        let frame_base = entry
            .attr_value(DW_AT_frame_base)
            .ok()
            .flatten()
            .and_then(|v| attr_to_expression(&v).map(LocationList::single));

        let _ = unit_id;
        self.frames.push(Frame {
            tag,
            name,
            low_pc: self.base_addr + low_pc,
            high_pc: self.base_addr + high_pc,
            frame_base,
            locals: Vec::new(),
            children: Vec::new(),
            abstract_origin: None,
        });
        Ok(self.frames.len() - 1)
    }

    fn load_variable(
        &mut self,
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        unit_id: usize,
        entry: &gimli::DebuggingInformationEntry<R>,
        frame_low_pc: Option<u64>,
    ) -> Result<Option<Variable>> {
        let Some(name) = die_name(dwarf, unit, entry) else {
            return Ok(None);
        };
        let type_id = entry
            .attr_value(DW_AT_type)
            .ok()
            .flatten()
            .and_then(|v| self.resolve_type_ref(unit_id, v));

        let location = entry.attr_value(DW_AT_location).ok().flatten();
        let address = match location {
            Some(AttributeValue::Exprloc(expr)) => {
                let parsed = parse_expression(expr.0.clone());
                if frame_low_pc.is_none() {
                    // Top-level variable with a location expression: if it's a bare constant
                    // address (`DW_OP_addr`), treat it as the fixed global address.
                    if let [Op::Addr(a)] = parsed.ops.as_slice() {
                        VarAddress::Fixed(self.base_addr + a)
                    } else {
                        VarAddress::List(LocationList::single(parsed))
                    }
                } else {
                    VarAddress::List(LocationList::single(parsed))
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(Variable {
            name,
            type_id,
            address,
            start_scope: None,
        }))
    }

    fn load_type(
        &mut self,
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        unit_id: usize,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<()> {
        let idx = *self
            .type_offsets
            .get(&(unit_id, entry.offset().0))
            .expect("type DIE registered in pass 1");

        let name = die_name(dwarf, unit, entry);
        let byte_size = entry
            .attr_value(DW_AT_byte_size)
            .ok()
            .flatten()
            .and_then(|v| v.udata_value())
            .unwrap_or(0) as usize;
        let subtype = entry
            .attr_value(DW_AT_type)
            .ok()
            .flatten()
            .and_then(|v| self.resolve_type_ref(unit_id, v));

        let kind = match entry.tag() {
            DW_TAG_base_type => TypeKind::Base {
                encoding: entry
                    .attr_value(DW_AT_encoding)
                    .ok()
                    .flatten()
                    .and_then(|v| v.udata_value())
                    .map(|v| v as u8),
            },
            DW_TAG_pointer_type => TypeKind::Pointer(subtype),
            DW_TAG_reference_type => TypeKind::Reference(subtype),
            DW_TAG_typedef => TypeKind::Typedef(subtype),
            DW_TAG_const_type => TypeKind::Const(subtype),
            DW_TAG_volatile_type => TypeKind::Volatile(subtype),
            DW_TAG_subroutine_type => TypeKind::Subroutine,
            DW_TAG_array_type => {
                let count = self.array_element_count(dwarf, unit, entry)?;
                TypeKind::Array {
                    element: subtype,
                    count,
                }
            }
            DW_TAG_structure_type => {
                TypeKind::Struct(self.load_members(dwarf, unit, unit_id, entry)?)
            }
            DW_TAG_class_type => TypeKind::Class(self.load_members(dwarf, unit, unit_id, entry)?),
            DW_TAG_union_type => TypeKind::Union(self.load_members(dwarf, unit, unit_id, entry)?),
            _ => TypeKind::Unknown,
        };

        if let Some(name) = &name {
            self.type_name_index
                .entry(name.clone())
                .or_default()
                .push(idx);
        }

        self.types[idx] = Type {
            name,
            byte_size,
            kind,
            full_type: None,
        };
        Ok(())
    }

    fn array_element_count(
        &self,
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Option<u64>> {
        let mut tree = unit
            .entries_tree(Some(entry.offset()))
            .map_err(Error::DwarfParsing)?;
        let root = tree.root().map_err(Error::DwarfParsing)?;
        let mut children = root.children();
        while let Some(child) = children.next().map_err(Error::DwarfParsing)? {
            let sub = child.entry();
            if sub.tag() == DW_TAG_subrange_type {
                if let Some(count) = sub
                    .attr_value(DW_AT_count)
                    .ok()
                    .flatten()
                    .and_then(|v| v.udata_value())
                {
                    return Ok(Some(count));
                }
                if let Some(upper) = sub
                    .attr_value(DW_AT_upper_bound)
                    .ok()
                    .flatten()
                    .and_then(|v| v.sdata_value())
                {
                    return Ok(Some(upper as u64 + 1));
                }
            }
        }
        let _ = dwarf;
        Ok(None)
    }

    fn load_members(
        &mut self,
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        unit_id: usize,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Vec<Member>> {
        let mut members = Vec::new();
        let mut tree = unit
            .entries_tree(Some(entry.offset()))
            .map_err(Error::DwarfParsing)?;
        let root = tree.root().map_err(Error::DwarfParsing)?;
        let mut children = root.children();
        while let Some(child) = children.next().map_err(Error::DwarfParsing)? {
            let sub = child.entry();
            if sub.tag() != DW_TAG_member {
                continue;
            }
            let Some(name) = die_name(dwarf, unit, sub) else {
                continue;
            };
            let byte_size = sub
                .attr_value(DW_AT_byte_size)
                .ok()
                .flatten()
                .and_then(|v| v.udata_value())
                .unwrap_or(0) as usize;
            let type_id = sub
                .attr_value(DW_AT_type)
                .ok()
                .flatten()
                .and_then(|v| self.resolve_type_ref(unit_id, v));
            let location = match sub.attr_value(DW_AT_data_member_location).ok().flatten() {
                Some(AttributeValue::Udata(k)) => MemberLocation::FixedOffset(k),
                Some(AttributeValue::Exprloc(expr)) => {
                    let parsed = parse_expression(expr.0.clone());
                    // `DW_OP_plus_uconst k` is the common simple-offset form (spec §4.3).
                    if let [Op::PlusUconst(k)] = parsed.ops.as_slice() {
                        MemberLocation::FixedOffset(*k)
                    } else {
                        MemberLocation::Expression(parsed)
                    }
                }
                _ => MemberLocation::FixedOffset(0),
            };
            members.push(Member {
                name,
                byte_size,
                type_id,
                location,
            });
        }
        Ok(members)
    }

    fn resolve_type_ref(&self, unit_id: usize, value: AttributeValue<R>) -> Option<usize> {
        match value {
            AttributeValue::UnitRef(offset) => {
                self.type_offsets.get(&(unit_id, offset.0)).copied()
            }
            _ => None,
        }
    }

    fn finish_post_pass(&mut self) {
        self.top_level_functions
            .sort_by_key(|&id| self.frames[id].low_pc);
    }
}

fn is_type_tag(tag: gimli::DwTag) -> bool {
    matches!(
        tag,
        DW_TAG_base_type
            | DW_TAG_pointer_type
            | DW_TAG_reference_type
            | DW_TAG_array_type
            | DW_TAG_structure_type
            | DW_TAG_class_type
            | DW_TAG_union_type
            | DW_TAG_typedef
            | DW_TAG_const_type
            | DW_TAG_volatile_type
            | DW_TAG_subroutine_type
    )
}

fn die_name(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    entry: &gimli::DebuggingInformationEntry<R>,
) -> Option<String> {
    let attr = entry.attr_value(DW_AT_name).ok().flatten()?;
    let s = dwarf.attr_string(unit, attr).ok()?;
    s.to_string_lossy().ok().map(|s| s.into_owned())
}

fn attr_addr(entry: &gimli::DebuggingInformationEntry<R>, at: gimli::DwAt) -> Option<u64> {
    match entry.attr_value(at).ok().flatten()? {
        AttributeValue::Addr(a) => Some(a),
        AttributeValue::Udata(u) => Some(u),
        _ => None,
    }
}

fn attr_to_expression(value: &AttributeValue<R>) -> Option<DwarfExpression> {
    match value {
        AttributeValue::Exprloc(expr) => Some(parse_expression(expr.0.clone())),
        _ => None,
    }
}

/// Decodes a raw DWARF expression byte-code into our own [`Op`] program (spec §4.3 DwarfVM).
/// Unknown/unsupported opcodes are dropped rather than erroring at load time; they surface as
/// `EvalError::UnsupportedOp` only if actually evaluated.
fn parse_expression(mut bytes: R) -> DwarfExpression {
    let mut ops = Vec::new();
    while !bytes.is_empty() {
        let Ok(opcode) = bytes.read_u8() else { break };
        let op = match opcode {
            0x03 => bytes.read_u64().ok().map(Op::Addr), // DW_OP_addr
            0x08 => bytes.read_u8().ok().map(|v| Op::ConstU(v as u64)), // const1u
            0x09 => bytes.read_i8().ok().map(|v| Op::ConstS(v as i64)), // const1s
            0x0a => bytes.read_u16().ok().map(|v| Op::ConstU(v as u64)), // const2u
            0x0b => bytes.read_i16().ok().map(|v| Op::ConstS(v as i64)), // const2s
            0x0c => bytes.read_u32().ok().map(|v| Op::ConstU(v as u64)), // const4u
            0x0d => bytes.read_i32().ok().map(|v| Op::ConstS(v as i64)), // const4s
            0x0e => bytes.read_u64().ok().map(Op::ConstU), // const8u
            0x0f => bytes.read_i64().ok().map(Op::ConstS), // const8s
            0x10 => bytes.read_uleb128().ok().map(Op::ConstU), // constu
            0x11 => bytes.read_sleb128().ok().map(Op::ConstS), // consts
            0x12 => Some(Op::Dup),
            0x13 => Some(Op::Drop),
            0x16 => Some(Op::Swap),
            0x14 => Some(Op::Over),
            0x22 => Some(Op::Plus),
            0x23 => bytes.read_uleb128().ok().map(Op::PlusUconst),
            0x1c => Some(Op::Minus),
            0x1e => Some(Op::Mul),
            0x1f => Some(Op::Neg),
            0x20 => Some(Op::Not),
            0x1a => Some(Op::And),
            0x21 => Some(Op::Or),
            0x27 => Some(Op::Xor),
            0x96 => Some(Op::Nop),
            0x9c => Some(Op::CallFrameCfa),
            0x91 => bytes.read_sleb128().ok().map(Op::Fbreg),
            0x06 => Some(Op::Deref),
            0x30..=0x4f => Some(Op::Lit((opcode - 0x30) as u64)), // lit0..lit31
            0x50..=0x6f => Some(Op::Breg((opcode - 0x50) as u8, 0)), // reg0..reg31 (bare register)
            0x70..=0x8f => bytes
                .read_sleb128()
                .ok()
                .map(|off| Op::Breg((opcode - 0x70) as u8, off)), // breg0..breg31
            _ => None,
        };
        match op {
            Some(op) => ops.push(op),
            None => break,
        }
    }
    DwarfExpression::new(ops)
}
