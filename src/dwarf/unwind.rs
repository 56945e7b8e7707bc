//! Call-stack unwinding (spec §4.4).
//!
//! The teacher's unwinder walks `.eh_frame`/`.debug_frame` call-frame-information rows to step
//! each register across a frame boundary. Reproducing that CFI machinery is out of scope here
//! (spec §1 "concrete libunwind/ptrace syscalls... abstracted"): frames are walked by following
//! the conventional x86_64 frame-pointer chain (`rbp` -> saved `rbp` / return address), which is
//! the same "one frame back" step the teacher's `UnwindContext::next` performs, just driven by
//! the frame pointer instead of a CFI row. `call_frame_cfa` is still exposed to the `DwarfVM` the
//! same way (spec §4.3 `Op::CallFrameCfa`), computed as `rbp + 16` per the System V AMD64 ABI.

use crate::dwarf::eval::RegisterContext;
use crate::dwarf::{Frame, ObjectInfo};
use crate::error::{Error, Result};
use crate::remote::AddressSpace;

/// x86_64 DWARF register numbers used by the frame-pointer walk (System V ABI).
const DWARF_REG_RBP: u8 = 6;
const DWARF_REG_RSP: u8 = 7;
const DWARF_REG_RIP: u8 = 16;

pub const MAX_UNWIND_DEPTH: usize = 256;

/// One entry in a resolved backtrace (spec §4.4 Backtrace).
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub ip: u64,
    pub cfa: Option<u64>,
    pub function_name: Option<String>,
    pub registers: RegisterContext,
}

/// Walks the frame-pointer chain of a stopped actor to produce a backtrace, and exposes
/// [`RegisterContext`]s suitable for resolving variable locations at each frame (spec §4.4).
pub struct StackUnwinder<'a, T: AddressSpace> {
    address_space: &'a T,
}

impl<'a, T: AddressSpace> StackUnwinder<'a, T> {
    pub fn new(address_space: &'a T) -> Self {
        Self { address_space }
    }

    /// Unwinds starting from `initial`, which must have `rip`/`rsp`/`rbp` populated. `find_object`
    /// resolves the module an instruction pointer falls in, used only to find the enclosing
    /// function's name for the frame label.
    pub fn unwind(
        &self,
        initial: RegisterContext,
        find_object: impl Fn(u64) -> Option<&'a ObjectInfo>,
    ) -> Result<Vec<StackFrame>> {
        let mut frames = Vec::new();
        let mut ctx = initial;
        let mut ip = ctx.register(DWARF_REG_RIP).ok_or(Error::UnwindNoContext(0))?;
        let mut rbp = ctx.register(DWARF_REG_RBP);

        loop {
            if frames.len() >= MAX_UNWIND_DEPTH {
                return Err(Error::UnwindTooDeep);
            }

            let cfa = rbp.map(|bp| bp.wrapping_add(16));
            ctx.call_frame_cfa = cfa;
            let function_name = find_object(ip).and_then(|o| {
                o.find_function(ip)
                    .and_then(|f: &Frame| f.name.clone())
            });
            frames.push(StackFrame {
                ip,
                cfa,
                function_name,
                registers: ctx.clone(),
            });

            let Some(bp) = rbp else { break };
            if bp == 0 {
                break;
            }
            let saved_rbp = self.read_u64(bp)?;
            let return_addr = self.read_u64(bp.wrapping_add(8))?;
            if return_addr == 0 || return_addr == ip {
                break;
            }

            ip = return_addr;
            rbp = Some(saved_rbp);
            ctx = RegisterContext {
                registers: ctx.registers,
                frame_base: None,
                call_frame_cfa: None,
            }
            .with_register(DWARF_REG_RIP, ip)
            .with_register(DWARF_REG_RBP, saved_rbp)
            .with_register(DWARF_REG_RSP, bp.wrapping_add(16));
        }

        Ok(frames)
    }

    fn read_u64(&self, addr: u64) -> Result<u64> {
        let buf = self
            .address_space
            .read_array::<8>(addr)
            .map_err(|_| Error::RemoteRead { addr, len: 8 })?;
        Ok(u64::from_ne_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ReadOptions;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// A tiny fake address space backing a synthetic frame-pointer chain: each entry maps an
    /// address to the 8 bytes stored there.
    struct FakeStack(RefCell<HashMap<u64, [u8; 8]>>);

    impl AddressSpace for FakeStack {
        fn read_bytes<'a>(
            &self,
            dst: &'a mut [u8],
            len: usize,
            addr: u64,
            _opts: ReadOptions,
        ) -> Result<&'a [u8]> {
            let bytes = self
                .0
                .borrow()
                .get(&addr)
                .copied()
                .ok_or(Error::RemoteRead { addr, len })?;
            dst[..len].copy_from_slice(&bytes[..len]);
            Ok(&dst[..len])
        }
        fn write_bytes(&self, _addr: u64, _src: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn walks_a_two_frame_chain_to_the_sentinel_root() {
        // frame 0: rbp = 0x1000 -> [saved_rbp=0, return_addr=0x2000]
        let mut map = HashMap::new();
        map.insert(0x1000u64, 0u64.to_ne_bytes());
        map.insert(0x1008u64, 0x2000u64.to_ne_bytes());
        let space = FakeStack(RefCell::new(map));

        let ctx = RegisterContext::default()
            .with_register(DWARF_REG_RIP, 0x1234)
            .with_register(DWARF_REG_RBP, 0x1000)
            .with_register(DWARF_REG_RSP, 0x0ff0);

        let unwinder = StackUnwinder::new(&space);
        let frames = unwinder.unwind(ctx, |_| None).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].ip, 0x1234);
        assert_eq!(frames[0].cfa, Some(0x1010));
        assert_eq!(frames[1].ip, 0x2000);
    }

    #[test]
    fn stops_immediately_without_a_frame_pointer() {
        let space = FakeStack(RefCell::new(HashMap::new()));
        let ctx = RegisterContext::default().with_register(DWARF_REG_RIP, 0xdead);
        let unwinder = StackUnwinder::new(&space);
        let frames = unwinder.unwind(ctx, |_| None).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cfa, None);
    }
}
