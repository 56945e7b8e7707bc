//! `/proc/<pid>/maps` parsing and the deny-list of system libraries whose memory is excluded
//! from introspection (glossary: "deny-listed library").
//!
//! Grounded on the teacher's `debugee::ldd` module, which shells out to resolve shared-object
//! dependencies by basename; here we instead classify mappings already enumerated by `proc-maps`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use once_cell::sync::Lazy;

/// One contiguous mapping from `/proc/<pid>/maps`, filtered down to the fields `RemoteProcess`
/// needs to build an [`crate::dwarf::ObjectInfo`].
#[derive(Debug, Clone)]
pub struct MapRegion {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub path: Option<PathBuf>,
}

/// Basenames (version/extension stripped) of libraries whose state is considered external to the
/// checked application: runtime, allocators, math, crypto, the unwinder, and compression.
/// Supplemented from `examples/original_source/src/mc/Process.cpp`'s object-loading path (spec.md
/// §4.1 names the categories generically; this is the concrete list).
pub const DENY_LISTED_BASENAMES: &[&str] = &[
    "ld-linux",
    "libc",
    "libm",
    "libpthread",
    "libdl",
    "librt",
    "libgcc_s",
    "libstdc++",
    "libunwind",
    "libcrypto",
    "libssl",
    "libz",
    "liblzma",
    "linux-vdso",
];

/// `DENY_LISTED_BASENAMES` as a set, built once per process (grounded on the teacher's own use of
/// `once_cell::sync::Lazy` for process-wide constant tables, e.g. `debugger::variable::render`).
static DENY_LISTED: Lazy<HashSet<&'static str>> = Lazy::new(|| DENY_LISTED_BASENAMES.iter().copied().collect());

/// Strips a shared-object's version and extension suffix, e.g. `libc.so.6` -> `libc`,
/// `libc-2.31.so` -> `libc`.
fn basename_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let before_so = name.split(".so").next().unwrap_or(&name);
    before_so
        .split('-')
        .next()
        .unwrap_or(before_so)
        .to_string()
}

/// True if `path` names a deny-listed system library.
pub fn is_deny_listed(path: &Path) -> bool {
    let stem = basename_stem(path);
    DENY_LISTED.contains(stem.as_str())
}

/// Reads and filters the memory map of `pid`, dropping deny-listed libraries and anonymous
/// mappings that carry no backing file (stack, vdso without a path, heap is handled separately by
/// the allocator-descriptor lookup).
pub fn load_object_mappings(pid: Pid) -> crate::error::Result<Vec<MapRegion>> {
    let maps = proc_maps::get_process_maps(pid.as_raw())
        .map_err(|e| crate::error::Error::Io(std::io::Error::other(e.to_string())))?;

    Ok(maps
        .into_iter()
        .filter_map(|m| {
            let path = m.filename().map(|p| p.to_path_buf());
            if let Some(path) = &path {
                if is_deny_listed(path) {
                    return None;
                }
            } else {
                return None;
            }
            Some(MapRegion {
                start: m.start() as u64,
                end: (m.start() + m.size()) as u64,
                readable: m.is_read(),
                writable: m.is_write(),
                executable: m.is_exec(),
                path,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_shared_object_suffixes() {
        assert_eq!(basename_stem(Path::new("/lib/x86_64-linux-gnu/libc.so.6")), "libc");
        assert_eq!(basename_stem(Path::new("/usr/lib/libm-2.31.so")), "libm");
        assert_eq!(basename_stem(Path::new("/home/me/myapp")), "myapp");
    }

    #[test]
    fn classifies_deny_listed_libraries() {
        assert!(is_deny_listed(Path::new("/lib/x86_64-linux-gnu/libc.so.6")));
        assert!(is_deny_listed(Path::new("/lib/x86_64-linux-gnu/libstdc++.so.6")));
        assert!(is_deny_listed(Path::new("linux-vdso.so.1")));
        assert!(!is_deny_listed(Path::new("/home/me/myapp")));
        assert!(!is_deny_listed(Path::new(
            "/home/me/.local/lib/libsimgrid.so"
        )));
    }
}
