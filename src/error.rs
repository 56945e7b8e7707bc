//! Crate-wide error type and the mapping from failures/outcomes to process exit codes.

use std::string::FromUtf8Error;

use crate::dwarf::eval::EvalError;
use crate::protocol::ProtocolError;

/// Exit codes documented in the wire-protocol / CLI surface of the checker.
#[derive(Debug, Copy, Clone, Eq, PartialEq, strum_macros::Display)]
#[repr(i32)]
pub enum ExitCode {
    NoViolation = 0,
    SafetyViolation = 1,
    LivenessViolation = 2,
    Deadlock = 3,
    NonTermination = 4,
    NonDeterminism = 5,
    ApplicationCrash = 6,
    InternalError = 63,
}

impl From<ExitCode> for i32 {
    fn from(value: ExitCode) -> Self {
        value as i32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors -----------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),

    // --------------------------------- not-found errors ----------------------------------------
    #[error("variable not found: {0}")]
    VariableNotFound(String),
    #[error("function not found at ip {0:#x}")]
    FunctionNotFound(u64),
    #[error("object info not found for address {0:#x}")]
    ObjectInfoNotFound(u64),
    #[error("type not found: {0}")]
    TypeNotFound(String),
    #[error("die not found: {0:?}")]
    DieNotFound(usize),
    #[error("no debug information found for `{0}` (recompile with -g)")]
    NoDebugInformation(String),
    #[error("page store index {0} is not occupied")]
    PageNotFound(u32),

    // --------------------------------- size / binary repr --------------------------------------
    #[error("size mismatch reading `{name}`: expected {expected}, found {found}")]
    SizeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("string at {0:#x} was not NUL-terminated before reaching end of mapped memory")]
    StringUnterminated(u64),

    // --------------------------------- syscall / remote-memory errors ---------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("failed to read {len} bytes at {addr:#x} from application memory")]
    RemoteRead { addr: u64, len: usize },
    #[error("failed to write {len} bytes at {addr:#x} into application memory")]
    RemoteWrite { addr: u64, len: usize },

    // --------------------------------- parsing errors --------------------------------------------
    #[error("dwarf parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
    #[error("invalid build-id note")]
    BuildIdFormat,

    // --------------------------------- dwarf evaluation -------------------------------------------
    #[error(transparent)]
    DwarfEval(#[from] EvalError),
    #[error("location list has no entry covering ip {0:#x}")]
    UnresolvableLocation(u64),

    // --------------------------------- unwind --------------------------------------------------
    #[error("unwind: no unwind context for ip {0:#x}")]
    UnwindNoContext(u64),
    #[error("unwind: frame stack exceeded sanity limit")]
    UnwindTooDeep,

    // --------------------------------- protocol / session ---------------------------------------
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("application exited unexpectedly (status {0})")]
    UnexpectedExit(i32),

    // --------------------------------- checker ----------------------------------------------------
    #[error("property violation")]
    PropertyViolation(ExitCode),
    #[error("mutex simcalls are not supported under DPOR")]
    MutexUnsupportedUnderDpor,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Maps a fatal error to the process exit code documented for it. Every variant here is
    /// "fatal" in the sense of spec §7: the checker never swallows these, it aborts with the
    /// mapped code.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::PropertyViolation(code) => *code,
            Error::UnexpectedExit(_) => ExitCode::ApplicationCrash,
            _ => ExitCode::InternalError,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Transforms a `Result` into an `Option`, logging the error at `warn` level and continuing.
/// Used for per-request or per-frame failures that should not abort the whole exploration
/// (e.g. a single stack frame whose locals can't be resolved).
#[macro_export]
macro_rules! weak_error {
    ($res:expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("{:#}", e);
                None
            }
        }
    };
}
