//! The checker<->application wire protocol and process lifecycle (spec §5, §6).
//!
//! A [`Session`] owns both halves: the forked `Child` (adapted from the debugger's
//! `process::Child<State>` typestate) and the `UnixStream` the request/response lockstep runs
//! over.

pub mod message;

use std::marker::PhantomData;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::Options;
use nix::sys::signal::SIGSTOP;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, ForkResult, Pid};

pub use message::Message;

use crate::error::{Error, Result};
use crate::remote::{RemoteProcess, WellKnownSymbols};

/// Protocol-layer failures: everything that isn't a `RemoteProcess`/dwarf error but still aborts
/// the run (spec §7 "a protocol error is always fatal").
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unknown wire message tag {0}")]
    UnknownTag(u16),
    #[error("short read while framing a message")]
    ShortRead,
    #[error("expected {expected}, got {got:?}")]
    UnexpectedMessage { expected: &'static str, got: Message },
    #[error("application reported assertion failure: {0}")]
    AssertionFailure(String),
}

/// Process lifecycle state, mirroring the debugger's `Template`/`Installed` split: a `Template`
/// is configured but not yet running, an `Installed` one is forked, stopped, and ptrace-seized.
pub trait State {}

pub struct Template;
impl State for Template {}

pub struct Installed;
impl State for Installed {}

/// The application process under test, forked from a `Template` and seized once `Installed`.
pub struct Child<S: State> {
    program: String,
    args: Vec<String>,
    sock: Option<UnixStream>,
    pid: Option<Pid>,
    _p: PhantomData<S>,
}

impl Child<Template> {
    /// Configures (without starting) the application, passing it `sock` as fd 3 via the
    /// `STATECHECK_FD` environment variable (spec §5 "the application connects back over a
    /// UNIX socket inherited at fork").
    pub fn new(program: impl Into<String>, args: Vec<String>, sock: UnixStream) -> Self {
        Self {
            program: program.into(),
            args,
            sock: Some(sock),
            pid: None,
            _p: PhantomData,
        }
    }
}

impl Child<Installed> {
    pub fn pid(&self) -> Pid {
        self.pid.unwrap()
    }
}

impl Child<Template> {
    /// Forks, execs the application with ASLR disabled (so addresses reported over the socket
    /// stay comparable across runs), and seizes it with ptrace while it is still stopped at
    /// `SIGSTOP` (spec §5 step 1).
    pub fn install(mut self) -> Result<Child<Installed>> {
        let sock = self.sock.take().expect("Child<Template> installed twice");
        let sock_fd = sock.as_raw_fd();

        // `UnixStream::pair()` fds are close-on-exec, so the application would never see
        // `sock_fd` across `exec()`. `dup2` it onto a fixed fd (3) in `pre_exec`: `dup2`'s
        // target never inherits `FD_CLOEXEC`, so fd 3 survives into the application.
        const APP_SOCK_FD: i32 = 3;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).env("STATECHECK_FD", APP_SOCK_FD.to_string());
        unsafe {
            cmd.pre_exec(move || {
                sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                nix::unistd::dup2(sock_fd, APP_SOCK_FD).map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        match unsafe { fork().map_err(Error::Waitpid)? } {
            ForkResult::Parent { child: pid } => {
                drop(sock);
                waitpid(pid, Some(WaitPidFlag::WSTOPPED)).map_err(Error::Waitpid)?;
                sys::ptrace::seize(
                    pid,
                    Options::PTRACE_O_TRACECLONE
                        .union(Options::PTRACE_O_TRACEEXEC)
                        .union(Options::PTRACE_O_TRACEEXIT),
                )
                .map_err(Error::Ptrace)?;
                Ok(Child {
                    program: self.program,
                    args: self.args,
                    sock: None,
                    pid: Some(pid),
                    _p: PhantomData,
                })
            }
            ForkResult::Child => {
                sys::signal::raise(SIGSTOP).expect("raise(SIGSTOP) failed in child");
                let err = cmd.exec();
                panic!("exec of application failed: {err}");
            }
        }
    }
}

/// Owns the forked application, the ptrace-backed [`RemoteProcess`], and the control socket;
/// drives the request/response lockstep of spec §5.
pub struct Session {
    child: Child<Installed>,
    stream: UnixStream,
    remote: RemoteProcess,
}

impl Session {
    /// Forks `program`, waits for its `Hello`, attaches `RemoteProcess`, and resolves the
    /// well-known symbols the application declares before the first `WaitingRequests` (spec §5
    /// step 2, §6).
    pub fn launch(program: &str, args: Vec<String>) -> Result<Self> {
        let (parent_sock, child_sock) = UnixStream::pair().map_err(ProtocolError::Io)?;
        let template = Child::new(program, args, child_sock);
        let child = template.install()?;

        let mut stream = parent_sock;
        match Message::read_from(&mut stream)? {
            Message::Hello => {}
            other => {
                return Err(ProtocolError::UnexpectedMessage { expected: "Hello", got: other }.into());
            }
        }

        let remote = RemoteProcess::attach(child.pid())?;
        let mut session = Session { child, stream, remote };
        session.declare_symbols()?;
        session.remote.refresh_actor_table()?;
        Ok(session)
    }

    pub fn remote(&self) -> &RemoteProcess {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut RemoteProcess {
        &mut self.remote
    }

    pub fn pid(&self) -> Pid {
        self.child.pid()
    }

    /// Drains `DeclareSymbol`/`IgnoreMemory`/`IgnoreHeap` messages the application sends before
    /// its first `WaitingRequests`, resolving each symbol name into the address `RemoteProcess`
    /// already knows for it (spec §6: the application declares symbols by name, the checker
    /// looks the address up from debug info rather than trusting a raw address on the wire).
    fn declare_symbols(&mut self) -> Result<()> {
        let mut symbols = WellKnownSymbols::default();
        loop {
            match Message::read_from(&mut self.stream)? {
                msg @ Message::DeclareSymbol { .. } => {
                    let name = msg.declared_symbol_name().unwrap_or_default();
                    let Some((var, _object)) = self.remote.find_global_variable(&name) else {
                        continue;
                    };
                    let Some(addr) = var.fixed_address() else { continue };
                    match name.as_str() {
                        "max_pid" | "__statecheck_max_pid" => symbols.max_pid_addr = Some(addr),
                        "live_actors" | "__statecheck_live_actors" => symbols.live_actors_addr = Some(addr),
                        "dead_actors" | "__statecheck_dead_actors" => symbols.dead_actors_addr = Some(addr),
                        "__statecheck_heap_breakval" => symbols.heap_descriptor_addr = Some(addr),
                        "property_automaton" | "__statecheck_property_automaton" => {
                            symbols.property_automaton_addr = Some(addr)
                        }
                        _ => {}
                    }
                }
                Message::IgnoreMemory { addr, size } => self.remote.ignore_region(addr, size),
                Message::IgnoreHeap { addr, size } => self.remote.ignore_heap(addr, size),
                Message::UnignoreHeap { addr, size } => self.remote.unignore_region(addr, size),
                Message::WaitingRequests => break,
                other => return Err(ProtocolError::UnexpectedMessage { expected: "DeclareSymbol or WaitingRequests", got: other }.into()),
            }
        }
        self.remote.set_well_known_symbols(symbols);
        Ok(())
    }

    /// Resumes `actor` at the given `times_considered` and blocks until the application reports
    /// its next `WaitingRequests` (or an `AssertionFailure`), processing any ignore-mechanism
    /// traffic in between (spec §5 step 3).
    pub fn continue_actor(&mut self, actor: u64, times_considered: i32) -> Result<()> {
        Message::Continue { actor, times_considered }.write_to(&mut self.stream).map_err(Error::Protocol)?;
        self.wait_stable()
    }

    /// Blocks until the application reaches a stable point (`WaitingRequests`), surfacing any
    /// `AssertionFailure` as an error and applying `Ignore*` traffic along the way.
    pub fn wait_stable(&mut self) -> Result<()> {
        loop {
            match Message::read_from(&mut self.stream)? {
                Message::WaitingRequests => {
                    self.remote.refresh_actor_table()?;
                    return Ok(());
                }
                Message::AssertionFailure(text) => return Err(ProtocolError::AssertionFailure(text).into()),
                Message::IgnoreMemory { addr, size } => self.remote.ignore_region(addr, size),
                Message::IgnoreHeap { addr, size } => self.remote.ignore_heap(addr, size),
                Message::UnignoreHeap { addr, size } => self.remote.unignore_region(addr, size),
                other => return Err(ProtocolError::UnexpectedMessage { expected: "WaitingRequests", got: other }.into()),
            }
        }
    }

    /// Asks the application whether every enabled actor is actually blocked (spec §4.9 "deadlock
    /// detection defers to the application, which knows about timers/timeouts the checker
    /// cannot see"). The reply is a single byte: 0 or 1.
    pub fn deadlock_check(&mut self) -> Result<bool> {
        Message::DeadlockCheck.write_to(&mut self.stream).map_err(Error::Protocol)?;
        let mut reply = [0u8; 1];
        std::io::Read::read_exact(&mut self.stream, &mut reply).map_err(ProtocolError::Io)?;
        Ok(reply[0] != 0)
    }

    /// Tells the application to restore its own in-process state to a previously taken
    /// checkpoint index, used by the replay backtracking path (spec §4.11).
    pub fn restore_segment(&mut self, segment_index: i32) -> Result<()> {
        Message::Restore { segment_index }.write_to(&mut self.stream).map_err(Error::Protocol)?;
        self.wait_stable()
    }
}
