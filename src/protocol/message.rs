//! Wire framing for the checker<->application socket (spec §6).
//!
//! Every message is a fixed-size struct led by a `u16` type tag; a short read or unrecognized tag
//! is always a fatal protocol error (spec §6, §7) — there is no speculative re-sync.

use std::io::{Read, Write};

use super::ProtocolError;

const TAG_HELLO: u16 = 0;
const TAG_ASSERTION_FAILURE: u16 = 1;
const TAG_WAITING_REQUESTS: u16 = 2;
const TAG_IGNORE_MEMORY: u16 = 3;
const TAG_IGNORE_HEAP: u16 = 4;
const TAG_UNIGNORE_HEAP: u16 = 5;
const TAG_STACK_REGION: u16 = 6;
const TAG_DECLARE_SYMBOL: u16 = 7;
const TAG_CONTINUE: u16 = 8;
const TAG_RESTORE: u16 = 9;
const TAG_DEADLOCK_CHECK: u16 = 10;

/// Longest variable-length payload we frame inline: an assertion-failure description. Longer
/// descriptions are truncated at encode time rather than growing the frame.
const ASSERTION_MSG_LEN: usize = 256;
const SYMBOL_NAME_LEN: usize = 32;

/// A single wire message, inbound (App->Checker) or outbound (Checker->App) (spec §6 table).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello,
    AssertionFailure(String),
    WaitingRequests,
    IgnoreMemory { addr: u64, size: u64 },
    IgnoreHeap { addr: u64, size: u64 },
    UnignoreHeap { addr: u64, size: u64 },
    StackRegion { addr: u64, size: u64, actor: u64, context: u64 },
    DeclareSymbol { name: [u8; SYMBOL_NAME_LEN], value_addr: u64 },
    Continue { actor: u64, times_considered: i32 },
    Restore { segment_index: i32 },
    DeadlockCheck,
}

impl Message {
    pub fn declared_symbol_name(&self) -> Option<String> {
        match self {
            Message::DeclareSymbol { name, .. } => {
                let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                Some(String::from_utf8_lossy(&name[..end]).into_owned())
            }
            _ => None,
        }
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        match self {
            Message::Hello => write_tag(w, TAG_HELLO),
            Message::AssertionFailure(text) => {
                write_tag(w, TAG_ASSERTION_FAILURE)?;
                let mut buf = [0u8; ASSERTION_MSG_LEN];
                let bytes = text.as_bytes();
                let n = bytes.len().min(ASSERTION_MSG_LEN);
                buf[..n].copy_from_slice(&bytes[..n]);
                w.write_all(&buf).map_err(ProtocolError::Io)
            }
            Message::WaitingRequests => write_tag(w, TAG_WAITING_REQUESTS),
            Message::IgnoreMemory { addr, size } => write_addr_size(w, TAG_IGNORE_MEMORY, *addr, *size),
            Message::IgnoreHeap { addr, size } => write_addr_size(w, TAG_IGNORE_HEAP, *addr, *size),
            Message::UnignoreHeap { addr, size } => write_addr_size(w, TAG_UNIGNORE_HEAP, *addr, *size),
            Message::StackRegion { addr, size, actor, context } => {
                write_tag(w, TAG_STACK_REGION)?;
                w.write_all(&addr.to_le_bytes()).map_err(ProtocolError::Io)?;
                w.write_all(&size.to_le_bytes()).map_err(ProtocolError::Io)?;
                w.write_all(&actor.to_le_bytes()).map_err(ProtocolError::Io)?;
                w.write_all(&context.to_le_bytes()).map_err(ProtocolError::Io)
            }
            Message::DeclareSymbol { name, value_addr } => {
                write_tag(w, TAG_DECLARE_SYMBOL)?;
                w.write_all(name).map_err(ProtocolError::Io)?;
                w.write_all(&value_addr.to_le_bytes()).map_err(ProtocolError::Io)
            }
            Message::Continue { actor, times_considered } => {
                write_tag(w, TAG_CONTINUE)?;
                w.write_all(&actor.to_le_bytes()).map_err(ProtocolError::Io)?;
                w.write_all(&times_considered.to_le_bytes()).map_err(ProtocolError::Io)
            }
            Message::Restore { segment_index } => {
                write_tag(w, TAG_RESTORE)?;
                w.write_all(&segment_index.to_le_bytes()).map_err(ProtocolError::Io)
            }
            Message::DeadlockCheck => write_tag(w, TAG_DEADLOCK_CHECK),
        }
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self, ProtocolError> {
        let mut tag_buf = [0u8; 2];
        read_exact(r, &mut tag_buf)?;
        let tag = u16::from_le_bytes(tag_buf);
        match tag {
            TAG_HELLO => Ok(Message::Hello),
            TAG_ASSERTION_FAILURE => {
                let mut buf = [0u8; ASSERTION_MSG_LEN];
                read_exact(r, &mut buf)?;
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                Ok(Message::AssertionFailure(String::from_utf8_lossy(&buf[..end]).into_owned()))
            }
            TAG_WAITING_REQUESTS => Ok(Message::WaitingRequests),
            TAG_IGNORE_MEMORY => read_addr_size(r).map(|(addr, size)| Message::IgnoreMemory { addr, size }),
            TAG_IGNORE_HEAP => read_addr_size(r).map(|(addr, size)| Message::IgnoreHeap { addr, size }),
            TAG_UNIGNORE_HEAP => read_addr_size(r).map(|(addr, size)| Message::UnignoreHeap { addr, size }),
            TAG_STACK_REGION => {
                let addr = read_u64(r)?;
                let size = read_u64(r)?;
                let actor = read_u64(r)?;
                let context = read_u64(r)?;
                Ok(Message::StackRegion { addr, size, actor, context })
            }
            TAG_DECLARE_SYMBOL => {
                let mut name = [0u8; SYMBOL_NAME_LEN];
                read_exact(r, &mut name)?;
                let value_addr = read_u64(r)?;
                Ok(Message::DeclareSymbol { name, value_addr })
            }
            TAG_CONTINUE => {
                let actor = read_u64(r)?;
                let mut tc_buf = [0u8; 4];
                read_exact(r, &mut tc_buf)?;
                Ok(Message::Continue { actor, times_considered: i32::from_le_bytes(tc_buf) })
            }
            TAG_RESTORE => {
                let mut buf = [0u8; 4];
                read_exact(r, &mut buf)?;
                Ok(Message::Restore { segment_index: i32::from_le_bytes(buf) })
            }
            TAG_DEADLOCK_CHECK => Ok(Message::DeadlockCheck),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

fn write_tag(w: &mut impl Write, tag: u16) -> Result<(), ProtocolError> {
    w.write_all(&tag.to_le_bytes()).map_err(ProtocolError::Io)
}

fn write_addr_size(w: &mut impl Write, tag: u16, addr: u64, size: u64) -> Result<(), ProtocolError> {
    write_tag(w, tag)?;
    w.write_all(&addr.to_le_bytes()).map_err(ProtocolError::Io)?;
    w.write_all(&size.to_le_bytes()).map_err(ProtocolError::Io)
}

fn read_addr_size(r: &mut impl Read) -> Result<(u64, u64), ProtocolError> {
    let addr = read_u64(r)?;
    let size = read_u64(r)?;
    Ok((addr, size))
}

fn read_u64(r: &mut impl Read) -> Result<u64, ProtocolError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), ProtocolError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => ProtocolError::ShortRead,
        _ => ProtocolError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(msg: Message) {
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        let decoded = Message::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn every_message_shape_round_trips() {
        round_trip(Message::Hello);
        round_trip(Message::WaitingRequests);
        round_trip(Message::DeadlockCheck);
        round_trip(Message::AssertionFailure("invariant broken".into()));
        round_trip(Message::IgnoreMemory { addr: 0x1000, size: 64 });
        round_trip(Message::StackRegion { addr: 1, size: 2, actor: 3, context: 4 });
        round_trip(Message::Continue { actor: 7, times_considered: -1 });
        round_trip(Message::Restore { segment_index: 2 });

        let mut name = [0u8; SYMBOL_NAME_LEN];
        name[..6].copy_from_slice(b"maxpid");
        round_trip(Message::DeclareSymbol { name, value_addr: 0xdead });
    }

    #[test]
    fn declared_symbol_name_stops_at_the_first_nul() {
        let mut name = [0u8; SYMBOL_NAME_LEN];
        name[..6].copy_from_slice(b"maxpid");
        let msg = Message::DeclareSymbol { name, value_addr: 0 };
        assert_eq!(msg.declared_symbol_name().as_deref(), Some("maxpid"));
    }

    #[test]
    fn short_read_is_a_protocol_error_not_a_panic() {
        let mut cursor = Cursor::new(vec![0u8; 1]);
        let err = Message::read_from(&mut cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::ShortRead));
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let mut cursor = Cursor::new(0xffffu16.to_le_bytes().to_vec());
        let err = Message::read_from(&mut cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(0xffff)));
    }
}
