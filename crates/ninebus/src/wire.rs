//! Raw 9P2000 frame inspection and in-place edits.
//!
//! The multiplexer never re-encodes payloads it forwards: it reads a
//! whole frame (`size[4] type[1] tag[2] ...`), rewrites at most the
//! tag and one or two fid fields in place, and passes everything else
//! through byte-for-byte. That discipline is what preserves blocking
//! reads, streaming output and clunk semantics across the proxy.
//!
//! Frames handled here always include the leading 4-byte size field,
//! unlike [`crate::serialize`] which works on size-stripped bodies.

use std::io::{self, Cursor};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use num_traits::FromPrimitive;

use crate::fcall::*;
use crate::serialize::{self, Encodable};

/// Bytes in `size[4] type[1] tag[2]`
pub const HDRSZ: usize = 7;

/// Read the message size from the first 4 bytes, or `None` if not
/// enough data has arrived yet.
pub fn frame_size(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    Some(LittleEndian::read_u32(&buf[0..4]))
}

/// Message type byte at offset 4.
pub fn msg_type(frame: &[u8]) -> u8 {
    frame[4]
}

/// Tag at offset 5.
pub fn tag(frame: &[u8]) -> u16 {
    LittleEndian::read_u16(&frame[5..7])
}

/// Rewrite the tag in place.
pub fn set_tag(frame: &mut [u8], tag: u16) {
    LittleEndian::write_u16(&mut frame[5..7], tag);
}

/// Human-readable message type name for diagnostics.
pub fn msg_name(mtype: u8) -> String {
    match MsgType::from_u8(mtype) {
        Some(t) => format!("{:?}", t),
        None => format!("Unknown({})", mtype),
    }
}

fn carries_fid(mtype: u8) -> bool {
    matches!(
        MsgType::from_u8(mtype),
        Some(
            MsgType::TAuth
                | MsgType::TAttach
                | MsgType::TWalk
                | MsgType::TOpen
                | MsgType::TCreate
                | MsgType::TRead
                | MsgType::TWrite
                | MsgType::TClunk
                | MsgType::TRemove
                | MsgType::TStat
                | MsgType::TWStat
        )
    )
}

/// Extract the primary fid of a T-message: a uint32 at offset 7.
pub fn fid(frame: &[u8]) -> Option<u32> {
    if carries_fid(msg_type(frame)) && frame.len() >= 11 {
        return Some(LittleEndian::read_u32(&frame[7..11]));
    }
    None
}

/// Rewrite the primary fid in place.
pub fn set_fid(frame: &mut [u8], fid: u32) {
    LittleEndian::write_u32(&mut frame[7..11], fid);
}

/// Extract the secondary fid: `newfid` of Twalk or `afid` of Tattach,
/// both a uint32 at offset 11.
pub fn newfid(frame: &[u8]) -> Option<u32> {
    match MsgType::from_u8(msg_type(frame)) {
        Some(MsgType::TWalk | MsgType::TAttach) if frame.len() >= 15 => {
            Some(LittleEndian::read_u32(&frame[11..15]))
        }
        _ => None,
    }
}

/// Rewrite the secondary fid in place.
pub fn set_newfid(frame: &mut [u8], fid: u32) {
    LittleEndian::write_u32(&mut frame[11..15], fid);
}

/// The oldtag of a Tflush: a uint16 at offset 7.
pub fn flush_oldtag(frame: &[u8]) -> u16 {
    LittleEndian::read_u16(&frame[7..9])
}

/// Rewrite the oldtag of a Tflush in place.
pub fn set_flush_oldtag(frame: &mut [u8], oldtag: u16) {
    LittleEndian::write_u16(&mut frame[7..9], oldtag);
}

/// Encode a message into a complete size-prefixed frame.
pub fn frame(msg: &Msg) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; 4];
    serialize::write_msg(&mut buf, msg)?;
    let size = buf.len() as u32;
    LittleEndian::write_u32(&mut buf[0..4], size);
    Ok(buf)
}

/// Decode a complete frame back into a message.
pub fn parse_msg(frame: &[u8]) -> io::Result<Msg> {
    if frame.len() < HDRSZ {
        return Err(io_err!(UnexpectedEof, "short 9P frame"));
    }
    serialize::read_msg(&mut Cursor::new(&frame[4..]))
}

/*
 * Constructors for the responses the core synthesizes itself.
 */

pub fn rversion(tag: u16, msize: u32, version: &str) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::RVersion {
            msize,
            version: version.to_owned(),
        },
    })
}

pub fn rerror(tag: u16, ename: &str) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::RError {
            ename: ename.to_owned(),
        },
    })
}

pub fn rattach(tag: u16, qid: Qid) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::RAttach { qid },
    })
}

pub fn rwalk(tag: u16, wqids: Vec<Qid>) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::RWalk { wqids },
    })
}

pub fn ropen(tag: u16, qid: Qid, iounit: u32) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::ROpen { qid, iounit },
    })
}

pub fn rread(tag: u16, data: Vec<u8>) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::RRead { data: Data(data) },
    })
}

pub fn rwrite(tag: u16, count: u32) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::RWrite { count },
    })
}

pub fn rstat(tag: u16, stat: Stat) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::RStat { stat },
    })
}

pub fn rwstat(tag: u16) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::RWStat,
    })
}

pub fn rclunk(tag: u16) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::RClunk,
    })
}

pub fn rflush(tag: u16) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::RFlush,
    })
}

/*
 * Constructors for the requests the mux originates.
 */

pub fn tversion(msize: u32) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag: NOTAG,
        body: FCall::TVersion {
            msize,
            version: P92000.to_owned(),
        },
    })
}

pub fn tattach(tag: u16, fid: u32, uname: &str, aname: &str) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::TAttach {
            fid,
            afid: NOFID,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        },
    })
}

pub fn twalk(tag: u16, fid: u32, newfid: u32, wnames: &[String]) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::TWalk {
            fid,
            newfid,
            wnames: wnames.to_vec(),
        },
    })
}

pub fn topen(tag: u16, fid: u32, mode: u8) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::TOpen { fid, mode },
    })
}

pub fn twrite(tag: u16, fid: u32, offset: u64, data: &[u8]) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::TWrite {
            fid,
            offset,
            data: Data(data.to_vec()),
        },
    })
}

pub fn tclunk(tag: u16, fid: u32) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::TClunk { fid },
    })
}

pub fn tflush(tag: u16, oldtag: u16) -> io::Result<Vec<u8>> {
    frame(&Msg {
        tag,
        body: FCall::TFlush { oldtag },
    })
}

/*
 * Parsers for the responses the mux consumes itself.
 */

/// Parse a Twalk frame into `(fid, newfid, names)`.
pub fn parse_twalk(frame: &[u8]) -> io::Result<(u32, u32, Vec<String>)> {
    match parse_msg(frame)?.body {
        FCall::TWalk {
            fid,
            newfid,
            wnames,
        } => Ok((fid, newfid, wnames)),
        _ => Err(io_err!(InvalidData, "not a Twalk frame")),
    }
}

/// Parse an Rwalk frame into the walked qids.
pub fn parse_rwalk(frame: &[u8]) -> io::Result<Vec<Qid>> {
    match parse_msg(frame)?.body {
        FCall::RWalk { wqids } => Ok(wqids),
        _ => Err(io_err!(InvalidData, "not an Rwalk frame")),
    }
}

/// Parse an Rversion frame into `(msize, version)`.
pub fn parse_rversion(frame: &[u8]) -> io::Result<(u32, String)> {
    match parse_msg(frame)?.body {
        FCall::RVersion { msize, version } => Ok((msize, version)),
        _ => Err(io_err!(InvalidData, "not an Rversion frame")),
    }
}

/// The ename of an Rerror frame, or `None` for any other type.
pub fn parse_rerror(frame: &[u8]) -> Option<String> {
    match parse_msg(frame).ok()?.body {
        FCall::RError { ename } => Some(ename),
        _ => None,
    }
}

/// Wall-clock seconds for synthesized stat times.
pub fn now_sec() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Pack a synthetic stat entry for virtual directories and files.
///
/// The returned bytes carry the stat's leading size field, which is
/// the form directory `Rread` payloads concatenate.
pub fn pack_stat(name: &str, qid: Qid, mode: u32, length: u64, owner: &str) -> io::Result<Vec<u8>> {
    let now = now_sec();
    let stat = Stat {
        typ: 0,
        dev: 0,
        qid,
        mode,
        atime: now,
        mtime: now,
        length,
        name: name.to_owned(),
        uid: owner.to_owned(),
        gid: owner.to_owned(),
        muid: String::new(),
    };

    let mut buf = Vec::with_capacity(stat.size() as usize + 2);
    stat.encode(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        let frame = twalk(0x0102, 7, 8, &["a".to_owned()]).unwrap();
        assert_eq!(frame_size(&frame), Some(frame.len() as u32));
        assert_eq!(msg_type(&frame), MsgType::TWalk as u8);
        assert_eq!(tag(&frame), 0x0102);
        assert_eq!(fid(&frame), Some(7));
        assert_eq!(newfid(&frame), Some(8));
    }

    #[test]
    fn rewrite_in_place_preserves_payload() {
        let mut frame = twrite(3, 9, 0, b"hello").unwrap();
        let before = frame.clone();

        set_tag(&mut frame, 99);
        set_fid(&mut frame, 1234);

        assert_eq!(tag(&frame), 99);
        assert_eq!(fid(&frame), Some(1234));
        // Only tag and fid bytes may differ
        assert_eq!(&frame[..5], &before[..5]);
        assert_eq!(&frame[11..], &before[11..]);
    }

    #[test]
    fn twalk_roundtrip() {
        let names = vec!["llm".to_owned(), "ctl".to_owned()];
        let frame = twalk(1, 2, 3, &names).unwrap();
        assert_eq!(parse_twalk(&frame).unwrap(), (2, 3, names));
    }

    #[test]
    fn rerror_parse() {
        let frame = rerror(5, "File not found: x").unwrap();
        assert_eq!(parse_rerror(&frame).as_deref(), Some("File not found: x"));
        assert_eq!(parse_rerror(&rflush(5).unwrap()), None);
    }

    #[test]
    fn flush_oldtag_roundtrip() {
        let mut frame = tflush(1, 42).unwrap();
        assert_eq!(flush_oldtag(&frame), 42);
        set_flush_oldtag(&mut frame, 7);
        assert_eq!(flush_oldtag(&frame), 7);
    }

    #[test]
    fn pack_stat_has_size_prefix() {
        let qid = Qid {
            typ: QidType::DIR,
            version: 0,
            path: 1,
        };
        let bytes = pack_stat("rio", qid, dm::DIR | 0o777, 0, "mux").unwrap();
        let prefix = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(prefix as usize + 2, bytes.len());
    }
}
