//! Protocol constants, opcodes and identifier types.

use core::fmt;

use bitflags::bitflags;
use strum::{FromRepr, IntoStaticStr};

/// Version string answered by servers speaking the base protocol.
pub const VERSION9P: &str = "9P2000";

/// Version string answered when the client's version is not understood.
pub const VERSION_UNKNOWN: &str = "unknown";

/// Special values used by the protocol.
pub const NOTAG: u16 = 0xFFFF;
pub const NOFID: u32 = 0xFFFF_FFFF;

/// Maximum number of path elements in a single walk.
pub const MAXWELEM: usize = 16;

/// Room reserved for the read/write header inside a negotiated msize.
///
/// size[4] type[1] tag[2] fid[4] offset[8] count[4], rounded up.
pub const IOHDRSZ: u32 = 24;

/// size[4] type[1] tag[2]
pub const HEADER_SIZE: usize = 7;

/// type[1] version[4] path[8]
pub const QID_SIZE: usize = 13;

pub const DEFAULT_MSIZE: u32 = 16384;

pub const OREAD: u8 = 0;
pub const OWRITE: u8 = 1;
pub const ORDWR: u8 = 2;
pub const OEXEC: u8 = 3;
pub const OTRUNC: u8 = 0x10;
pub const OCEXEC: u8 = 0x20;
pub const ORCLOSE: u8 = 0x40;

/// Opcode of every message kind.
///
/// Requests and responses are paired, the response being the request's
/// opcode plus one. `Rerror` has no request form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub enum MsgType {
    Tversion = 100,
    Rversion = 101,
    Tauth = 102,
    Rauth = 103,
    Tattach = 104,
    Rattach = 105,
    Rerror = 106,
    Tflush = 107,
    Rflush = 108,
    Twalk = 109,
    Rwalk = 110,
    Topen = 111,
    Ropen = 112,
    Tcreate = 113,
    Rcreate = 114,
    Tread = 115,
    Rread = 116,
    Twrite = 117,
    Rwrite = 118,
    Tclunk = 119,
    Rclunk = 120,
    Tremove = 121,
    Rremove = 122,
    Tstat = 123,
    Rstat = 124,
    Twstat = 125,
    Rwstat = 126,
}

impl MsgType {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn is_request(self) -> bool {
        self.name().starts_with('T')
    }

    /// The successful response kind for a request, `None` for responses.
    pub fn response_type(self) -> Option<MsgType> {
        if self.is_request() {
            MsgType::from_repr(self as u8 + 1)
        } else {
            None
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Bits in `Qid::type_`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct QidType: u8 {
        const DIR = 0x80;
        const APPEND = 0x40;
        const EXCL = 0x20;
        const MOUNT = 0x10;
        const AUTH = 0x08;
        const TMP = 0x04;
        const SYMLINK = 0x02;
        const FILE = 0x00;
    }
}

bitflags! {
    /// Permission and mode bits carried by `Tcreate` and stat records.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Perm: u32 {
        const DIR = 0x8000_0000;
        const APPEND = 0x4000_0000;
        const EXCL = 0x2000_0000;
        const MOUNT = 0x1000_0000;
        const AUTH = 0x0800_0000;
        const TMP = 0x0400_0000;
        const SYMLINK = 0x0200_0000;
        const DEVICE = 0x0080_0000;
        const NAMEDPIPE = 0x0020_0000;
        const SOCKET = 0x0010_0000;
        const SETUID = 0x0008_0000;
        const SETGID = 0x0004_0000;
        const READ = 0x4;
        const WRITE = 0x2;
        const EXEC = 0x1;

        // unix permission bits pass through unchanged
        const _ = !0;
    }
}

impl Perm {
    /// The qid type bits implied by these permissions.
    pub fn qid_type(self) -> QidType {
        QidType::from_bits_retain((self.bits() >> 24) as u8)
    }
}

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (Perm::DIR, 'd'),
            (Perm::APPEND, 'a'),
            (Perm::AUTH, 'A'),
            (Perm::EXCL, 'l'),
            (Perm::TMP, 't'),
        ];
        for (bit, ch) in flags {
            if self.contains(bit) {
                write!(f, "{}", ch)?;
            }
        }
        write!(f, "{:o}", self.bits() & 0o777)
    }
}

/// Qid identifies a file within a 9P server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Qid {
    pub type_: QidType,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub const fn new(path: u64, version: u32, type_: QidType) -> Self {
        Self {
            type_,
            version,
            path,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.type_.contains(QidType::DIR)
    }

    /// Same file and same content generation.
    pub fn same_content(&self, other: &Qid) -> bool {
        self.path == other.path && self.version == other.version
    }
}

impl fmt::Display for Qid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} ", self.path, self.version)?;
        for (bit, ch) in [
            (QidType::DIR, 'd'),
            (QidType::APPEND, 'a'),
            (QidType::EXCL, 'l'),
            (QidType::AUTH, 'A'),
        ] {
            if self.type_.contains(bit) {
                write!(f, "{}", ch)?;
            }
        }
        f.write_str(")")
    }
}
