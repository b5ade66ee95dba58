//! The message catalog: one variant per request and response kind.

use core::fmt;

use crate::error::EncodeError;
use crate::message::dump_some;
use crate::protocol::{MAXWELEM, MsgType, NOFID, NOTAG, Perm, Qid};
use crate::stat::Dir;

/// Payload of a single protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Msg {
    Tversion {
        msize: u32,
        version: String,
    },
    Rversion {
        msize: u32,
        version: String,
    },
    Tauth {
        afid: u32,
        uname: String,
        aname: String,
    },
    Rauth {
        aqid: Qid,
    },
    Tattach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    Rattach {
        qid: Qid,
    },
    Rerror {
        ename: String,
    },
    Tflush {
        oldtag: u16,
    },
    Rflush,
    Twalk {
        fid: u32,
        newfid: u32,
        wname: Vec<String>,
    },
    /// A shorter `wqid` than the request's `wname` is a partial walk.
    Rwalk {
        wqid: Vec<Qid>,
    },
    Topen {
        fid: u32,
        mode: u8,
    },
    Ropen {
        qid: Qid,
        iounit: u32,
    },
    Tcreate {
        fid: u32,
        name: String,
        perm: Perm,
        mode: u8,
    },
    Rcreate {
        qid: Qid,
        iounit: u32,
    },
    Tread {
        fid: u32,
        offset: u64,
        count: u32,
    },
    Rread {
        data: Vec<u8>,
    },
    Twrite {
        fid: u32,
        offset: u64,
        data: Vec<u8>,
    },
    Rwrite {
        count: u32,
    },
    Tclunk {
        fid: u32,
    },
    Rclunk,
    Tremove {
        fid: u32,
    },
    Rremove,
    Tstat {
        fid: u32,
    },
    /// Encoded stat record, see [`Dir`].
    Rstat {
        stat: Vec<u8>,
    },
    Twstat {
        fid: u32,
        stat: Vec<u8>,
    },
    Rwstat,
}

impl Msg {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Msg::Tversion { .. } => MsgType::Tversion,
            Msg::Rversion { .. } => MsgType::Rversion,
            Msg::Tauth { .. } => MsgType::Tauth,
            Msg::Rauth { .. } => MsgType::Rauth,
            Msg::Tattach { .. } => MsgType::Tattach,
            Msg::Rattach { .. } => MsgType::Rattach,
            Msg::Rerror { .. } => MsgType::Rerror,
            Msg::Tflush { .. } => MsgType::Tflush,
            Msg::Rflush => MsgType::Rflush,
            Msg::Twalk { .. } => MsgType::Twalk,
            Msg::Rwalk { .. } => MsgType::Rwalk,
            Msg::Topen { .. } => MsgType::Topen,
            Msg::Ropen { .. } => MsgType::Ropen,
            Msg::Tcreate { .. } => MsgType::Tcreate,
            Msg::Rcreate { .. } => MsgType::Rcreate,
            Msg::Tread { .. } => MsgType::Tread,
            Msg::Rread { .. } => MsgType::Rread,
            Msg::Twrite { .. } => MsgType::Twrite,
            Msg::Rwrite { .. } => MsgType::Rwrite,
            Msg::Tclunk { .. } => MsgType::Tclunk,
            Msg::Rclunk => MsgType::Rclunk,
            Msg::Tremove { .. } => MsgType::Tremove,
            Msg::Rremove => MsgType::Rremove,
            Msg::Tstat { .. } => MsgType::Tstat,
            Msg::Rstat { .. } => MsgType::Rstat,
            Msg::Twstat { .. } => MsgType::Twstat,
            Msg::Rwstat => MsgType::Rwstat,
        }
    }

    /// The existing fid a request operates on.
    ///
    /// `Tattach` and `Tauth` name fids they are about to create, so they
    /// report none here.
    pub fn fid(&self) -> Option<u32> {
        match *self {
            Msg::Twalk { fid, .. }
            | Msg::Topen { fid, .. }
            | Msg::Tcreate { fid, .. }
            | Msg::Tread { fid, .. }
            | Msg::Twrite { fid, .. }
            | Msg::Tclunk { fid }
            | Msg::Tremove { fid }
            | Msg::Tstat { fid }
            | Msg::Twstat { fid, .. } => Some(fid),
            _ => None,
        }
    }

    pub fn error(ename: impl Into<String>) -> Self {
        Msg::Rerror {
            ename: ename.into(),
        }
    }
}

/// A complete message: tag plus payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fcall {
    pub tag: u16,
    pub body: Msg,
}

impl Default for Fcall {
    fn default() -> Self {
        Self {
            tag: 0,
            body: Msg::Tversion {
                msize: 0,
                version: String::new(),
            },
        }
    }
}

impl Fcall {
    pub fn new(tag: u16, body: Msg) -> Self {
        Self { tag, body }
    }

    pub fn msg_type(&self) -> MsgType {
        self.body.msg_type()
    }

    /// Check that the message can be encoded as-is.
    pub fn validate(&self) -> Result<(), EncodeError> {
        let msg = self.msg_type();
        if self.tag == NOTAG
            && !matches!(msg, MsgType::Tversion | MsgType::Rversion | MsgType::Rerror)
        {
            return Err(EncodeError::ReservedTag(msg));
        }

        match &self.body {
            Msg::Tversion { version, .. } | Msg::Rversion { version, .. } => {
                check_str(msg, "version", version)
            }
            Msg::Tauth { afid, uname, aname } => {
                check_fid(msg, "afid", *afid)?;
                check_str(msg, "uname", uname)?;
                check_str(msg, "aname", aname)
            }
            Msg::Tattach {
                fid, uname, aname, ..
            } => {
                check_fid(msg, "fid", *fid)?;
                check_str(msg, "uname", uname)?;
                check_str(msg, "aname", aname)
            }
            Msg::Rerror { ename } => check_str(msg, "ename", ename),
            Msg::Twalk { fid, newfid, wname } => {
                check_fid(msg, "fid", *fid)?;
                check_fid(msg, "newfid", *newfid)?;
                check_walk_len(msg, wname.len())?;
                wname.iter().try_for_each(|name| check_str(msg, "wname", name))
            }
            Msg::Rwalk { wqid } => check_walk_len(msg, wqid.len()),
            Msg::Tcreate { fid, name, .. } => {
                check_fid(msg, "fid", *fid)?;
                check_str(msg, "name", name)
            }
            Msg::Rread { data } | Msg::Twrite { data, .. } => {
                if u32::try_from(data.len()).is_err() {
                    return Err(EncodeError::PayloadTooLarge {
                        msg,
                        len: data.len(),
                    });
                }
                self.body.fid().map_or(Ok(()), |fid| check_fid(msg, "fid", fid))
            }
            Msg::Rstat { stat } | Msg::Twstat { stat, .. } => {
                if stat.len() > u16::MAX as usize {
                    return Err(EncodeError::PayloadTooLarge {
                        msg,
                        len: stat.len(),
                    });
                }
                self.body.fid().map_or(Ok(()), |fid| check_fid(msg, "fid", fid))
            }
            body => body.fid().map_or(Ok(()), |fid| check_fid(msg, "fid", fid)),
        }
    }
}

fn check_fid(msg: MsgType, field: &'static str, fid: u32) -> Result<(), EncodeError> {
    if fid == NOFID {
        Err(EncodeError::MissingField { msg, field })
    } else {
        Ok(())
    }
}

fn check_str(msg: MsgType, field: &'static str, value: &str) -> Result<(), EncodeError> {
    if value.len() > u16::MAX as usize {
        Err(EncodeError::StringTooLong {
            msg,
            field,
            len: value.len(),
        })
    } else {
        Ok(())
    }
}

fn check_walk_len(msg: MsgType, len: usize) -> Result<(), EncodeError> {
    if len > MAXWELEM {
        Err(EncodeError::TooManyWalkElements {
            msg,
            len,
            max: MAXWELEM,
        })
    } else {
        Ok(())
    }
}

struct StatDisplay<'a>(&'a [u8]);

impl fmt::Display for StatDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Dir::decode(self.0) {
            Ok(dir) => write!(f, "{}", dir),
            Err(_) => write!(f, "({} bytes)", self.0.len()),
        }
    }
}

impl fmt::Display for Fcall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag;
        write!(f, "{} tag {}", self.msg_type(), tag)?;
        match &self.body {
            Msg::Tversion { msize, version } | Msg::Rversion { msize, version } => {
                write!(f, " msize {} version '{}'", msize, version)
            }
            Msg::Tauth { afid, uname, aname } => {
                write!(f, " afid {} uname '{}' aname '{}'", afid, uname, aname)
            }
            Msg::Rauth { aqid } => write!(f, " qid {}", aqid),
            Msg::Tattach {
                fid,
                afid,
                uname,
                aname,
            } => write!(
                f,
                " fid {} afid {} uname '{}' aname '{}'",
                fid, afid, uname, aname
            ),
            Msg::Rattach { qid } => write!(f, " qid {}", qid),
            Msg::Rerror { ename } => write!(f, " ename '{}'", ename),
            Msg::Tflush { oldtag } => write!(f, " oldtag {}", oldtag),
            Msg::Twalk { fid, newfid, wname } => {
                write!(f, " fid {} newfid {} wname [{}]", fid, newfid, wname.join(" "))
            }
            Msg::Rwalk { wqid } => {
                f.write_str(" wqid [")?;
                for (idx, qid) in wqid.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", qid)?;
                }
                f.write_str("]")
            }
            Msg::Topen { fid, mode } => write!(f, " fid {} mode {}", fid, mode),
            Msg::Ropen { qid, iounit } | Msg::Rcreate { qid, iounit } => {
                write!(f, " qid {} iounit {}", qid, iounit)
            }
            Msg::Tcreate {
                fid,
                name,
                perm,
                mode,
            } => write!(
                f,
                " fid {} name '{}' perm {} mode {}",
                fid, name, perm, mode
            ),
            Msg::Tread { fid, offset, count } => {
                write!(f, " fid {} offset {} count {}", fid, offset, count)
            }
            Msg::Rread { data } => write!(f, " count {} '{}'", data.len(), dump_some(data)),
            Msg::Twrite { fid, offset, data } => write!(
                f,
                " fid {} offset {} count {} '{}'",
                fid,
                offset,
                data.len(),
                dump_some(data)
            ),
            Msg::Rwrite { count } => write!(f, " count {}", count),
            Msg::Tclunk { fid } | Msg::Tremove { fid } | Msg::Tstat { fid } => {
                write!(f, " fid {}", fid)
            }
            Msg::Rstat { stat } => write!(f, " stat {}", StatDisplay(stat)),
            Msg::Twstat { fid, stat } => write!(f, " fid {} stat {}", fid, StatDisplay(stat)),
            Msg::Rflush | Msg::Rclunk | Msg::Rremove | Msg::Rwstat => Ok(()),
        }
    }
}
