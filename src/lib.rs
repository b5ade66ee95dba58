//! 9P2000 wire codec with an async server dispatcher and client session.
//!
//! [`codec`] turns [`Fcall`] values into frames and back. [`Server`] runs
//! the per-connection state machine on top of a [`Filesystem`] backend,
//! and [`Session`] is the matching client.

pub mod codec;
pub mod config;
pub mod error;
pub mod fcall;
pub mod fs;
mod message;
mod parse;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stat;
mod transport;

pub use codec::{FcallCodec, decode, encode, frame_len};
pub use config::{ServerConfig, SessionConfig};
pub use error::{DecodeError, EncodeError, Error, FsError, Result};
pub use fcall::{Fcall, Msg};
pub use fs::{Filesystem, Walked};
pub use protocol::{
    DEFAULT_MSIZE, HEADER_SIZE, IOHDRSZ, MAXWELEM, MsgType, NOFID, NOTAG, Perm, Qid, QidType,
    VERSION9P,
};
pub use server::Server;
pub use session::{PendingReply, Session, TagAllocator};
pub use stat::{Dir, pack_dir_entries, read_dir_entries};
pub use transport::Transport;
