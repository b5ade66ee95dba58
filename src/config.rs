//! Server and session configuration.

use crate::protocol::{DEFAULT_MSIZE, IOHDRSZ, VERSION9P};

/// Default largest message a server accepts: an 8K payload plus header room.
const DEFAULT_MAX_MSIZE: u32 = 8192 + IOHDRSZ;

/// Smallest msize worth negotiating.
const DEFAULT_MIN_MSIZE: u32 = 256;

/// Configuration for serving connections.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on the negotiated message size.
    pub max_msize: u32,

    /// Version requests offering less than this are refused.
    pub min_msize: u32,

    /// Version string answered to clients speaking the protocol family.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_msize: DEFAULT_MAX_MSIZE,
            min_msize: DEFAULT_MIN_MSIZE,
            version: VERSION9P.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_msize(mut self, msize: u32) -> Self {
        self.max_msize = msize;
        self
    }

    pub fn min_msize(mut self, msize: u32) -> Self {
        self.min_msize = msize;
        self
    }
}

/// Configuration for a client session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Message size offered in the version request.
    pub msize: u32,

    /// User name presented on attach.
    pub uname: String,

    /// File tree selected on attach.
    pub aname: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            msize: DEFAULT_MSIZE,
            uname: String::from("root"),
            aname: String::new(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn msize(mut self, msize: u32) -> Self {
        self.msize = msize;
        self
    }

    pub fn uname(mut self, uname: impl Into<String>) -> Self {
        self.uname = uname.into();
        self
    }

    pub fn aname(mut self, aname: impl Into<String>) -> Self {
        self.aname = aname.into();
        self
    }
}
