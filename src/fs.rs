//! Backend interface the server dispatches requests to.

use async_trait::async_trait;

use crate::error::FsError;
use crate::protocol::{Perm, Qid};
use crate::stat::Dir;

/// Result of resolving path elements from a base handle.
#[derive(Debug)]
pub struct Walked<H> {
    /// One qid per element resolved, in order.
    pub qids: Vec<Qid>,
    /// The handle at the final element; only needed when every element resolved.
    pub handle: Option<H>,
}

impl<H> Walked<H> {
    pub fn complete(qids: Vec<Qid>, handle: H) -> Self {
        Self {
            qids,
            handle: Some(handle),
        }
    }

    pub fn partial(qids: Vec<Qid>) -> Self {
        Self { qids, handle: None }
    }
}

/// A filesystem served over the protocol.
///
/// Each method receives the backend handle bound to the request's fid.
/// Domain failures are returned as [`FsError::Domain`] and answered with an
/// error response; [`FsError::Fatal`] tears the connection down.
#[async_trait]
pub trait Filesystem: Send + Sync + 'static {
    /// Per-fid backend state.
    type Handle: Send + Sync + 'static;

    /// Create an authentication handle.
    async fn auth(&self, _uname: &str, _aname: &str) -> Result<(Qid, Self::Handle), FsError> {
        Err(FsError::new("authentication not required"))
    }

    /// Bind the root of the tree named by `aname`.
    async fn attach(
        &self,
        auth: Option<&Self::Handle>,
        uname: &str,
        aname: &str,
    ) -> Result<(Qid, Self::Handle), FsError>;

    /// Resolve `names` one by one from `handle`.
    ///
    /// Stop at the first element that does not exist. An empty `names`
    /// clones the handle.
    async fn walk(
        &self,
        handle: &Self::Handle,
        names: &[String],
    ) -> Result<Walked<Self::Handle>, FsError>;

    async fn open(&self, handle: &Self::Handle, mode: u8) -> Result<Qid, FsError>;

    /// Create `name` inside the directory `dir` and open it with `mode`.
    async fn create(
        &self,
        _dir: &Self::Handle,
        _name: &str,
        _perm: Perm,
        _mode: u8,
    ) -> Result<(Qid, Self::Handle), FsError> {
        Err(FsError::not_supported())
    }

    /// Read at most `count` bytes. Directories answer with packed stat records.
    async fn read(&self, handle: &Self::Handle, offset: u64, count: u32)
    -> Result<Vec<u8>, FsError>;

    async fn write(
        &self,
        _handle: &Self::Handle,
        _offset: u64,
        _data: &[u8],
    ) -> Result<u32, FsError> {
        Err(FsError::not_supported())
    }

    /// The fid is gone; release whatever the handle holds.
    async fn clunk(&self, _handle: &Self::Handle) -> Result<(), FsError> {
        Ok(())
    }

    async fn remove(&self, _handle: &Self::Handle) -> Result<(), FsError> {
        Err(FsError::not_supported())
    }

    async fn stat(&self, handle: &Self::Handle) -> Result<Dir, FsError>;

    async fn wstat(&self, _handle: &Self::Handle, _dir: &Dir) -> Result<(), FsError> {
        Err(FsError::not_supported())
    }
}
