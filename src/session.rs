//! Client session state and high-level operations.
//!
//! Requests may be issued concurrently from `&Session`; a reader task
//! matches each response to its request by tag.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use crate::codec::{self, FcallCodec};
use crate::config::SessionConfig;
use crate::error::{Error, NOT_FOUND, Result};
use crate::fcall::{Fcall, Msg};
use crate::message::dump_hex;
use crate::parse::{path_parts, split_parent_name};
use crate::protocol::{
    IOHDRSZ, MAXWELEM, MsgType, NOFID, NOTAG, OREAD, OTRUNC, OWRITE, Perm, Qid, VERSION9P,
};
use crate::stat::{Dir, read_dir_entries};
use crate::transport::Transport;

/// Hands out tags that are unique among outstanding requests.
///
/// Tags are issued in increasing order with wraparound, skipping `NOTAG`
/// and any tag not yet released.
#[derive(Debug)]
pub struct TagAllocator {
    next: u16,
    in_use: HashSet<u16>,
}

impl TagAllocator {
    pub fn new() -> Self {
        Self {
            next: 1,
            in_use: HashSet::new(),
        }
    }

    /// `None` when every usable tag is outstanding.
    pub fn alloc(&mut self) -> Option<u16> {
        if self.in_use.len() >= NOTAG as usize {
            return None;
        }
        loop {
            let tag = self.next;
            self.next = self.next.wrapping_add(1);
            if tag != NOTAG && self.in_use.insert(tag) {
                return Some(tag);
            }
        }
    }

    pub fn release(&mut self, tag: u16) -> bool {
        self.in_use.remove(&tag)
    }

    pub fn outstanding(&self) -> usize {
        self.in_use.len()
    }
}

impl Default for TagAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out fids not currently bound on this connection.
#[derive(Debug)]
struct FidAllocator {
    next: u32,
    in_use: HashSet<u32>,
}

impl FidAllocator {
    fn new() -> Self {
        Self {
            next: 1,
            in_use: HashSet::new(),
        }
    }

    fn alloc(&mut self) -> u32 {
        loop {
            let fid = self.next;
            self.next = self.next.wrapping_add(1);
            if fid != NOFID && self.in_use.insert(fid) {
                return fid;
            }
        }
    }

    fn release(&mut self, fid: u32) {
        self.in_use.remove(&fid);
    }
}

enum Reply {
    Response(Fcall),
    Flushed,
}

struct Waiter {
    serial: u64,
    tx: oneshot::Sender<Reply>,
}

struct Outstanding {
    tags: TagAllocator,
    waiters: HashMap<u16, Waiter>,
    /// Tells apart successive requests that reuse a tag.
    serial: u64,
    /// Set once either direction of the transport has failed.
    closed: bool,
}

impl Outstanding {
    /// Fail every waiter and refuse new requests.
    fn close(&mut self) {
        self.closed = true;
        self.tags = TagAllocator::new();
        // dropping the senders wakes every waiter with Disconnected
        self.waiters.clear();
    }
}

struct Shared {
    outstanding: Arc<Mutex<Outstanding>>,
    fids: Mutex<FidAllocator>,
    out: mpsc::UnboundedSender<Vec<u8>>,
}

impl Shared {
    /// Forget a tag, handing back whoever was waiting on it.
    fn retire(&self, tag: u16) -> Option<oneshot::Sender<Reply>> {
        let mut outstanding = self.outstanding.lock();
        outstanding.tags.release(tag);
        outstanding.waiters.remove(&tag).map(|waiter| waiter.tx)
    }

    /// Like [`Shared::retire`], but only while `tag` still belongs to the
    /// request numbered `serial`.
    fn retire_request(&self, tag: u16, serial: u64) -> Option<oneshot::Sender<Reply>> {
        let mut outstanding = self.outstanding.lock();
        if outstanding.waiters.get(&tag)?.serial != serial {
            return None;
        }
        outstanding.tags.release(tag);
        outstanding.waiters.remove(&tag).map(|waiter| waiter.tx)
    }

    fn serial(&self, tag: u16) -> Option<u64> {
        self.outstanding
            .lock()
            .waiters
            .get(&tag)
            .map(|waiter| waiter.serial)
    }
}

/// A request on the wire whose response has not been collected yet.
pub struct PendingReply {
    tag: u16,
    expect: MsgType,
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Wait for the response. `Rerror` surfaces as [`Error::Remote`].
    pub async fn wait(self) -> Result<Msg> {
        match self.rx.await {
            Err(_) => Err(Error::Disconnected),
            Ok(Reply::Flushed) => Err(Error::Flushed),
            Ok(Reply::Response(fcall)) => match fcall.body {
                Msg::Rerror { ename } => Err(Error::Remote(ename)),
                body if body.msg_type() == self.expect => Ok(body),
                body => Err(Error::UnexpectedResponse {
                    expected: self.expect,
                    got: body.msg_type(),
                }),
            },
        }
    }
}

/// A single client connection.
pub struct Session {
    shared: Arc<Shared>,
    config: SessionConfig,
    msize: u32,
    version: String,
    root: Option<(u32, Qid)>,
    reader: JoinHandle<()>,
}

impl Session {
    /// Start a session over `transport`. Must be called inside a tokio runtime.
    pub fn new<T: Transport>(transport: T, config: SessionConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outstanding: Arc::new(Mutex::new(Outstanding {
                tags: TagAllocator::new(),
                waiters: HashMap::new(),
                serial: 0,
                closed: false,
            })),
            fids: Mutex::new(FidAllocator::new()),
            out: tx,
        });
        tokio::spawn(request_writer(
            write_half,
            rx,
            Arc::clone(&shared.outstanding),
        ));
        let reader = tokio::spawn(response_reader(
            read_half,
            Arc::clone(&shared),
            config.msize,
        ));
        Self {
            shared,
            config,
            msize: 0,
            version: String::from("unknown"),
            root: None,
            reader,
        }
    }

    pub fn msize(&self) -> u32 {
        self.msize
    }

    pub fn protocol_version(&self) -> &str {
        &self.version
    }

    /// Root fid and qid once attached.
    pub fn root(&self) -> Option<(u32, Qid)> {
        self.root
    }

    /// Negotiate protocol version and attach to the server root.
    pub async fn negotiate(&mut self) -> Result<()> {
        let version = self.version(VERSION9P).await?;
        if !version.starts_with(VERSION9P) {
            return Err(Error::protocol(format!("unsupported version: {}", version)));
        }
        let uname = self.config.uname.clone();
        let aname = self.config.aname.clone();
        let (fid, qid) = self.attach(None, &uname, &aname).await?;
        self.root = Some((fid, qid));
        Ok(())
    }

    pub async fn version(&mut self, version: &str) -> Result<String> {
        let body = Msg::Tversion {
            msize: self.config.msize,
            version: version.to_string(),
        };
        match self.submit(Some(NOTAG), body)?.wait().await? {
            Msg::Rversion { msize, version } => {
                if msize > self.config.msize {
                    warn!("server raised msize {} above {}", msize, self.config.msize);
                    return Err(Error::protocol("server raised msize"));
                }
                self.msize = msize;
                self.version = version.clone();
                Ok(version)
            }
            other => Err(unexpected(MsgType::Rversion, &other)),
        }
    }

    /// Authenticate, returning the new auth fid and its qid.
    pub async fn auth(&self, uname: &str, aname: &str) -> Result<(u32, Qid)> {
        let afid = self.alloc_fid();
        let body = Msg::Tauth {
            afid,
            uname: uname.to_string(),
            aname: aname.to_string(),
        };
        match self.rpc(body).await {
            Ok(Msg::Rauth { aqid }) => Ok((afid, aqid)),
            Ok(other) => {
                self.release_fid(afid);
                Err(unexpected(MsgType::Rauth, &other))
            }
            Err(err) => {
                self.release_fid(afid);
                Err(err)
            }
        }
    }

    /// Attach a new fid to the root of `aname`.
    pub async fn attach(&self, afid: Option<u32>, uname: &str, aname: &str) -> Result<(u32, Qid)> {
        let fid = self.alloc_fid();
        let body = Msg::Tattach {
            fid,
            afid: afid.unwrap_or(NOFID),
            uname: uname.to_string(),
            aname: aname.to_string(),
        };
        match self.rpc(body).await {
            Ok(Msg::Rattach { qid }) => Ok((fid, qid)),
            Ok(other) => {
                self.release_fid(fid);
                Err(unexpected(MsgType::Rattach, &other))
            }
            Err(err) => {
                self.release_fid(fid);
                Err(err)
            }
        }
    }

    /// Walk `names` from `fid` to `newfid`; a short result is a partial walk.
    pub async fn walk(&self, fid: u32, newfid: u32, names: &[&str]) -> Result<Vec<Qid>> {
        let body = Msg::Twalk {
            fid,
            newfid,
            wname: names.iter().map(|name| name.to_string()).collect(),
        };
        match self.rpc(body).await? {
            Msg::Rwalk { wqid } => Ok(wqid),
            other => Err(unexpected(MsgType::Rwalk, &other)),
        }
    }

    /// Walk from the root to `path`, returning a fresh fid and the file's qid.
    pub async fn walk_path(&self, path: &str) -> Result<(u32, Qid)> {
        let (root_fid, root_qid) = self.root.ok_or_else(|| Error::protocol("not attached"))?;
        let names = path_parts(path);
        let fid = self.alloc_fid();
        let mut qid = root_qid;
        let mut from = root_fid;
        let mut chunks: Vec<&[&str]> = names.chunks(MAXWELEM).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        for chunk in chunks {
            let qids = match self.walk(from, fid, chunk).await {
                Ok(qids) => qids,
                Err(err) => {
                    self.abandon_walk(fid, from).await;
                    // the first element of the chunk did not resolve
                    return Err(match err {
                        Error::Remote(ename) if ename == NOT_FOUND => {
                            debug!("walk to {} failed: {}", path, ename);
                            Error::NotFound(path.to_string())
                        }
                        err => err,
                    });
                }
            };
            if qids.len() < chunk.len() {
                self.abandon_walk(fid, from).await;
                return Err(Error::NotFound(path.to_string()));
            }
            if let Some(last) = qids.last() {
                qid = *last;
            }
            from = fid;
        }
        Ok((fid, qid))
    }

    /// Drop a fid whose walk stopped short. It is only bound on the server
    /// once an earlier chunk walked it.
    async fn abandon_walk(&self, fid: u32, from: u32) {
        if from == fid {
            let _ = self.clunk(fid).await;
        } else {
            self.release_fid(fid);
        }
    }

    /// Open `fid`, returning its qid and iounit.
    pub async fn open(&self, fid: u32, mode: u8) -> Result<(Qid, u32)> {
        match self.rpc(Msg::Topen { fid, mode }).await? {
            Msg::Ropen { qid, iounit } => Ok((qid, iounit)),
            other => Err(unexpected(MsgType::Ropen, &other)),
        }
    }

    /// Create `name` in the directory `fid`; `fid` then refers to the new file.
    pub async fn create(&self, fid: u32, name: &str, perm: Perm, mode: u8) -> Result<(Qid, u32)> {
        let body = Msg::Tcreate {
            fid,
            name: name.to_string(),
            perm,
            mode,
        };
        match self.rpc(body).await? {
            Msg::Rcreate { qid, iounit } => Ok((qid, iounit)),
            other => Err(unexpected(MsgType::Rcreate, &other)),
        }
    }

    pub async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        match self.rpc(Msg::Tread { fid, offset, count }).await? {
            Msg::Rread { data } => Ok(data),
            other => Err(unexpected(MsgType::Rread, &other)),
        }
    }

    pub async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        let body = Msg::Twrite {
            fid,
            offset,
            data: data.to_vec(),
        };
        match self.rpc(body).await? {
            Msg::Rwrite { count } => Ok(count),
            other => Err(unexpected(MsgType::Rwrite, &other)),
        }
    }

    /// Release `fid`. The fid is free for reuse whatever the server answers.
    pub async fn clunk(&self, fid: u32) -> Result<()> {
        let result = self.rpc(Msg::Tclunk { fid }).await;
        self.release_fid(fid);
        match result? {
            Msg::Rclunk => Ok(()),
            other => Err(unexpected(MsgType::Rclunk, &other)),
        }
    }

    /// Remove the file behind `fid`; the fid is released either way.
    pub async fn remove(&self, fid: u32) -> Result<()> {
        let result = self.rpc(Msg::Tremove { fid }).await;
        self.release_fid(fid);
        match result? {
            Msg::Rremove => Ok(()),
            other => Err(unexpected(MsgType::Rremove, &other)),
        }
    }

    pub async fn stat(&self, fid: u32) -> Result<Dir> {
        match self.rpc(Msg::Tstat { fid }).await? {
            Msg::Rstat { stat } => Ok(Dir::decode(&stat)?),
            other => Err(unexpected(MsgType::Rstat, &other)),
        }
    }

    pub async fn wstat(&self, fid: u32, dir: &Dir) -> Result<()> {
        let stat = dir.encode()?;
        match self.rpc(Msg::Twstat { fid, stat }).await? {
            Msg::Rwstat => Ok(()),
            other => Err(unexpected(MsgType::Rwstat, &other)),
        }
    }

    /// Abandon the request tagged `oldtag`.
    ///
    /// Once the server acknowledges, the old request resolves to
    /// [`Error::Flushed`] unless its response arrived first.
    pub async fn flush(&self, oldtag: u16) -> Result<()> {
        let serial = self.shared.serial(oldtag);
        match self.rpc(Msg::Tflush { oldtag }).await? {
            Msg::Rflush => {
                let waiter = serial.and_then(|serial| self.shared.retire_request(oldtag, serial));
                if let Some(waiter) = waiter {
                    debug!("tag {} flushed", oldtag);
                    let _ = waiter.send(Reply::Flushed);
                }
                Ok(())
            }
            other => Err(unexpected(MsgType::Rflush, &other)),
        }
    }

    /// List directory entries at the provided path.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let (fid, qid) = self.walk_path(path).await?;
        if !qid.is_dir() {
            self.clunk(fid).await?;
            return Err(Error::protocol(format!("{}: not a directory", path)));
        }
        let result = self.read_dir_fid(fid).await;
        self.clunk(fid).await?;
        Ok(result?
            .into_iter()
            .map(|dir| dir.name)
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    async fn read_dir_fid(&self, fid: u32) -> Result<Vec<Dir>> {
        let (_, iounit) = self.open(fid, OREAD).await?;
        let count = self.chunk_size(iounit);
        let mut offset = 0u64;
        let mut entries = Vec::new();
        loop {
            let data = self.read(fid, offset, count).await?;
            if data.is_empty() {
                break;
            }
            offset += data.len() as u64;
            entries.extend(read_dir_entries(&data)?);
        }
        Ok(entries)
    }

    /// Ensure the path points to a directory.
    pub async fn ensure_dir(&self, path: &str) -> Result<()> {
        let (fid, qid) = self.walk_path(path).await?;
        self.clunk(fid).await?;
        if qid.is_dir() {
            Ok(())
        } else {
            Err(Error::protocol(format!("{}: not a directory", path)))
        }
    }

    /// Create a directory at `path`.
    pub async fn create_dir(&self, path: &str) -> Result<()> {
        let (parent, name) = split_parent_name(path)?;
        let (fid, qid) = self.walk_path(parent).await?;
        if !qid.is_dir() {
            self.clunk(fid).await?;
            return Err(Error::protocol("parent is not a directory"));
        }
        let result = self
            .create(fid, name, Perm::DIR | Perm::from_bits_retain(0o755), OREAD)
            .await;
        self.clunk(fid).await?;
        result.map(|_| ())
    }

    /// Read a whole file.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let (fid, _) = self.walk_path(path).await?;
        let result = self.read_fid(fid).await;
        self.clunk(fid).await?;
        result
    }

    async fn read_fid(&self, fid: u32) -> Result<Vec<u8>> {
        let (_, iounit) = self.open(fid, OREAD).await?;
        let count = self.chunk_size(iounit);
        let mut contents = Vec::new();
        loop {
            let data = self.read(fid, contents.len() as u64, count).await?;
            if data.is_empty() {
                break;
            }
            contents.extend_from_slice(&data);
        }
        Ok(contents)
    }

    /// Replace the contents of `path`, creating the file if needed.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let (fid, iounit) = match self.walk_path(path).await {
            Ok((fid, _)) => match self.open(fid, OWRITE | OTRUNC).await {
                Ok((_, iounit)) => (fid, iounit),
                Err(err) => {
                    self.clunk(fid).await?;
                    return Err(err);
                }
            },
            Err(Error::NotFound(_)) => {
                let (parent, name) = split_parent_name(path)?;
                let (fid, _) = self.walk_path(parent).await?;
                match self
                    .create(fid, name, Perm::from_bits_retain(0o644), OWRITE)
                    .await
                {
                    Ok((_, iounit)) => (fid, iounit),
                    Err(err) => {
                        self.clunk(fid).await?;
                        return Err(err);
                    }
                }
            }
            Err(err) => return Err(err),
        };
        let result = self.write_all(fid, data, self.chunk_size(iounit)).await;
        self.clunk(fid).await?;
        result
    }

    async fn write_all(&self, fid: u32, data: &[u8], chunk: u32) -> Result<()> {
        let mut offset = 0usize;
        while offset < data.len() {
            let end = data.len().min(offset + chunk as usize);
            let wrote = self.write(fid, offset as u64, &data[offset..end]).await?;
            if wrote == 0 {
                return Err(Error::protocol("short write"));
            }
            offset += wrote as usize;
        }
        Ok(())
    }

    fn chunk_size(&self, iounit: u32) -> u32 {
        if iounit > 0 {
            iounit
        } else {
            self.msize.saturating_sub(IOHDRSZ).max(1)
        }
    }

    /// Send a request and wait for its response.
    pub async fn rpc(&self, body: Msg) -> Result<Msg> {
        self.start(body)?.wait().await
    }

    /// Put a request on the wire without waiting for its response.
    pub fn start(&self, body: Msg) -> Result<PendingReply> {
        self.submit(None, body)
    }

    fn submit(&self, tag: Option<u16>, body: Msg) -> Result<PendingReply> {
        let expect = body
            .msg_type()
            .response_type()
            .ok_or_else(|| Error::protocol(format!("{} is not a request", body.msg_type())))?;
        let (tx, rx) = oneshot::channel();
        let tag = {
            let mut outstanding = self.shared.outstanding.lock();
            if outstanding.closed {
                return Err(Error::Disconnected);
            }
            let tag = match tag {
                Some(tag) if outstanding.waiters.contains_key(&tag) => {
                    return Err(Error::protocol(format!("tag {} is outstanding", tag)));
                }
                Some(tag) => tag,
                None => outstanding
                    .tags
                    .alloc()
                    .ok_or_else(|| Error::protocol("no free tags"))?,
            };
            outstanding.serial += 1;
            let serial = outstanding.serial;
            outstanding.waiters.insert(tag, Waiter { serial, tx });
            tag
        };

        let fcall = Fcall::new(tag, body);
        debug!("-> {}", fcall);
        let frame = match codec::encode(&fcall) {
            Ok(frame) => frame,
            Err(err) => {
                self.shared.retire(tag);
                return Err(err.into());
            }
        };
        if self.shared.out.send(frame).is_err() {
            self.shared.retire(tag);
            return Err(Error::Disconnected);
        }
        Ok(PendingReply { tag, expect, rx })
    }

    fn alloc_fid(&self) -> u32 {
        self.shared.fids.lock().alloc()
    }

    fn release_fid(&self, fid: u32) {
        self.shared.fids.lock().release(fid);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn unexpected(expected: MsgType, got: &Msg) -> Error {
    Error::UnexpectedResponse {
        expected,
        got: got.msg_type(),
    }
}

async fn request_writer<W>(
    mut write_half: W,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    outstanding: Arc<Mutex<Outstanding>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        trace!("write {}", dump_hex(&frame));
        let written = match write_half.write_all(&frame).await {
            Ok(()) => write_half.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            error!("write failed: {}", err);
            outstanding.lock().close();
            break;
        }
    }
}

async fn response_reader<R>(read_half: R, shared: Arc<Shared>, max_size: u32)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(read_half, FcallCodec::new(max_size));
    while let Some(next) = frames.next().await {
        match next {
            Ok(fcall) => {
                debug!("<- {}", fcall);
                match shared.retire(fcall.tag) {
                    Some(waiter) => {
                        let _ = waiter.send(Reply::Response(fcall));
                    }
                    None => debug!("no request waiting on tag {}", fcall.tag),
                }
            }
            Err(err) => {
                error!("closing session: {}", err);
                break;
            }
        }
    }
    shared.outstanding.lock().close();
}
