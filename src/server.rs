//! Server side of a connection: protocol state, fid table and dispatch.
//!
//! One task reads frames in order. Version negotiation and flushes are
//! answered inline; every other request runs on its own task and may
//! complete out of order, its response carrying the request's tag.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::codec::{FcallCodec, encode};
use crate::config::ServerConfig;
use crate::error::{EncodeError, Error, FsError, Result};
use crate::fcall::{Fcall, Msg};
use crate::fs::Filesystem;
use crate::message::dump_hex;
use crate::protocol::{
    IOHDRSZ, NOFID, OEXEC, ORCLOSE, ORDWR, OREAD, OWRITE, Qid, QidType, VERSION_UNKNOWN,
};
use crate::stat::Dir;
use crate::transport::Transport;

const FID_UNKNOWN: &str = "fid unknown";
const FID_IN_USE: &str = "fid in use";
const FID_OPEN: &str = "fid already open";
const TAG_IN_USE: &str = "tag in use";
const NOT_NEGOTIATED: &str = "version not negotiated";
const ALREADY_NEGOTIATED: &str = "version already negotiated";
const RESPONSE_TOO_LARGE: &str = "response too large";

/// Protocol state of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    Unversioned,
    Versioned,
    Attached,
    Closed,
}

struct Negotiation {
    state: ConnState,
    msize: u32,
}

/// What a fid is bound to.
struct FidEntry<H> {
    handle: Arc<H>,
    qid: Qid,
    mode: Option<u8>,
}

impl<H> FidEntry<H> {
    fn new(handle: H, qid: Qid) -> Self {
        Self {
            handle: Arc::new(handle),
            qid,
            mode: None,
        }
    }

    fn opened(mut self, mode: u8) -> Self {
        self.mode = Some(mode);
        self
    }
}

impl<H> Clone for FidEntry<H> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
            qid: self.qid,
            mode: self.mode,
        }
    }
}

/// Serves the protocol for a [`Filesystem`] backend.
pub struct Server<F> {
    fs: Arc<F>,
    config: ServerConfig,
}

impl<F: Filesystem> Server<F> {
    pub fn new(fs: F) -> Self {
        Self::with_config(fs, ServerConfig::default())
    }

    pub fn with_config(fs: F, config: ServerConfig) -> Self {
        Self {
            fs: Arc::new(fs),
            config,
        }
    }

    pub fn filesystem(&self) -> &Arc<F> {
        &self.fs
    }

    /// Serve one connection until the peer hangs up or the stream breaks.
    ///
    /// Returns `Ok` on a clean end of stream. Framing errors and fatal
    /// backend failures close the connection and are returned, as does a
    /// failed write.
    pub async fn serve<T: Transport>(&self, io: T) -> Result<()> {
        let (read_half, write_half) = tokio::io::split(io);
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            fs: Arc::clone(&self.fs),
            config: self.config.clone(),
            negotiation: Mutex::new(Negotiation {
                state: ConnState::Unversioned,
                msize: self.config.max_msize,
            }),
            fids: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            out: Mutex::new(Some(tx)),
            shutdown: CancellationToken::new(),
            fatal: Mutex::new(None),
        });
        let writer = tokio::spawn(response_writer(write_half, rx, Arc::clone(&conn)));

        let result = Arc::clone(&conn).receive(read_half).await;
        conn.close();
        conn.clunk_all().await;
        let _ = writer.await;
        debug!("connection closed");
        result
    }
}

struct Connection<F: Filesystem> {
    fs: Arc<F>,
    config: ServerConfig,
    negotiation: Mutex<Negotiation>,
    fids: Mutex<HashMap<u32, FidEntry<F::Handle>>>,
    /// In-flight requests; a response is only sent while its tag is here.
    pending: Mutex<HashMap<u16, Option<AbortHandle>>>,
    /// Encoded responses for the writer task.
    out: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    shutdown: CancellationToken,
    /// Why the connection is being torn down.
    fatal: Mutex<Option<Error>>,
}

impl<F: Filesystem> Connection<F> {
    async fn receive<R>(self: Arc<Self>, read_half: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FramedRead::new(read_half, FcallCodec::new(self.config.max_msize));
        loop {
            let next = tokio::select! {
                next = frames.next() => next,
                _ = self.shutdown.cancelled() => {
                    return Err(self.fatal.lock().take().unwrap_or(Error::Disconnected));
                }
            };
            let fcall = match next {
                None => return Ok(()),
                Some(Ok(fcall)) => fcall,
                Some(Err(err)) => {
                    error!("closing connection: {}", err);
                    return Err(err.into());
                }
            };
            debug!(">>> {}", fcall);
            if !fcall.msg_type().is_request() {
                error!("closing connection: client sent {}", fcall.msg_type());
                return Err(Error::protocol(format!(
                    "unexpected {} from client",
                    fcall.msg_type()
                )));
            }
            if let Some(msize) = self.accept(fcall) {
                frames.decoder_mut().set_max_size(msize);
            }
        }
    }

    /// Route one request. Returns the msize when this request negotiated it.
    fn accept(self: &Arc<Self>, fcall: Fcall) -> Option<u32> {
        let Fcall { tag, body } = fcall;
        match body {
            Msg::Tversion { msize, version } => {
                let (reply, negotiated) = self.version(msize, &version);
                self.send(Fcall::new(tag, reply));
                return negotiated;
            }
            _ if self.state() == ConnState::Unversioned => {
                warn!("tag {}: {} before version", tag, body.msg_type());
                self.send(Fcall::new(tag, Msg::error(NOT_NEGOTIATED)));
            }
            Msg::Tflush { oldtag } => self.flush(tag, oldtag),
            body => self.spawn(tag, body),
        }
        None
    }

    fn state(&self) -> ConnState {
        self.negotiation.lock().state
    }

    fn version(&self, msize: u32, version: &str) -> (Msg, Option<u32>) {
        let mut negotiation = self.negotiation.lock();
        if negotiation.state != ConnState::Unversioned {
            return (Msg::error(ALREADY_NEGOTIATED), None);
        }
        let msize = msize.min(self.config.max_msize);
        if msize < self.config.min_msize {
            return (Msg::error(format!("msize {} too small", msize)), None);
        }
        if !version.starts_with("9P2000") {
            warn!("unsupported version '{}'", version);
            let reply = Msg::Rversion {
                msize,
                version: VERSION_UNKNOWN.to_string(),
            };
            return (reply, None);
        }
        negotiation.state = ConnState::Versioned;
        negotiation.msize = msize;
        let reply = Msg::Rversion {
            msize,
            version: self.config.version.clone(),
        };
        (reply, Some(msize))
    }

    fn flush(&self, tag: u16, oldtag: u16) {
        let mut pending = self.pending.lock();
        if tag != oldtag && pending.contains_key(&tag) {
            warn!("flush reuses outstanding tag {}", tag);
            self.send(Fcall::new(tag, Msg::error(TAG_IN_USE)));
            return;
        }
        if let Some(task) = pending.remove(&oldtag) {
            debug!("flushing tag {}", oldtag);
            if let Some(task) = task {
                task.abort();
            }
        }
        // queued under the pending lock so no response for oldtag can follow
        self.send(Fcall::new(tag, Msg::Rflush));
    }

    fn spawn(self: &Arc<Self>, tag: u16, body: Msg) {
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&tag) {
                drop(pending);
                warn!("tag {} already outstanding, rejecting {}", tag, body.msg_type());
                self.send(Fcall::new(tag, Msg::error(TAG_IN_USE)));
                return;
            }
            pending.insert(tag, None);
        }
        let abortable = abortable(&body);
        let conn = Arc::clone(self);
        let task = tokio::spawn(async move { conn.handle(tag, body).await });
        // the rest run to completion when flushed; only their response is dropped
        if abortable {
            if let Some(slot) = self.pending.lock().get_mut(&tag) {
                *slot = Some(task.abort_handle());
            }
        }
    }

    async fn handle(self: Arc<Self>, tag: u16, body: Msg) {
        let msg_type = body.msg_type();
        match self.dispatch(body).await {
            Ok(reply) => self.respond(tag, reply),
            Err(FsError::Domain(ename)) => {
                debug!("{} tag {} failed: {}", msg_type, tag, ename);
                self.respond(tag, Msg::Rerror { ename });
            }
            Err(FsError::Fatal(reason)) => {
                error!("{} tag {}: fatal backend failure: {}", msg_type, tag, reason);
                self.pending.lock().remove(&tag);
                self.fail(Error::Fatal(reason));
            }
        }
    }

    /// Send the response for `tag` unless it was flushed.
    fn respond(&self, tag: u16, body: Msg) {
        let mut pending = self.pending.lock();
        if pending.remove(&tag).is_none() {
            debug!("tag {} was flushed, dropping {}", tag, body.msg_type());
            return;
        }
        self.send(Fcall::new(tag, body));
    }

    /// Queue a response. One that cannot be encoded within the negotiated
    /// msize is replaced by an `Rerror` for the same tag.
    fn send(&self, fcall: Fcall) {
        let msize = self.negotiation.lock().msize as usize;
        let frame = match encode(&fcall) {
            Ok(frame) if frame.len() <= msize => {
                debug!("<<< {}", fcall);
                Ok(frame)
            }
            Ok(frame) => {
                warn!(
                    "tag {}: {} of {} bytes exceeds msize {}",
                    fcall.tag,
                    fcall.msg_type(),
                    frame.len(),
                    msize
                );
                error_frame(fcall.tag, RESPONSE_TOO_LARGE)
            }
            Err(err) => {
                warn!("cannot encode {}: {}", fcall.msg_type(), err);
                error_frame(fcall.tag, &err.to_string())
            }
        };
        match frame {
            Ok(frame) if frame.len() <= msize => {
                if let Some(out) = self.out.lock().as_ref() {
                    let _ = out.send(frame);
                }
            }
            _ => {
                error!("tag {}: no response fits msize {}", fcall.tag, msize);
                self.fail(Error::protocol(format!("cannot answer tag {}", fcall.tag)));
            }
        }
    }

    /// Tear the connection down, keeping the first reason given.
    fn fail(&self, err: Error) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
        drop(fatal);
        self.shutdown.cancel();
    }

    fn close(&self) {
        self.negotiation.lock().state = ConnState::Closed;
        for (_, task) in self.pending.lock().drain() {
            if let Some(task) = task {
                task.abort();
            }
        }
        self.out.lock().take();
    }

    async fn clunk_all(&self) {
        let fids: Vec<_> = self.fids.lock().drain().collect();
        for (fid, entry) in fids {
            if let Err(err) = self.fs.clunk(&entry.handle).await {
                debug!("implicit clunk of fid {}: {}", fid, err);
            }
        }
    }

    async fn dispatch(&self, body: Msg) -> std::result::Result<Msg, FsError> {
        match body {
            Msg::Tauth { afid, uname, aname } => {
                self.ensure_unused(afid)?;
                let (aqid, handle) = self.fs.auth(&uname, &aname).await?;
                self.bind(afid, FidEntry::new(handle, aqid).opened(ORDWR))?;
                Ok(Msg::Rauth { aqid })
            }
            Msg::Tattach {
                fid,
                afid,
                uname,
                aname,
            } => {
                self.ensure_unused(fid)?;
                let auth = if afid == NOFID {
                    None
                } else {
                    let entry = self.lookup(afid)?;
                    if !entry.qid.type_.contains(QidType::AUTH) {
                        return Err(FsError::new("afid is not an authentication fid"));
                    }
                    Some(entry)
                };
                let auth_handle = auth.as_ref().map(|entry| entry.handle.as_ref());
                let (qid, handle) = self.fs.attach(auth_handle, &uname, &aname).await?;
                self.bind(fid, FidEntry::new(handle, qid))?;
                let mut negotiation = self.negotiation.lock();
                if negotiation.state == ConnState::Versioned {
                    negotiation.state = ConnState::Attached;
                }
                Ok(Msg::Rattach { qid })
            }
            Msg::Twalk { fid, newfid, wname } => self.walk(fid, newfid, wname).await,
            Msg::Topen { fid, mode } => {
                let entry = self.lookup(fid)?;
                if entry.mode.is_some() {
                    return Err(FsError::new(FID_OPEN));
                }
                let qid = self.fs.open(&entry.handle, mode).await?;
                self.replace(
                    fid,
                    FidEntry {
                        handle: entry.handle,
                        qid,
                        mode: Some(mode),
                    },
                )?;
                Ok(Msg::Ropen {
                    qid,
                    iounit: self.iounit(),
                })
            }
            Msg::Tcreate {
                fid,
                name,
                perm,
                mode,
            } => {
                let entry = self.lookup(fid)?;
                if entry.mode.is_some() {
                    return Err(FsError::new(FID_OPEN));
                }
                if !entry.qid.is_dir() {
                    return Err(FsError::new("not a directory"));
                }
                if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                    return Err(FsError::new(format!("illegal name '{}'", name)));
                }
                let (qid, handle) = self.fs.create(&entry.handle, &name, perm, mode).await?;
                self.replace(fid, FidEntry::new(handle, qid).opened(mode))?;
                Ok(Msg::Rcreate {
                    qid,
                    iounit: self.iounit(),
                })
            }
            Msg::Tread { fid, offset, count } => {
                let entry = self.lookup(fid)?;
                if !entry.mode.is_some_and(readable) {
                    return Err(FsError::new("fid not open for reading"));
                }
                let count = count.min(self.iounit());
                let mut data = self.fs.read(&entry.handle, offset, count).await?;
                if data.len() > count as usize {
                    warn!("fid {}: backend returned {} bytes for count {}", fid, data.len(), count);
                    data.truncate(count as usize);
                }
                Ok(Msg::Rread { data })
            }
            Msg::Twrite { fid, offset, data } => {
                let entry = self.lookup(fid)?;
                if !entry.mode.is_some_and(writable) {
                    return Err(FsError::new("fid not open for writing"));
                }
                let count = self.fs.write(&entry.handle, offset, &data).await?;
                Ok(Msg::Rwrite {
                    count: count.min(data.len() as u32),
                })
            }
            Msg::Tclunk { fid } => {
                let entry = self.unbind(fid)?;
                if entry.mode.is_some_and(|mode| mode & ORCLOSE != 0) {
                    self.fs.remove(&entry.handle).await?;
                } else {
                    self.fs.clunk(&entry.handle).await?;
                }
                Ok(Msg::Rclunk)
            }
            Msg::Tremove { fid } => {
                // the fid is gone whether or not the remove succeeds
                let entry = self.unbind(fid)?;
                self.fs.remove(&entry.handle).await?;
                Ok(Msg::Rremove)
            }
            Msg::Tstat { fid } => {
                let entry = self.lookup(fid)?;
                let dir = self.fs.stat(&entry.handle).await?;
                let stat = dir.encode().map_err(|err| FsError::new(err.to_string()))?;
                Ok(Msg::Rstat { stat })
            }
            Msg::Twstat { fid, stat } => {
                let entry = self.lookup(fid)?;
                let dir = Dir::decode(&stat).map_err(|_| FsError::new("malformed stat"))?;
                self.fs.wstat(&entry.handle, &dir).await?;
                Ok(Msg::Rwstat)
            }
            other => Err(FsError::new(format!(
                "unexpected {} request",
                other.msg_type()
            ))),
        }
    }

    async fn walk(
        &self,
        fid: u32,
        newfid: u32,
        wname: Vec<String>,
    ) -> std::result::Result<Msg, FsError> {
        let entry = self.lookup(fid)?;
        if entry.mode.is_some() {
            return Err(FsError::new("cannot walk an open fid"));
        }
        if newfid != fid {
            self.ensure_unused(newfid)?;
        }

        let walked = self.fs.walk(&entry.handle, &wname).await?;
        if walked.qids.len() > wname.len() {
            return Err(FsError::new("walk resolved more elements than requested"));
        }
        if !wname.is_empty() && walked.qids.is_empty() {
            return Err(FsError::not_found());
        }
        if walked.qids.len() == wname.len() {
            let handle = walked
                .handle
                .ok_or_else(|| FsError::new("walk resolved without a handle"))?;
            let qid = walked.qids.last().copied().unwrap_or(entry.qid);
            let bound = FidEntry::new(handle, qid);
            if newfid == fid {
                self.replace(fid, bound)?;
            } else {
                self.bind(newfid, bound)?;
            }
        }
        Ok(Msg::Rwalk { wqid: walked.qids })
    }

    fn iounit(&self) -> u32 {
        self.negotiation.lock().msize.saturating_sub(IOHDRSZ)
    }

    fn lookup(&self, fid: u32) -> std::result::Result<FidEntry<F::Handle>, FsError> {
        self.fids
            .lock()
            .get(&fid)
            .cloned()
            .ok_or_else(|| FsError::new(FID_UNKNOWN))
    }

    fn ensure_unused(&self, fid: u32) -> std::result::Result<(), FsError> {
        if self.fids.lock().contains_key(&fid) {
            Err(FsError::new(FID_IN_USE))
        } else {
            Ok(())
        }
    }

    fn bind(&self, fid: u32, entry: FidEntry<F::Handle>) -> std::result::Result<(), FsError> {
        match self.fids.lock().entry(fid) {
            Entry::Occupied(_) => Err(FsError::new(FID_IN_USE)),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Rebind a fid that may have been clunked while the backend was busy.
    fn replace(&self, fid: u32, entry: FidEntry<F::Handle>) -> std::result::Result<(), FsError> {
        match self.fids.lock().get_mut(&fid) {
            Some(slot) => {
                *slot = entry;
                Ok(())
            }
            None => Err(FsError::new(FID_UNKNOWN)),
        }
    }

    fn unbind(&self, fid: u32) -> std::result::Result<FidEntry<F::Handle>, FsError> {
        self.fids
            .lock()
            .remove(&fid)
            .ok_or_else(|| FsError::new(FID_UNKNOWN))
    }
}

fn readable(mode: u8) -> bool {
    matches!(mode & 3, OREAD | ORDWR | OEXEC)
}

fn writable(mode: u8) -> bool {
    matches!(mode & 3, OWRITE | ORDWR)
}

/// Requests whose task may be dropped halfway: none of them changes the
/// fid table.
fn abortable(body: &Msg) -> bool {
    matches!(
        body,
        Msg::Tread { .. } | Msg::Twrite { .. } | Msg::Tstat { .. }
    )
}

fn error_frame(tag: u16, ename: &str) -> std::result::Result<Vec<u8>, EncodeError> {
    let fcall = Fcall::new(tag, Msg::error(ename));
    debug!("<<< {}", fcall);
    encode(&fcall)
}

async fn response_writer<W, F>(
    mut write_half: W,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    conn: Arc<Connection<F>>,
) where
    W: AsyncWrite + Unpin,
    F: Filesystem,
{
    while let Some(frame) = rx.recv().await {
        trace!("write {}", dump_hex(&frame));
        let written = match write_half.write_all(&frame).await {
            Ok(()) => write_half.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            error!("write failed: {}", err);
            conn.fail(err.into());
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_modes() {
        assert!(readable(OREAD));
        assert!(readable(ORDWR | ORCLOSE));
        assert!(readable(OEXEC));
        assert!(!readable(OWRITE));
        assert!(writable(OWRITE | crate::protocol::OTRUNC));
        assert!(writable(ORDWR));
        assert!(!writable(OREAD));
    }
}
