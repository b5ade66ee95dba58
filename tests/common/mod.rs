#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use ninefs::protocol::OTRUNC;
use ninefs::{
    Dir, FcallCodec, Filesystem, FsError, Perm, Qid, Server, ServerConfig, Session, SessionConfig, Walked,
    pack_dir_entries,
};

pub const ROOT: u64 = 0;

/// Reads of this file block until [`MemFs::release`] is called.
pub const SLOW: &str = "slow";

/// Reads of this file fail in a way that ends the connection.
pub const BROKEN: &str = "broken";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Node {
    name: String,
    parent: u64,
    perm: Perm,
    version: u32,
    data: Vec<u8>,
}

impl Node {
    fn qid(&self, path: u64) -> Qid {
        Qid::new(path, self.version, self.perm.qid_type())
    }
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<u64, Node>,
    next: u64,
}

impl Tree {
    fn node(&self, path: u64) -> Result<&Node, FsError> {
        self.nodes.get(&path).ok_or_else(FsError::not_found)
    }

    fn child(&self, dir: u64, name: &str) -> Option<u64> {
        self.nodes
            .iter()
            .find(|(path, node)| **path != ROOT && node.parent == dir && node.name == name)
            .map(|(path, _)| *path)
    }

    fn children(&self, dir: u64) -> Vec<u64> {
        self.nodes
            .iter()
            .filter(|(path, node)| **path != ROOT && node.parent == dir)
            .map(|(path, _)| *path)
            .collect()
    }

    fn insert(&mut self, parent: u64, name: &str, perm: Perm, data: &[u8]) -> u64 {
        self.next += 1;
        let path = self.next;
        self.nodes.insert(
            path,
            Node {
                name: name.to_string(),
                parent,
                perm,
                version: 0,
                data: data.to_vec(),
            },
        );
        path
    }

    fn stat(&self, path: u64) -> Result<Dir, FsError> {
        let node = self.node(path)?;
        Ok(Dir {
            qid: node.qid(path),
            mode: node.perm,
            length: if node.perm.contains(Perm::DIR) {
                0
            } else {
                node.data.len() as u64
            },
            name: node.name.clone(),
            uid: "glenda".into(),
            gid: "glenda".into(),
            muid: "glenda".into(),
            ..Default::default()
        })
    }
}

/// An in-memory tree; handles are node numbers.
pub struct MemFs {
    tree: Mutex<Tree>,
    gate: Arc<Notify>,
    hold_clunks: AtomicBool,
    clunk_gate: Notify,
    clunks: AtomicUsize,
}

impl MemFs {
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.nodes.insert(
            ROOT,
            Node {
                name: "/".into(),
                parent: ROOT,
                perm: Perm::DIR | Perm::from_bits_retain(0o755),
                version: 0,
                data: Vec::new(),
            },
        );
        Self {
            tree: Mutex::new(tree),
            gate: Arc::new(Notify::new()),
            hold_clunks: AtomicBool::new(false),
            clunk_gate: Notify::new(),
            clunks: AtomicUsize::new(0),
        }
    }

    /// A tree holding `/hello`, `/lib/profile`, `/slow` and `/broken`.
    pub fn sample() -> Self {
        let fs = Self::new();
        {
            let mut tree = fs.tree.lock();
            let file = Perm::from_bits_retain(0o644);
            tree.insert(ROOT, "hello", file, b"hello, world\n");
            let lib = tree.insert(ROOT, "lib", Perm::DIR | Perm::from_bits_retain(0o755), b"");
            tree.insert(lib, "profile", file, b"bind -a /bin\n");
            tree.insert(ROOT, SLOW, file, b"eventually");
            tree.insert(ROOT, BROKEN, file, b"");
        }
        fs
    }

    /// Let one blocked read of [`SLOW`] finish.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    /// Make clunks wait until [`MemFs::release_clunks`].
    pub fn hold_clunks(&self) {
        self.hold_clunks.store(true, Ordering::SeqCst);
    }

    pub fn release_clunks(&self) {
        self.hold_clunks.store(false, Ordering::SeqCst);
        self.clunk_gate.notify_one();
    }

    /// Clunks the backend has completed.
    pub fn clunks(&self) -> usize {
        self.clunks.load(Ordering::SeqCst)
    }

    pub fn exists(&self, path: &str) -> bool {
        let tree = self.tree.lock();
        let mut at = ROOT;
        for name in path.split('/').filter(|name| !name.is_empty()) {
            match tree.child(at, name) {
                Some(next) => at = next,
                None => return false,
            }
        }
        true
    }
}

#[async_trait]
impl Filesystem for MemFs {
    type Handle = u64;

    async fn attach(
        &self,
        _auth: Option<&u64>,
        _uname: &str,
        aname: &str,
    ) -> Result<(Qid, u64), FsError> {
        if !aname.is_empty() {
            return Err(FsError::new(format!("no such tree '{}'", aname)));
        }
        let tree = self.tree.lock();
        Ok((tree.node(ROOT)?.qid(ROOT), ROOT))
    }

    async fn walk(&self, handle: &u64, names: &[String]) -> Result<Walked<u64>, FsError> {
        let tree = self.tree.lock();
        tree.node(*handle)?;
        let mut at = *handle;
        let mut qids = Vec::new();
        for name in names {
            if !tree.node(at)?.perm.contains(Perm::DIR) {
                break;
            }
            let next = if name == ".." {
                Some(tree.node(at)?.parent)
            } else {
                tree.child(at, name)
            };
            match next {
                Some(next) => {
                    at = next;
                    qids.push(tree.node(at)?.qid(at));
                }
                None => break,
            }
        }
        if qids.len() == names.len() {
            Ok(Walked::complete(qids, at))
        } else {
            Ok(Walked::partial(qids))
        }
    }

    async fn open(&self, handle: &u64, mode: u8) -> Result<Qid, FsError> {
        let mut tree = self.tree.lock();
        let node = tree.nodes.get_mut(handle).ok_or_else(FsError::not_found)?;
        if mode & OTRUNC != 0 && !node.perm.contains(Perm::DIR) {
            node.data.clear();
            node.version += 1;
        }
        Ok(node.qid(*handle))
    }

    async fn create(
        &self,
        dir: &u64,
        name: &str,
        perm: Perm,
        _mode: u8,
    ) -> Result<(Qid, u64), FsError> {
        let mut tree = self.tree.lock();
        if !tree.node(*dir)?.perm.contains(Perm::DIR) {
            return Err(FsError::new("not a directory"));
        }
        if tree.child(*dir, name).is_some() {
            return Err(FsError::new("file already exists"));
        }
        let path = tree.insert(*dir, name, perm, b"");
        Ok((tree.node(path)?.qid(path), path))
    }

    async fn read(&self, handle: &u64, offset: u64, count: u32) -> Result<Vec<u8>, FsError> {
        let name = self.tree.lock().node(*handle)?.name.clone();
        if name == SLOW {
            self.gate.notified().await;
        }
        if name == BROKEN {
            return Err(FsError::Fatal("backing store went away".into()));
        }
        let tree = self.tree.lock();
        let node = tree.node(*handle)?;
        if node.perm.contains(Perm::DIR) {
            let entries = tree
                .children(*handle)
                .into_iter()
                .map(|path| tree.stat(path))
                .collect::<Result<Vec<_>, _>>()?;
            return pack_dir_entries(&entries, offset, count)
                .map_err(|err| FsError::new(err.to_string()));
        }
        let start = (offset as usize).min(node.data.len());
        let end = (start + count as usize).min(node.data.len());
        Ok(node.data[start..end].to_vec())
    }

    async fn write(&self, handle: &u64, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let mut tree = self.tree.lock();
        let node = tree.nodes.get_mut(handle).ok_or_else(FsError::not_found)?;
        let start = offset as usize;
        if node.data.len() < start + data.len() {
            node.data.resize(start + data.len(), 0);
        }
        node.data[start..start + data.len()].copy_from_slice(data);
        node.version += 1;
        Ok(data.len() as u32)
    }

    async fn remove(&self, handle: &u64) -> Result<(), FsError> {
        let mut tree = self.tree.lock();
        if *handle == ROOT {
            return Err(FsError::permission_denied());
        }
        if !tree.children(*handle).is_empty() {
            return Err(FsError::new("directory not empty"));
        }
        tree.nodes.remove(handle).ok_or_else(FsError::not_found)?;
        Ok(())
    }

    async fn clunk(&self, _handle: &u64) -> Result<(), FsError> {
        if self.hold_clunks.load(Ordering::SeqCst) {
            self.clunk_gate.notified().await;
        }
        self.clunks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stat(&self, handle: &u64) -> Result<Dir, FsError> {
        self.tree.lock().stat(*handle)
    }

    async fn wstat(&self, handle: &u64, dir: &Dir) -> Result<(), FsError> {
        let mut tree = self.tree.lock();
        let parent = tree.node(*handle)?.parent;
        if !dir.name.is_empty() {
            if let Some(other) = tree.child(parent, &dir.name) {
                if other != *handle {
                    return Err(FsError::new("file already exists"));
                }
            }
        }
        let node = tree.nodes.get_mut(handle).ok_or_else(FsError::not_found)?;
        if !dir.name.is_empty() {
            node.name = dir.name.clone();
        }
        if dir.length != u64::MAX {
            node.data.resize(dir.length as usize, 0);
            node.version += 1;
        }
        if dir.mode.bits() != u32::MAX {
            let kind = node.perm & Perm::DIR;
            node.perm = kind | Perm::from_bits_retain(dir.mode.bits() & 0o777);
        }
        Ok(())
    }
}

pub type ServeHandle = JoinHandle<ninefs::Result<()>>;

/// Serve [`MemFs::sample`] on one end of an in-memory pipe.
pub fn spawn_server(config: ServerConfig) -> (DuplexStream, Arc<MemFs>, ServeHandle) {
    init_logger();
    let (client, server_io) = tokio::io::duplex(64 * 1024);
    let server = Server::with_config(MemFs::sample(), config);
    let fs = Arc::clone(server.filesystem());
    let handle = tokio::spawn(async move { server.serve(server_io).await });
    (client, fs, handle)
}

/// A client speaking raw frames.
pub fn raw() -> (Framed<DuplexStream, FcallCodec>, Arc<MemFs>, ServeHandle) {
    let (client, fs, handle) = spawn_server(ServerConfig::default());
    (Framed::new(client, FcallCodec::default()), fs, handle)
}

/// A negotiated and attached session.
pub async fn connect() -> (Session, Arc<MemFs>, ServeHandle) {
    let (client, fs, handle) = spawn_server(ServerConfig::default());
    let mut session = Session::new(client, SessionConfig::default());
    session.negotiate().await.expect("negotiate");
    (session, fs, handle)
}
