use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use tokio::sync::{MappedMutexGuard, MutexGuard, RwLockReadGuard};

use crate::error::{GatewayError, GatewayResult, HandleKind};
use crate::native::{NativeClient, NativeConnector, NativeError, NativeFile, OpenMode};

pub type SessionId = i64;
pub type FileId = i64;

/// Address of the filesystem engine's master, parsed from the connection
/// target string handed to `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// Accepts "scheme://host:port" or bare "host:port".
    pub fn parse(uri: &str) -> GatewayResult<Self> {
        let rest = match uri.split_once("://") {
            Some((scheme, rest)) => {
                if scheme.is_empty() {
                    return Err(GatewayError::InvalidArgument(format!(
                        "malformed connection target {uri:?}"
                    )));
                }
                rest
            }
            None => uri,
        };
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
            GatewayError::InvalidArgument(format!("connection target {uri:?} has no port"))
        })?;
        if host.is_empty() {
            return Err(GatewayError::InvalidArgument(format!(
                "connection target {uri:?} has no host"
            )));
        }
        let port = port.parse::<u16>().map_err(|_| {
            GatewayError::InvalidArgument(format!("bad port in connection target {uri:?}"))
        })?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One authenticated connection to the engine, plus the set of files opened
/// through it.
pub struct Session {
    pub id: SessionId,
    // Operations take the read lock and may run concurrently; teardown takes
    // the write lock and takes the client out, so the native connection is
    // released exactly once and never under an in-flight call.
    client: tokio::sync::RwLock<Option<Box<dyn NativeClient>>>,
    files: Mutex<FileSet>,
}

// The `closed` flag lives under the same mutex as the id set so that file
// registration cannot interleave with session teardown.
struct FileSet {
    closed: bool,
    ids: HashSet<FileId>,
}

impl Session {
    fn new(id: SessionId, client: Box<dyn NativeClient>) -> Self {
        Self {
            id,
            client: tokio::sync::RwLock::new(Some(client)),
            files: Mutex::new(FileSet {
                closed: false,
                ids: HashSet::new(),
            }),
        }
    }

    /// Borrows the native client for the duration of one native call. Fails
    /// if the session was torn down after the caller looked it up.
    pub async fn client(&self) -> GatewayResult<RwLockReadGuard<'_, dyn NativeClient>> {
        let guard = self.client.read().await;
        RwLockReadGuard::try_map(guard, |c| c.as_deref()).map_err(|_| GatewayError::NotFound {
            kind: HandleKind::Session,
            id: self.id,
        })
    }
}

/// One open file, reachable through the global file index and its owner's
/// file set.
pub struct FileHandle {
    pub id: FileId,
    pub owner: SessionId,
    pub path: String,
    // Same discipline as Session::client: I/O holds the lock (the native
    // file carries a seek cursor), close takes the file out under it.
    file: tokio::sync::Mutex<Option<Box<dyn NativeFile>>>,
}

impl FileHandle {
    fn new(id: FileId, owner: SessionId, path: &str, native: Box<dyn NativeFile>) -> Self {
        Self {
            id,
            owner,
            path: path.to_string(),
            file: tokio::sync::Mutex::new(Some(native)),
        }
    }

    /// Borrows the native file for one read/write/seek sequence.
    pub async fn file(&self) -> GatewayResult<MappedMutexGuard<'_, dyn NativeFile>> {
        let guard = self.file.lock().await;
        MutexGuard::try_map(guard, |f| f.as_deref_mut()).map_err(|_| GatewayError::NotFound {
            kind: HandleKind::File,
            id: self.id,
        })
    }
}

/// Result of tearing down a session: closing continues past individual file
/// failures, and everything that went wrong is reported together.
pub struct SessionCloseOutcome {
    pub file_failures: Vec<(FileId, NativeError)>,
    pub disconnect: Result<(), NativeError>,
}

impl SessionCloseOutcome {
    pub fn clean(&self) -> bool {
        self.file_failures.is_empty() && self.disconnect.is_ok()
    }
}

/// In-memory index of live sessions and open files. All registry state is
/// lost on restart; clients reconnect and re-authenticate.
pub struct HandleRegistry {
    connector: Box<dyn NativeConnector>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    files: RwLock<HashMap<FileId, Arc<FileHandle>>>,
    next_session_id: AtomicI64,
    next_file_id: AtomicI64,
}

impl HandleRegistry {
    pub fn new(connector: Box<dyn NativeConnector>) -> Self {
        // counters start at wall-clock seconds: unique for the process
        // lifetime, not across restarts
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(1);
        Self {
            connector,
            sessions: RwLock::new(HashMap::new()),
            files: RwLock::new(HashMap::new()),
            next_session_id: AtomicI64::new(seed),
            next_file_id: AtomicI64::new(seed),
        }
    }

    /// Connects to the engine and registers a session. The id is burned on
    /// every attempt whether or not the connect succeeds; nothing is
    /// registered on failure.
    pub async fn create_session(&self, target: &ConnectTarget) -> GatewayResult<SessionId> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let client = self
            .connector
            .connect(&target.host, target.port)
            .await
            .map_err(|e| GatewayError::native("init", format!("connect to {target} failed"), e))?;
        let session = Arc::new(Session::new(id, client));
        self.sessions.write().unwrap().insert(id, session);
        info!("opened client session {}", id);
        Ok(id)
    }

    pub fn lookup_session(&self, id: SessionId) -> GatewayResult<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(GatewayError::NotFound {
                kind: HandleKind::Session,
                id,
            })
    }

    pub fn lookup_file(&self, id: FileId) -> GatewayResult<Arc<FileHandle>> {
        self.files
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(GatewayError::NotFound {
                kind: HandleKind::File,
                id,
            })
    }

    /// Any live session, used as the ambient connection by the bulk copy
    /// operations, which carry no handle of their own.
    pub fn any_session(&self) -> GatewayResult<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .next()
            .cloned()
            .ok_or(GatewayError::NoSession)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn file_count(&self) -> usize {
        self.files.read().unwrap().len()
    }

    /// Opens a file under `session_id`. The file id becomes visible in the
    /// global index and the owner's set only once the native open has
    /// succeeded, and never under a session that is being torn down.
    pub async fn open_file(
        &self,
        session_id: SessionId,
        path: &str,
        mode: OpenMode,
    ) -> GatewayResult<FileId> {
        let session = self.lookup_session(session_id)?;
        let id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let mut native = {
            let client = session.client().await?;
            client
                .open(path, mode)
                .await
                .map_err(|e| GatewayError::native("open", format!("failed to open {path}"), e))?
        };
        {
            let mut files = session.files.lock().unwrap();
            if !files.closed {
                files.ids.insert(id);
                let handle = Arc::new(FileHandle::new(id, session_id, path, native));
                self.files.write().unwrap().insert(id, handle);
                info!("opened file {} for session {} ({})", id, session_id, path);
                return Ok(id);
            }
        }
        // the session was torn down while the native open was in flight;
        // roll back rather than register an orphan
        if let Err(e) = native.close().await {
            warn!(
                "open: session {} closed mid-open, file close failed, return code={}",
                session_id, e.code
            );
        }
        Err(GatewayError::NotFound {
            kind: HandleKind::Session,
            id: session_id,
        })
    }

    /// Removes the file from both indexes, then releases the native resource
    /// exactly once. A concurrent close loses the map removal and reports
    /// the handle as unknown.
    pub async fn close_file(&self, id: FileId) -> GatewayResult<()> {
        let handle = {
            let mut files = self.files.write().unwrap();
            files.remove(&id).ok_or(GatewayError::NotFound {
                kind: HandleKind::File,
                id,
            })?
        };
        if let Ok(session) = self.lookup_session(handle.owner) {
            session.files.lock().unwrap().ids.remove(&id);
        }
        info!("closed file {} ({})", id, handle.path);
        Self::release_file(&handle)
            .await
            .map_err(|e| GatewayError::native("close", format!("failed to close file {id}"), e))
    }

    /// Unlinks the session, closes every owned file best-effort, then
    /// releases the native connection. The session is gone from the registry
    /// regardless of how much of that failed.
    pub async fn close_session(&self, id: SessionId) -> GatewayResult<SessionCloseOutcome> {
        // unlink first so no concurrent lookup can see a session mid-teardown
        let session = {
            let mut sessions = self.sessions.write().unwrap();
            sessions.remove(&id).ok_or(GatewayError::NotFound {
                kind: HandleKind::Session,
                id,
            })?
        };
        // freeze the file set; open_file calls racing this point roll back
        let owned: Vec<FileId> = {
            let mut files = session.files.lock().unwrap();
            files.closed = true;
            files.ids.drain().collect()
        };
        let mut file_failures = Vec::new();
        for file_id in owned {
            let handle = self.files.write().unwrap().remove(&file_id);
            // raced an explicit close on the same file
            let Some(handle) = handle else { continue };
            if let Err(e) = Self::release_file(&handle).await {
                file_failures.push((file_id, e));
            }
        }
        // the write lock waits out in-flight native calls on this session
        let client = session.client.write().await.take();
        let disconnect = match client {
            Some(client) => client.disconnect().await,
            None => Ok(()),
        };
        info!("closed client session {}", id);
        Ok(SessionCloseOutcome {
            file_failures,
            disconnect,
        })
    }

    async fn release_file(handle: &FileHandle) -> Result<(), NativeError> {
        // waits out in-flight reads and writes on this handle
        let mut guard = handle.file.lock().await;
        match guard.take() {
            Some(mut native) => native.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::localfs::LocalConnector;

    fn registry(root: &std::path::Path) -> HandleRegistry {
        HandleRegistry::new(Box::new(LocalConnector::new(root.to_path_buf())))
    }

    fn target() -> ConnectTarget {
        ConnectTarget::parse("dfs://localhost:6000").unwrap()
    }

    #[test]
    fn connect_target_parsing() {
        let t = ConnectTarget::parse("dfs://master:6000").unwrap();
        assert_eq!(t.host, "master");
        assert_eq!(t.port, 6000);
        assert_eq!(ConnectTarget::parse("master:6000").unwrap(), t);

        for bad in ["", "master", "://master:6000", "dfs://:6000", "dfs://master:x"] {
            assert!(matches!(
                ConnectTarget::parse(bad),
                Err(GatewayError::InvalidArgument(_))
            ));
        }
    }

    #[tokio::test]
    async fn session_and_file_ids_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.txt"), b"x").unwrap();
        let registry = registry(tmp.path());

        let a = registry.create_session(&target()).await.unwrap();
        let b = registry.create_session(&target()).await.unwrap();
        assert_ne!(a, b);

        let f1 = registry.open_file(a, "/x.txt", OpenMode::Read).await.unwrap();
        let f2 = registry.open_file(b, "/x.txt", OpenMode::Read).await.unwrap();
        assert_ne!(f1, f2);
    }

    #[tokio::test]
    async fn closed_file_is_unreachable() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.txt"), b"x").unwrap();
        let registry = registry(tmp.path());
        let session = registry.create_session(&target()).await.unwrap();

        let file = registry
            .open_file(session, "/x.txt", OpenMode::Read)
            .await
            .unwrap();
        registry.close_file(file).await.unwrap();

        assert!(matches!(
            registry.lookup_file(file),
            Err(GatewayError::NotFound { .. })
        ));
        // second close finds nothing to release
        assert!(matches!(
            registry.close_file(file).await,
            Err(GatewayError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn close_session_closes_owned_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.txt"), b"x").unwrap();
        std::fs::write(tmp.path().join("y.txt"), b"y").unwrap();
        let registry = registry(tmp.path());
        let session = registry.create_session(&target()).await.unwrap();

        let f1 = registry
            .open_file(session, "/x.txt", OpenMode::Read)
            .await
            .unwrap();
        let f2 = registry
            .open_file(session, "/y.txt", OpenMode::Read)
            .await
            .unwrap();

        let outcome = registry.close_session(session).await.unwrap();
        assert!(outcome.clean());
        assert_eq!(registry.file_count(), 0);
        for id in [f1, f2] {
            assert!(matches!(
                registry.lookup_file(id),
                Err(GatewayError::NotFound { .. })
            ));
        }
        assert!(matches!(
            registry.lookup_session(session),
            Err(GatewayError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_handles_report_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        let session = registry.create_session(&target()).await.unwrap();

        assert!(matches!(
            registry.lookup_session(session + 1000),
            Err(GatewayError::NotFound { .. })
        ));
        assert!(matches!(
            registry.lookup_file(12345),
            Err(GatewayError::NotFound { .. })
        ));

        // a failed close must not disturb live sessions
        assert!(matches!(
            registry.close_session(session + 1000).await,
            Err(GatewayError::NotFound { .. })
        ));
        assert_eq!(registry.session_count(), 1);
        assert!(registry.lookup_session(session).is_ok());
    }

    #[tokio::test]
    async fn open_on_closed_session_fails() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.txt"), b"x").unwrap();
        let registry = registry(tmp.path());
        let session = registry.create_session(&target()).await.unwrap();
        registry.close_session(session).await.unwrap();

        assert!(matches!(
            registry.open_file(session, "/x.txt", OpenMode::Read).await,
            Err(GatewayError::NotFound { .. })
        ));
        assert_eq!(registry.file_count(), 0);
    }

    #[tokio::test]
    async fn failed_connect_registers_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("gone");
        let registry = registry(&missing);

        let err = registry.create_session(&target()).await.unwrap_err();
        assert_eq!(err.native_code(), Some(crate::native::ERR_CONNECTION));
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_opens_and_closes_are_safe() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.txt"), b"x").unwrap();
        let registry = Arc::new(registry(tmp.path()));
        let session = registry.create_session(&target()).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let id = registry
                    .open_file(session, "/x.txt", OpenMode::Read)
                    .await
                    .unwrap();
                registry.close_file(id).await.unwrap();
                id
            }));
        }

        let mut ids = HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap());
        }
        assert_eq!(ids.len(), 100);
        assert_eq!(registry.file_count(), 0);

        let outcome = registry.close_session(session).await.unwrap();
        assert!(outcome.clean());
    }
}
