pub mod localfs;

use async_trait::async_trait;
use thiserror::Error;

// Failure codes in the native client's error space. Every failed native
// operation reports exactly one of these; all of them are negative.
pub const ERR_UNKNOWN: i32 = -1;
pub const ERR_CONNECTION: i32 = -2;
pub const ERR_NOT_FOUND: i32 = -101;
pub const ERR_PERMISSION: i32 = -102;
pub const ERR_EXISTS: i32 = -103;
pub const ERR_IO: i32 = -104;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("return code={code}")]
pub struct NativeError {
    pub code: i32,
}

impl NativeError {
    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

pub type NativeResult<T> = Result<T, NativeError>;

/// Metadata projection returned by `list` and `stat`.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub path: String,
    pub size: i64,
    pub is_dir: bool,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

/// Connection factory for a filesystem engine.
#[async_trait]
pub trait NativeConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> NativeResult<Box<dyn NativeClient>>;
}

/// One live connection to the engine.
#[async_trait]
pub trait NativeClient: Send + Sync {
    async fn login(&self, user: &str, password: &str) -> NativeResult<()>;
    async fn logout(&self) -> NativeResult<()>;
    async fn disconnect(&self) -> NativeResult<()>;
    async fn list(&self, path: &str) -> NativeResult<Vec<EntryInfo>>;
    async fn stat(&self, path: &str) -> NativeResult<EntryInfo>;
    async fn mkdir(&self, path: &str) -> NativeResult<()>;
    async fn rename(&self, old_path: &str, new_path: &str) -> NativeResult<()>;
    async fn remove(&self, path: &str) -> NativeResult<()>;
    async fn open(&self, path: &str, mode: OpenMode) -> NativeResult<Box<dyn NativeFile>>;
}

/// One open file. The file carries a seek cursor, so all I/O takes
/// `&mut self`.
#[async_trait]
pub trait NativeFile: Send {
    async fn seek(&mut self, offset: u64) -> NativeResult<()>;
    /// Reads up to `len` bytes from the cursor. An empty buffer means end of
    /// file.
    async fn read(&mut self, len: usize) -> NativeResult<Vec<u8>>;
    async fn write(&mut self, data: &[u8]) -> NativeResult<usize>;
    async fn download(&mut self, local_path: &str) -> NativeResult<()>;
    async fn upload(&mut self, local_path: &str) -> NativeResult<()>;
    async fn close(&mut self) -> NativeResult<()>;
}
