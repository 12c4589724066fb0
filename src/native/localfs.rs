use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use log::{info, warn};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{
    ERR_CONNECTION, ERR_EXISTS, ERR_IO, ERR_NOT_FOUND, ERR_PERMISSION, EntryInfo, NativeClient,
    NativeConnector, NativeError, NativeFile, NativeResult, OpenMode,
};

/// Built-in filesystem binding backed by a directory on the gateway host.
/// Stands in for an engine client library behind the same trait contract.
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl NativeConnector for LocalConnector {
    async fn connect(&self, host: &str, port: u16) -> NativeResult<Box<dyn NativeClient>> {
        // the engine address is irrelevant to the local binding, but a
        // missing root is the equivalent of an unreachable master
        if !self.root.is_dir() {
            warn!("connect: root directory {:?} is not available", self.root);
            return Err(NativeError::new(ERR_CONNECTION));
        }
        info!("connect: {}:{} served from {:?}", host, port, self.root);
        Ok(Box::new(LocalClient {
            root: self.root.clone(),
        }))
    }
}

struct LocalClient {
    root: PathBuf,
}

impl LocalClient {
    fn resolve(&self, path: &str) -> NativeResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                // anything pointing back out of the served root is rejected
                _ => {
                    warn!("path {:?} escapes the served root", path);
                    return Err(NativeError::new(ERR_PERMISSION));
                }
            }
        }
        Ok(resolved)
    }
}

fn io_error(e: &std::io::Error) -> NativeError {
    let code = match e.kind() {
        std::io::ErrorKind::NotFound => ERR_NOT_FOUND,
        std::io::ErrorKind::PermissionDenied => ERR_PERMISSION,
        std::io::ErrorKind::AlreadyExists => ERR_EXISTS,
        _ => ERR_IO,
    };
    NativeError::new(code)
}

fn entry_info(wire_path: String, metadata: &std::fs::Metadata) -> EntryInfo {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    EntryInfo {
        path: wire_path,
        size: metadata.len() as i64,
        is_dir: metadata.is_dir(),
        mtime,
    }
}

fn child_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[async_trait]
impl NativeClient for LocalClient {
    async fn login(&self, user: &str, _password: &str) -> NativeResult<()> {
        // no engine-side account check in the local binding
        info!("login: user {}", user);
        Ok(())
    }

    async fn logout(&self) -> NativeResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> NativeResult<()> {
        Ok(())
    }

    async fn list(&self, path: &str) -> NativeResult<Vec<EntryInfo>> {
        let dir = self.resolve(path)?;
        let mut read_dir = fs::read_dir(&dir).await.map_err(|e| io_error(&e))?;
        let mut entries = Vec::new();
        loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().to_string();
                    match entry.metadata().await {
                        Ok(metadata) => {
                            entries.push(entry_info(child_path(path, &name), &metadata));
                        }
                        Err(e) => warn!("list: failed to stat {}: {}", name, e),
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(io_error(&e)),
            }
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> NativeResult<EntryInfo> {
        let resolved = self.resolve(path)?;
        let metadata = fs::metadata(&resolved).await.map_err(|e| io_error(&e))?;
        Ok(entry_info(path.to_string(), &metadata))
    }

    async fn mkdir(&self, path: &str) -> NativeResult<()> {
        let resolved = self.resolve(path)?;
        // nested paths create the intermediate directories as well
        fs::create_dir_all(&resolved).await.map_err(|e| io_error(&e))
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> NativeResult<()> {
        let from = self.resolve(old_path)?;
        let to = self.resolve(new_path)?;
        fs::rename(&from, &to).await.map_err(|e| io_error(&e))
    }

    async fn remove(&self, path: &str) -> NativeResult<()> {
        let resolved = self.resolve(path)?;
        let metadata = fs::metadata(&resolved).await.map_err(|e| io_error(&e))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&resolved).await.map_err(|e| io_error(&e))
        } else {
            fs::remove_file(&resolved).await.map_err(|e| io_error(&e))
        }
    }

    async fn open(&self, path: &str, mode: OpenMode) -> NativeResult<Box<dyn NativeFile>> {
        let resolved = self.resolve(path)?;
        let mut options = fs::OpenOptions::new();
        match mode {
            OpenMode::Read => {
                options.read(true);
            }
            OpenMode::Write => {
                // write mode completely overwrites an existing file
                options.write(true).create(true).truncate(true);
            }
            OpenMode::ReadWrite => {
                // read-write keeps existing content for in-place updates
                options.read(true).write(true).create(true);
            }
        }
        match options.open(&resolved).await {
            Ok(file) => Ok(Box::new(LocalFile {
                file,
                path: resolved,
            })),
            Err(e) => {
                warn!("open: failed to open {:?}: {}", resolved, e);
                Err(io_error(&e))
            }
        }
    }
}

struct LocalFile {
    file: fs::File,
    path: PathBuf,
}

#[async_trait]
impl NativeFile for LocalFile {
    async fn seek(&mut self, offset: u64) -> NativeResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map(|_| ())
            .map_err(|e| io_error(&e))
    }

    async fn read(&mut self, len: usize) -> NativeResult<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        let bytes_read = self.file.read(&mut buffer).await.map_err(|e| io_error(&e))?;
        buffer.truncate(bytes_read);
        Ok(buffer)
    }

    async fn write(&mut self, data: &[u8]) -> NativeResult<usize> {
        self.file.write_all(data).await.map_err(|e| io_error(&e))?;
        self.file.flush().await.map_err(|e| io_error(&e))?;
        Ok(data.len())
    }

    async fn download(&mut self, local_path: &str) -> NativeResult<()> {
        let mut dest = fs::File::create(local_path).await.map_err(|e| io_error(&e))?;
        self.file
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|e| io_error(&e))?;
        tokio::io::copy(&mut self.file, &mut dest)
            .await
            .map_err(|e| io_error(&e))?;
        dest.flush().await.map_err(|e| io_error(&e))
    }

    async fn upload(&mut self, local_path: &str) -> NativeResult<()> {
        let mut src = fs::File::open(local_path).await.map_err(|e| io_error(&e))?;
        tokio::io::copy(&mut src, &mut self.file)
            .await
            .map_err(|e| io_error(&e))?;
        self.file.flush().await.map_err(|e| io_error(&e))
    }

    async fn close(&mut self) -> NativeResult<()> {
        // tokio files flush on drop without reporting; surface it here instead
        info!("close: {:?}", self.path);
        self.file.flush().await.map_err(|e| io_error(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(root: &Path) -> LocalClient {
        LocalClient {
            root: root.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn mkdir_creates_nested_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let client = client(tmp.path());
        client.mkdir("/a/b/c").await.unwrap();
        let stat = client.stat("/a/b/c").await.unwrap();
        assert!(stat.is_dir);
    }

    #[tokio::test]
    async fn list_reports_children_with_wire_paths() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/a.txt"), b"abc").unwrap();
        let client = client(tmp.path());
        let entries = client.list("/sub").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/sub/a.txt");
        assert_eq!(entries[0].size, 3);
        assert!(!entries[0].is_dir);
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let client = client(tmp.path());
        let err = client.stat("/../etc/passwd").await.unwrap_err();
        assert_eq!(err.code, ERR_PERMISSION);
    }

    #[tokio::test]
    async fn remove_recurses_into_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("d/e")).unwrap();
        std::fs::write(tmp.path().join("d/e/f.txt"), b"x").unwrap();
        let client = client(tmp.path());
        client.remove("/d").await.unwrap();
        let err = client.stat("/d").await.unwrap_err();
        assert_eq!(err.code, ERR_NOT_FOUND);
    }

    #[tokio::test]
    async fn write_mode_overwrites_existing_content() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.txt"), b"a much longer payload").unwrap();
        let client = client(tmp.path());
        let mut file = client.open("/x.txt", OpenMode::Write).await.unwrap();
        file.write(b"short").await.unwrap();
        file.close().await.unwrap();
        // no stale bytes from the previous content survive
        assert_eq!(std::fs::read(tmp.path().join("x.txt")).unwrap(), b"short");
    }

    #[tokio::test]
    async fn read_past_end_is_empty_and_repeatable() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.txt"), b"hi").unwrap();
        let client = client(tmp.path());
        let mut file = client.open("/x.txt", OpenMode::Read).await.unwrap();
        assert_eq!(file.read(16).await.unwrap(), b"hi");
        assert!(file.read(16).await.unwrap().is_empty());
        assert!(file.read(16).await.unwrap().is_empty());
        file.close().await.unwrap();
    }
}
