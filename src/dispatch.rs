use std::sync::Arc;

use log::{info, warn};
use tonic::{Request, Response, Status};

use crate::error::{GatewayError, GatewayResult, HandleKind};
use crate::native::{EntryInfo, OpenMode};
use crate::proto::dfs_service_server::DfsService;
use crate::proto::{
    BoolReply, ClientHandle, ClientRequest, CopyRequest, DfsHandle, FileRequest, FileStatus,
    FileStatusList, InitRequest, LoginRequest, MoveRequest, OpenRequest, PathRequest, ReadReply,
    ReadRequest, RemoveRequest, WriteRequest,
};
use crate::registry::{ConnectTarget, FileHandle, HandleRegistry};

/// Implements each remotely callable operation: resolve handles through the
/// registry, delegate to the native binding, translate the outcome.
pub struct DfsGateway {
    registry: Arc<HandleRegistry>,
    max_read_size: u32,
}

impl DfsGateway {
    pub fn new(registry: Arc<HandleRegistry>, max_read_size: u32) -> Self {
        Self {
            registry,
            max_read_size,
        }
    }

    // A file handle is only valid together with its owning session.
    fn resolve_file(&self, client_id: i64, file_id: i64) -> GatewayResult<Arc<FileHandle>> {
        self.registry.lookup_session(client_id)?;
        let handle = self.registry.lookup_file(file_id)?;
        if handle.owner != client_id {
            warn!(
                "file {} does not belong to session {}",
                file_id, client_id
            );
            return Err(GatewayError::NotFound {
                kind: HandleKind::File,
                id: file_id,
            });
        }
        Ok(handle)
    }
}

fn open_mode(mode: i32) -> GatewayResult<OpenMode> {
    use crate::proto::OpenMode as WireOpenMode;
    match WireOpenMode::try_from(mode) {
        Ok(WireOpenMode::Read) => Ok(OpenMode::Read),
        Ok(WireOpenMode::Write) => Ok(OpenMode::Write),
        Ok(WireOpenMode::ReadWrite) => Ok(OpenMode::ReadWrite),
        _ => Err(GatewayError::InvalidArgument(format!("unknown mode={mode}"))),
    }
}

fn file_status(entry: EntryInfo) -> FileStatus {
    FileStatus {
        length: entry.size,
        isdir: entry.is_dir,
        modification_time: entry.mtime,
        path: entry.path,
    }
}

#[tonic::async_trait]
impl DfsService for DfsGateway {
    /// A failed connect is reported through a negative handle id carrying
    /// the native status code; callers must check the sign.
    async fn init(&self, request: Request<InitRequest>) -> Result<Response<ClientHandle>, Status> {
        let InitRequest { uri } = request.into_inner();
        info!("init: {}", uri);
        let target = ConnectTarget::parse(&uri)?;
        match self.registry.create_session(&target).await {
            Ok(id) => Ok(Response::new(ClientHandle { id })),
            Err(e) => match e.native_code() {
                Some(code) => {
                    warn!("init: connect to {} failed, return code={}", target, code);
                    Ok(Response::new(ClientHandle { id: code as i64 }))
                }
                None => Err(e.into()),
            },
        }
    }

    async fn login(&self, request: Request<LoginRequest>) -> Result<Response<BoolReply>, Status> {
        let LoginRequest {
            client_id,
            user,
            password,
        } = request.into_inner();
        info!("login: session {}, user {}", client_id, user);
        let session = self.registry.lookup_session(client_id)?;
        let client = session.client().await?;
        let ok = match client.login(&user, &password).await {
            Ok(()) => true,
            Err(e) => {
                warn!("login failed for user {}, return code={}", user, e.code);
                false
            }
        };
        Ok(Response::new(BoolReply { ok }))
    }

    async fn logout(&self, request: Request<ClientRequest>) -> Result<Response<BoolReply>, Status> {
        let ClientRequest { client_id } = request.into_inner();
        info!("logout: session {}", client_id);
        let session = self.registry.lookup_session(client_id)?;
        let client = session.client().await?;
        let ok = match client.logout().await {
            Ok(()) => true,
            Err(e) => {
                warn!("logout failed, return code={}", e.code);
                false
            }
        };
        Ok(Response::new(BoolReply { ok }))
    }

    /// Closes every file the session owns, then the session itself. The
    /// session is always removed; partial failure shows up as `false`.
    async fn close_client(
        &self,
        request: Request<ClientRequest>,
    ) -> Result<Response<BoolReply>, Status> {
        let ClientRequest { client_id } = request.into_inner();
        info!("closeClient: session {}", client_id);
        let outcome = self.registry.close_session(client_id).await?;
        for (file_id, err) in &outcome.file_failures {
            warn!(
                "closeClient: failed to close file {}, return code={}",
                file_id, err.code
            );
        }
        if let Err(e) = &outcome.disconnect {
            warn!(
                "closeClient: disconnect for session {} failed, return code={}",
                client_id, e.code
            );
        }
        Ok(Response::new(BoolReply {
            ok: outcome.clean(),
        }))
    }

    async fn list_files(
        &self,
        request: Request<PathRequest>,
    ) -> Result<Response<FileStatusList>, Status> {
        let PathRequest { client_id, path } = request.into_inner();
        info!("listFiles: session {}, path {}", client_id, path);
        let session = self.registry.lookup_session(client_id)?;
        let client = session.client().await?;
        let entries = client
            .list(&path)
            .await
            .map_err(|e| GatewayError::native("listFiles", format!("list for {path} failed"), e))?;
        let statuses = entries.into_iter().map(file_status).collect();
        Ok(Response::new(FileStatusList { statuses }))
    }

    async fn stat(&self, request: Request<PathRequest>) -> Result<Response<FileStatus>, Status> {
        let PathRequest { client_id, path } = request.into_inner();
        info!("stat: session {}, path {}", client_id, path);
        let session = self.registry.lookup_session(client_id)?;
        let client = session.client().await?;
        let entry = client
            .stat(&path)
            .await
            .map_err(|e| GatewayError::native("stat", format!("failed to stat {path}"), e))?;
        Ok(Response::new(file_status(entry)))
    }

    async fn mkdir(&self, request: Request<PathRequest>) -> Result<Response<BoolReply>, Status> {
        let PathRequest { client_id, path } = request.into_inner();
        info!("mkdir: session {}, path {}", client_id, path);
        let session = self.registry.lookup_session(client_id)?;
        let client = session.client().await?;
        client
            .mkdir(&path)
            .await
            .map_err(|e| GatewayError::native("mkdir", format!("failed to create {path}"), e))?;
        Ok(Response::new(BoolReply { ok: true }))
    }

    async fn r#move(&self, request: Request<MoveRequest>) -> Result<Response<BoolReply>, Status> {
        let MoveRequest {
            client_id,
            old_path,
            new_path,
        } = request.into_inner();
        info!("move: session {}, {} -> {}", client_id, old_path, new_path);
        let session = self.registry.lookup_session(client_id)?;
        let client = session.client().await?;
        client.rename(&old_path, &new_path).await.map_err(|e| {
            GatewayError::native(
                "move",
                format!("failed to move {old_path} to {new_path}"),
                e,
            )
        })?;
        Ok(Response::new(BoolReply { ok: true }))
    }

    async fn remove(&self, request: Request<RemoveRequest>) -> Result<Response<BoolReply>, Status> {
        let RemoveRequest {
            client_id,
            path,
            recursive,
        } = request.into_inner();
        // the recursive flag is accepted for interoperability; the native
        // call always recurses
        info!(
            "remove: session {}, path {}, recursive {}",
            client_id, path, recursive
        );
        let session = self.registry.lookup_session(client_id)?;
        let client = session.client().await?;
        client
            .remove(&path)
            .await
            .map_err(|e| GatewayError::native("remove", format!("failed to remove {path}"), e))?;
        Ok(Response::new(BoolReply { ok: true }))
    }

    /// A failed open is reported through a negative file id carrying the
    /// native status code; callers must check the sign.
    async fn open(&self, request: Request<OpenRequest>) -> Result<Response<DfsHandle>, Status> {
        let OpenRequest {
            client_id,
            filename,
            mode,
        } = request.into_inner();
        info!(
            "open: session {}, file {}, mode {}",
            client_id, filename, mode
        );
        let mode = open_mode(mode)?;
        match self.registry.open_file(client_id, &filename, mode).await {
            Ok(id) => Ok(Response::new(DfsHandle { id })),
            Err(e) => match e.native_code() {
                Some(code) => {
                    warn!("open: failed to open {}, return code={}", filename, code);
                    Ok(Response::new(DfsHandle { id: code as i64 }))
                }
                None => Err(e.into()),
            },
        }
    }

    async fn close(&self, request: Request<FileRequest>) -> Result<Response<BoolReply>, Status> {
        let FileRequest { client_id, file_id } = request.into_inner();
        info!("close: session {}, file {}", client_id, file_id);
        self.resolve_file(client_id, file_id)?;
        let ok = match self.registry.close_file(file_id).await {
            Ok(()) => true,
            Err(GatewayError::Native { code, .. }) => {
                warn!("close: file {} close failed, return code={}", file_id, code);
                false
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Response::new(BoolReply { ok }))
    }

    /// `offset >= 0` seeks first, `-1` continues from the current cursor.
    /// End of file is an empty payload with `eof` set, repeatably; an empty
    /// successful reply never means failure.
    async fn read(&self, request: Request<ReadRequest>) -> Result<Response<ReadReply>, Status> {
        let ReadRequest {
            client_id,
            file_id,
            offset,
            len,
        } = request.into_inner();
        info!("read: file {}, offset {}, len {}", file_id, offset, len);
        if len < 0 {
            return Err(GatewayError::InvalidArgument(format!("negative read length {len}")).into());
        }
        let handle = self.resolve_file(client_id, file_id)?;
        let mut file = handle.file().await?;
        if offset >= 0 {
            file.seek(offset as u64).await.map_err(|e| {
                GatewayError::native("read", format!("failed to seek to offset {offset}"), e)
            })?;
        }
        let len = (len as u64).min(self.max_read_size as u64) as usize;
        let data = file
            .read(len)
            .await
            .map_err(|e| GatewayError::native("read", "read failed".to_string(), e))?;
        let eof = data.is_empty() && len > 0;
        if eof {
            info!("read: file {} at end of file", file_id);
        }
        Ok(Response::new(ReadReply { data, eof }))
    }

    async fn write(&self, request: Request<WriteRequest>) -> Result<Response<BoolReply>, Status> {
        let WriteRequest {
            client_id,
            file_id,
            data,
            offset,
            len,
        } = request.into_inner();
        info!(
            "write: file {}, offset {}, len {}, payload {} bytes",
            file_id,
            offset,
            len,
            data.len()
        );
        if len < 0 || len as usize > data.len() {
            return Err(GatewayError::InvalidArgument(format!(
                "write length {} exceeds payload of {} bytes",
                len,
                data.len()
            ))
            .into());
        }
        let handle = self.resolve_file(client_id, file_id)?;
        let mut file = handle.file().await?;
        if offset >= 0 {
            file.seek(offset as u64).await.map_err(|e| {
                GatewayError::native("write", format!("failed to seek to offset {offset}"), e)
            })?;
        }
        file.write(&data[..len as usize])
            .await
            .map_err(|e| GatewayError::native("write", "write failed".to_string(), e))?;
        Ok(Response::new(BoolReply { ok: true }))
    }

    /// Copies an engine file to the gateway host. Borrows any live session
    /// as the ambient connection; the transfer file is never registered.
    async fn copy_to_local_file(
        &self,
        request: Request<CopyRequest>,
    ) -> Result<Response<BoolReply>, Status> {
        let CopyRequest { src, dest } = request.into_inner();
        info!("copyToLocalFile: {} -> {}", src, dest);
        let session = self.registry.any_session()?;
        let client = session.client().await?;
        client.stat(&src).await.map_err(|e| {
            GatewayError::native(
                "copyToLocalFile",
                format!("failed to stat source file {src}"),
                e,
            )
        })?;
        let mut file = client.open(&src, OpenMode::Read).await.map_err(|e| {
            GatewayError::native(
                "copyToLocalFile",
                format!("failed to open source file {src}"),
                e,
            )
        })?;
        let result = file.download(&dest).await;
        if let Err(e) = file.close().await {
            warn!(
                "copyToLocalFile: close after copy failed, return code={}",
                e.code
            );
        }
        result.map_err(|e| {
            GatewayError::native(
                "copyToLocalFile",
                format!("failed to copy {src} to local file {dest}"),
                e,
            )
        })?;
        Ok(Response::new(BoolReply { ok: true }))
    }

    async fn copy_from_local_file(
        &self,
        request: Request<CopyRequest>,
    ) -> Result<Response<BoolReply>, Status> {
        let CopyRequest { src, dest } = request.into_inner();
        info!("copyFromLocalFile: {} -> {}", src, dest);
        let session = self.registry.any_session()?;
        let client = session.client().await?;
        let mut file = client.open(&dest, OpenMode::Write).await.map_err(|e| {
            GatewayError::native(
                "copyFromLocalFile",
                format!("failed to open destination file {dest}"),
                e,
            )
        })?;
        let result = file.upload(&src).await;
        if let Err(e) = file.close().await {
            warn!(
                "copyFromLocalFile: close after copy failed, return code={}",
                e.code
            );
        }
        result.map_err(|e| {
            GatewayError::native(
                "copyFromLocalFile",
                format!("failed to upload source file {src}"),
                e,
            )
        })?;
        Ok(Response::new(BoolReply { ok: true }))
    }
}
