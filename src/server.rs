use std::net::SocketAddr;
use std::sync::Arc;

use log::info;
use tonic::transport::Server;

use crate::dispatch::DfsGateway;
use crate::proto::dfs_service_server::DfsServiceServer;
use crate::registry::HandleRegistry;

/// Serves the gateway on `addr` until the process is stopped. Each inbound
/// call runs as its own task on the runtime's worker pool.
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<HandleRegistry>,
    max_read_size: u32,
) -> Result<(), tonic::transport::Error> {
    let gateway = DfsGateway::new(registry, max_read_size);
    info!("gateway listening on {}", addr);
    Server::builder()
        .add_service(DfsServiceServer::new(gateway))
        .serve(addr)
        .await
}
