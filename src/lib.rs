pub mod args;
pub mod dispatch;
pub mod error;
pub mod native;
pub mod registry;
pub mod server;

pub mod proto {
    tonic::include_proto!("dfsservice");
}
