#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("connecting to agent {address}: {source}")]
    Connect { address: String, source: tonic::transport::Error },
    #[error("RPC to agent {address} failed: {source}")]
    Rpc { address: String, source: Box<tonic::Status> },
    #[error("opening rolling store {path}: {source}")]
    StoreOpen { path: String, source: rusqlite::Error },
    #[error("rolling store operation failed: {0}")]
    Store(#[from] rusqlite::Error),
}
