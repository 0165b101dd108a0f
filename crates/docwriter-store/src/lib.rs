use thiserror::Error;

mod object;
pub mod paths;
mod status;

pub use object::{get_json, get_string, put_json, FsObjectStore, ObjectStore};
pub use status::StatusStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not authorized: owner '{owner_id}' does not own job '{job_id}'")]
    NotAuthorized { owner_id: String, job_id: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid blob key '{0}': outside the jobs namespace")]
    InvalidKey(String),
    #[error("version conflict on '{key}': expected {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
