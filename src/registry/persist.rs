//! JSON file storage for the endpoint list.

use crate::endpoint::EndpointRecord;

use std::io;
use std::path::Path;
use thiserror::Error;

/// Endpoint store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the file simply does not exist yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

/// Read the endpoint records stored at `path`.
pub fn load_endpoints<P: AsRef<Path>>(path: P) -> Result<Vec<EndpointRecord>, StoreError> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Write `records` to `path`, replacing the previous contents.
pub fn save_endpoints<P: AsRef<Path>>(
    path: P,
    records: &[EndpointRecord],
) -> Result<(), StoreError> {
    let path = path.as_ref();
    let data = serde_json::to_vec_pretty(records)?;

    // replaced atomically
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
