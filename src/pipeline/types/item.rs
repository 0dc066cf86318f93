use super::region::BoundingRegion;
use std::sync::Arc;
use uuid::Uuid;

/// One user-submitted scanned image carried through the pipeline.
///
/// The raster bytes are shared read-only: the sequencer, the remote
/// boundary and the verification channel all read the same allocation.
/// The item itself is owned exclusively by its sequencer for the run.
#[derive(Debug, Clone)]
pub struct ScanItem {
    pub id: Uuid,
    pub file_name: Option<String>,
    pub bytes: Arc<Vec<u8>>,
    pub mime: String,
    /// Empty until the detect stage completes.
    pub regions: Vec<BoundingRegion>,
}

impl ScanItem {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: None,
            bytes: Arc::new(bytes),
            mime: mime.into(),
            regions: Vec::new(),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}
