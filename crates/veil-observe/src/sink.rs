use std::sync::{Arc, Mutex};

use crate::record::FinalizedResource;

/// The single point where the core hands resource data outward for
/// storage. Called exactly once per resource.
pub trait ResourceFinalizedSink: Send + Sync {
    fn on_resource_finalized(&self, record: FinalizedResource);
}

#[derive(Debug, Default)]
pub struct NoopSink;

impl ResourceFinalizedSink for NoopSink {
    fn on_resource_finalized(&self, _record: FinalizedResource) {}
}

#[derive(Debug, Default, Clone)]
pub struct VecSink {
    records: Arc<Mutex<Vec<FinalizedResource>>>,
}

impl VecSink {
    pub fn snapshot(&self) -> Vec<FinalizedResource> {
        self.records.lock().expect("sink lock poisoned").clone()
    }
}

impl ResourceFinalizedSink for VecSink {
    fn on_resource_finalized(&self, record: FinalizedResource) {
        self.records
            .lock()
            .expect("sink lock poisoned")
            .push(record);
    }
}
