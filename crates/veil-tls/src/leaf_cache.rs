use std::collections::HashMap;
use std::time::SystemTime;

use crate::authority::CertificateRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeafCacheDecision {
    Reuse(CertificateRecord),
    Reissue,
}

/// Host-keyed cache of issued leaf records. Records are reused until their
/// validity window lapses; browsers hard-fail on expired certificates, so
/// an expired record is never served.
#[derive(Debug, Default)]
pub(crate) struct LeafCache {
    entries: HashMap<String, CertificateRecord>,
}

impl LeafCache {
    pub(crate) fn insert(&mut self, record: CertificateRecord) {
        self.entries.insert(record.host.clone(), record);
    }

    pub(crate) fn decision_for_host(&self, host: &str, now: SystemTime) -> LeafCacheDecision {
        let Some(record) = self.entries.get(host) else {
            return LeafCacheDecision::Reissue;
        };

        if record.not_after > now {
            LeafCacheDecision::Reuse(record.clone())
        } else {
            LeafCacheDecision::Reissue
        }
    }
}
