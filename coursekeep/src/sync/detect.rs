//! Divergence detection.
//!
//! A local record diverges from the server when it carries an unsynced edit
//! and the server's data has moved away from what the record last saw. A
//! server copy whose timestamp changed but whose data did not is not a
//! conflict.

use std::collections::HashMap;

use super::model::{ConflictRecord, EntityKey, LocalRecord, ServerRecord, VersionSnapshot};

/// Whether `local` conflicts with the server's current `server` copy.
pub fn is_divergent(local: &LocalRecord, server: &VersionSnapshot) -> bool {
    if !local.pending_sync {
        return false;
    }
    // Both sides already agree.
    if local.current.data == server.data {
        return false;
    }
    match &local.server_baseline {
        Some(baseline) => baseline.data != server.data,
        // Never synced: any different server value is a competing edit.
        None => true,
    }
}

/// Conflicts among `local` records, in the order the records were given.
///
/// Records without a server counterpart are not conflicts; they are new
/// local entities.
pub fn detect_divergence(local: &[LocalRecord], server: &[ServerRecord]) -> Vec<ConflictRecord> {
    let by_key: HashMap<&EntityKey, &VersionSnapshot> =
        server.iter().map(|s| (&s.key, &s.snapshot)).collect();

    local
        .iter()
        .filter_map(|record| {
            let server = by_key.get(&record.key)?;
            is_divergent(record, server).then(|| {
                ConflictRecord::new(
                    &record.key,
                    record.entity_name.clone(),
                    record.current.clone(),
                    (*server).clone(),
                )
            })
        })
        .collect()
}
