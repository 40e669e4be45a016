//! Record-collections monitor interface (spec §6, optional consumed
//! collaborator).

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::PlanResult;

/// Notified once per successful DBO execution that touched at least one
/// record type. Supplied by the caller; a no-op if absent (spec §4.7
/// `NotifyRecordCollectionsMonitor`).
#[async_trait]
pub trait RecordCollectionsMonitor: Send + Sync {
    async fn collections_updated(&self, updated_type_names: &HashSet<String>) -> PlanResult<()>;
}
