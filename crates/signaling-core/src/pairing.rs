//! Pairing Resolver
//!
//! Locates both sessions of a caller/callee pair and the pipeline they share.

use crate::errors::{BrokerError, Result};
use crate::registry::{Session, SessionRegistry};
use crate::types::{PipelineId, SessionId};

/// Look up both participants, failing if either is not registered
pub async fn resolve_pair(
    registry: &SessionRegistry,
    caller_id: &SessionId,
    callee_id: &SessionId,
) -> Result<(Session, Session)> {
    let caller = registry
        .lookup(caller_id)
        .await
        .ok_or_else(|| BrokerError::unknown_participant(caller_id))?;
    let callee = registry
        .lookup(callee_id)
        .await
        .ok_or_else(|| BrokerError::unknown_participant(callee_id))?;
    Ok((caller, callee))
}

/// Every pipeline referenced by both sessions
pub fn common_pipelines(a: &Session, b: &Session) -> Vec<PipelineId> {
    a.pipelines
        .iter()
        .filter(|p| b.pipelines.contains(p))
        .cloned()
        .collect()
}

/// The single pipeline shared by `a` and `b`
///
/// `None` when the pair has no call (never established or already torn
/// down). More than one shared pipeline breaks the one-call-per-pair
/// invariant and is reported as [`BrokerError::AmbiguousPipeline`].
pub fn shared_pipeline(a: &Session, b: &Session) -> Result<Option<PipelineId>> {
    let mut shared = common_pipelines(a, b);
    match shared.len() {
        0 => Ok(None),
        1 => Ok(shared.pop()),
        count => Err(BrokerError::AmbiguousPipeline {
            caller: a.id.clone(),
            callee: b.id.clone(),
            count,
        }),
    }
}
