/// REQUEST STATUS BOOK
///
/// Queryable status records per porting ID, redeem ID and originating tx ID.
/// Records are not consensus-critical but the life-cycle they describe is
/// one-directional: a request never returns to an earlier state.

use crate::error::PortalError;
use crate::store::{keys, PortalStore};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    Waiting,
    Accepted,
    Matched,
    Rejected,
    Success,
    Expired,
    Liquidated,
    CancelledByLiquidation,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 8] = [
        RequestStatus::Waiting,
        RequestStatus::Accepted,
        RequestStatus::Matched,
        RequestStatus::Rejected,
        RequestStatus::Success,
        RequestStatus::Expired,
        RequestStatus::Liquidated,
        RequestStatus::CancelledByLiquidation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Waiting => "waiting",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Matched => "matched",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Success => "success",
            RequestStatus::Expired => "expired",
            RequestStatus::Liquidated => "liquidated",
            RequestStatus::CancelledByLiquidation => "cancelled-by-liquidation",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Rejected
                | RequestStatus::Success
                | RequestStatus::Expired
                | RequestStatus::Liquidated
                | RequestStatus::CancelledByLiquidation
        )
    }

    /// Transition table. `None` is "no record yet".
    pub fn can_follow(self, previous: Option<RequestStatus>) -> bool {
        use RequestStatus::*;
        match previous {
            None => matches!(self, Waiting | Accepted | Rejected | Success),
            Some(Waiting) => matches!(
                self,
                Matched | Success | Expired | Liquidated | Rejected | CancelledByLiquidation
            ),
            Some(Accepted) => matches!(self, Success),
            Some(Matched) => matches!(self, Success | Liquidated),
            Some(_) => false,
        }
    }
}

/// Which identifier space a status record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusScope {
    Porting,
    Redeem,
    Tx,
}

impl StatusScope {
    fn prefix(&self) -> &'static [u8] {
        match self {
            StatusScope::Porting => keys::PORTING_STATUS_PREFIX,
            StatusScope::Redeem => keys::REDEEM_STATUS_PREFIX,
            StatusScope::Tx => keys::TX_STATUS_PREFIX,
        }
    }

    pub fn key(&self, id: &str) -> Vec<u8> {
        keys::with_id(self.prefix(), id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: RequestStatus,
    pub beacon_height: u64,
    /// JSON content of the instruction that produced this status
    pub content: String,
}

pub fn read_status(
    store: &dyn PortalStore,
    scope: StatusScope,
    id: &str,
) -> Result<Option<StatusRecord>, PortalError> {
    match store.get(&scope.key(id))? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PortalError::MalformedInstruction(format!("status record {}: {}", id, e))),
        None => Ok(None),
    }
}

/// Record a new status, refusing any transition the table does not allow
pub fn write_status(
    store: &mut dyn PortalStore,
    scope: StatusScope,
    id: &str,
    status: RequestStatus,
    beacon_height: u64,
    content: &str,
) -> Result<(), PortalError> {
    let previous = read_status(&*store, scope, id)?.map(|r| r.status);
    if !status.can_follow(previous) {
        return Err(PortalError::IllegalTransition {
            key: format!("{:?}/{}", scope, id),
            from: previous,
            to: status,
        });
    }
    let record = StatusRecord {
        status,
        beacon_height,
        content: content.to_string(),
    };
    let bytes = serde_json::to_vec(&record)
        .map_err(|e| PortalError::MalformedInstruction(e.to_string()))?;
    store.set(&scope.key(id), bytes)?;
    Ok(())
}
