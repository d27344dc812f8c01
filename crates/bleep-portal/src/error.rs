// PORTAL ERROR TAXONOMY
//
// RejectReason: the action is refused with a `rejected` instruction and the
// rest of the block goes on (bad input, inconsistent reference, failed proof,
// replayed identifier).
//
// PortalError: the block cannot be produced or validated at all. Arithmetic
// overflow, broken ledger invariants and instructions that do not apply to
// the current state are all hard faults.

use crate::params::ParamsError;
use crate::proof::ProofError;
use crate::status::RequestStatus;
use crate::store::StoreError;
use crate::tokens::{ExternalChain, TokenId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("unsupported action schema version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported portal token {0}")]
    UnsupportedToken(TokenId),
    #[error("unsupported collateral token {0}")]
    UnsupportedCollateral(TokenId),
    #[error("no exchange rate for {0}")]
    MissingExchangeRate(TokenId),
    #[error("amount {amount} outside (0, {max}]")]
    InvalidAmount { amount: u64, max: u64 },
    #[error("empty field: {0}")]
    EmptyField(&'static str),
    #[error("fee {paid} below minimum {required}")]
    InsufficientFee { paid: u64, required: u64 },
    #[error("request id {0} already used")]
    DuplicateRequestId(String),
    #[error("request {0} not found")]
    RequestNotFound(String),
    #[error("custodian {0} not found")]
    CustodianNotFound(String),
    #[error("custodian {custodian} has no remote address for {token}")]
    NoRemoteAddress { custodian: String, token: TokenId },
    #[error("{field} mismatch: expected {expected}, got {actual}")]
    Mismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },
    #[error("custodians cannot cover {0}")]
    InsufficientCollateral(u64),
    #[error("free holding cannot cover {0}")]
    InsufficientHolding(u64),
    #[error("free collateral {free} below requested {requested}")]
    InsufficientFreeCollateral { free: u64, requested: u64 },
    #[error("custodian {0} already matched to this request")]
    AlreadyMatched(String),
    #[error("proof required for {0}")]
    ProofRequired(String),
    #[error("proof chain {actual:?} does not serve {expected:?}")]
    WrongChain {
        expected: ExternalChain,
        actual: ExternalChain,
    },
    #[error("external tx {0} already consumed")]
    ExternalTxReplayed(String),
    #[error("proof rejected: {0}")]
    Proof(#[from] ProofError),
    #[error("nothing to pay out")]
    NothingToPay,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortalError {
    #[error("arithmetic overflow in {0}")]
    ArithmeticOverflow(&'static str),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("missing exchange rate for {0}")]
    MissingExchangeRate(TokenId),
    #[error("instruction {kind} does not apply: {reason}")]
    InstructionMismatch { kind: String, reason: String },
    #[error("malformed instruction: {0}")]
    MalformedInstruction(String),
    #[error("unknown instruction kind {0}")]
    UnknownInstructionKind(String),
    #[error("replayed {0}")]
    Replay(String),
    #[error("block {beacon_height} differs from its rebuild: {reason}")]
    BlockMismatch { beacon_height: u64, reason: String },
    #[error("illegal status transition for {key}: {from:?} -> {to:?}")]
    IllegalTransition {
        key: String,
        from: Option<RequestStatus>,
        to: RequestStatus,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("params error: {0}")]
    Params(#[from] ParamsError),
}

impl PortalError {
    pub fn mismatch(kind: impl ToString, reason: impl Into<String>) -> Self {
        PortalError::InstructionMismatch {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }
}

/// Outcome of the build-side checks for one user action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    Reject(RejectReason),
    Fault(PortalError),
}

impl From<RejectReason> for BuildError {
    fn from(reason: RejectReason) -> Self {
        BuildError::Reject(reason)
    }
}

impl From<ProofError> for BuildError {
    fn from(err: ProofError) -> Self {
        BuildError::Reject(RejectReason::Proof(err))
    }
}

impl From<PortalError> for BuildError {
    fn from(err: PortalError) -> Self {
        match err {
            // A user action priced in an asset the oracle does not quote is bad input.
            PortalError::MissingExchangeRate(token) => {
                BuildError::Reject(RejectReason::MissingExchangeRate(token))
            }
            other => BuildError::Fault(other),
        }
    }
}
