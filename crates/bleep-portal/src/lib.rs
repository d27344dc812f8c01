/// BLEEP PORTAL: COLLATERAL CUSTODY & LIQUIDATION
///
/// Custodians lock collateral (the native coin plus third-party tokens) to
/// back portal tokens minted against assets on external chains. This crate
/// implements the portal's per-block state machine:
/// - Porting (mint) requests matched to custodians and completed by proof
/// - Redeem (burn) requests matched to custodians and settled by proof
/// - Run-away and ratio-driven liquidation of custodian collateral
/// - Topup, withdrawal, liquidation-pool claims and custodian rewards
///
/// Block production and validation replay the same instruction processors,
/// so every node ends with the same state.

pub mod action;
pub mod collateral;
pub mod custodian;
pub mod engine;
pub mod error;
pub mod exchange_rates;
pub mod instruction;
pub mod liquidation;
pub mod params;
pub mod porting;
pub mod processors;
pub mod proof;
pub mod redeem;
pub mod state;
pub mod status;
pub mod store;
pub mod tokens;

pub use action::{ActionEnvelope, PortalAction, ACTION_SCHEMA_VERSION};
pub use collateral::CollateralBundle;
pub use custodian::CustodianState;
pub use engine::{BlockContext, BlockOutput, PortalEngine, AUTO_ORDER};
pub use error::{BuildError, PortalError, RejectReason};
pub use exchange_rates::{ExchangeRateProvider, FinalExchangeRates, RateHistory};
pub use instruction::{Instruction, InstructionKind, InstructionStatus, AUTO_SHARD_ID};
pub use liquidation::{LiquidationPool, PoolEntry, RedeemerClaim};
pub use params::{CollateralTokenConfig, CustodianSelection, ParamsError, PortalParams, PortalTokenConfig};
pub use porting::{MatchingPortingCustodian, WaitingPortingRequest};
pub use proof::{
    porting_memo, redeem_memo, topup_memo, ExpectedPayment, ExternalProof, ExternalProofVerifier,
    ParsedReceipt, PassthroughVerifier, ProofError, VerifierRegistry,
};
pub use redeem::{MatchingRedeemCustodian, RedeemRequest};
pub use state::{PortalMeta, PortalState};
pub use status::{read_status, RequestStatus, StatusRecord, StatusScope};
pub use store::{MemoryStore, PortalStore, StagedStore, StoreError};
pub use tokens::{CollateralKind, ExternalChain, ShardId, TokenId};
