/// EXTERNAL-CHAIN PROOF INTERFACE
///
/// BTC merkle proofs and ETH receipt proofs are verified by chain-specific
/// collaborators. The portal only sees a pure `verify` call returning the
/// parsed receipt, plus the identifiers it derives for memos and replay
/// protection.

use crate::tokens::{ExternalChain, TokenId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Proof of an external-chain transaction as carried by an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalProof {
    pub chain: ExternalChain,
    /// Hash of the external block containing the transaction
    pub block_hash: String,
    /// Position of the transaction inside that block
    pub tx_index: u32,
    /// Chain-specific encoded proof
    pub payload: String,
}

impl ExternalProof {
    pub fn unique_tx_id(&self) -> String {
        unique_external_tx_id(self.chain, &self.block_hash, self.tx_index)
    }
}

/// One payment the verifier must find in the external transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedPayment {
    pub address: String,
    pub token_id: TokenId,
    pub amount: u64,
}

/// Fields parsed out of a verified external transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedReceipt {
    pub memo: String,
    pub payments: Vec<ExpectedPayment>,
}

impl ParsedReceipt {
    pub fn pays(&self, expected: &ExpectedPayment) -> bool {
        self.payments.iter().any(|p| p == expected)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("no verifier registered for {0:?}")]
    NoVerifier(ExternalChain),
    #[error("malformed proof: {0}")]
    Malformed(String),
    #[error("memo mismatch: expected {expected}, found {found}")]
    MemoMismatch { expected: String, found: String },
    #[error("payment of {amount} {token_id} to {address} not found")]
    PaymentMissing {
        address: String,
        token_id: TokenId,
        amount: u64,
    },
    #[error("proof failed verification: {0}")]
    Invalid(String),
}

/// Verifier for one external chain. Implementations must be pure: the same
/// proof and expectations always produce the same result.
pub trait ExternalProofVerifier {
    fn chain(&self) -> ExternalChain;

    fn verify(
        &self,
        proof: &ExternalProof,
        expected_memo: &str,
        expected_payments: &[ExpectedPayment],
    ) -> Result<ParsedReceipt, ProofError>;
}

/// Verifiers keyed by chain, resolved once when the engine is built
#[derive(Default)]
pub struct VerifierRegistry {
    verifiers: BTreeMap<ExternalChain, Box<dyn ExternalProofVerifier>>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        VerifierRegistry::default()
    }

    /// Registry whose verifiers read receipts straight from the proof payload
    pub fn passthrough() -> Self {
        let mut registry = VerifierRegistry::new();
        registry.register(Box::new(PassthroughVerifier::new(ExternalChain::Bitcoin)));
        registry.register(Box::new(PassthroughVerifier::new(ExternalChain::Ethereum)));
        registry
    }

    pub fn register(&mut self, verifier: Box<dyn ExternalProofVerifier>) {
        self.verifiers.insert(verifier.chain(), verifier);
    }

    pub fn verify(
        &self,
        proof: &ExternalProof,
        expected_memo: &str,
        expected_payments: &[ExpectedPayment],
    ) -> Result<ParsedReceipt, ProofError> {
        let verifier = self
            .verifiers
            .get(&proof.chain)
            .ok_or(ProofError::NoVerifier(proof.chain))?;
        verifier.verify(proof, expected_memo, expected_payments)
    }
}

/// Verifier for simulations: the payload is the JSON receipt itself.
///
/// Only memo and payment matching are checked; inclusion of the
/// transaction on the external chain is taken on trust.
pub struct PassthroughVerifier {
    chain: ExternalChain,
}

impl PassthroughVerifier {
    pub fn new(chain: ExternalChain) -> Self {
        PassthroughVerifier { chain }
    }

    /// Encode a receipt as a proof this verifier accepts
    pub fn encode(
        chain: ExternalChain,
        block_hash: &str,
        tx_index: u32,
        receipt: &ParsedReceipt,
    ) -> Result<ExternalProof, ProofError> {
        let payload = serde_json::to_string(receipt).map_err(|e| ProofError::Malformed(e.to_string()))?;
        Ok(ExternalProof {
            chain,
            block_hash: block_hash.to_string(),
            tx_index,
            payload,
        })
    }
}

impl ExternalProofVerifier for PassthroughVerifier {
    fn chain(&self) -> ExternalChain {
        self.chain
    }

    fn verify(
        &self,
        proof: &ExternalProof,
        expected_memo: &str,
        expected_payments: &[ExpectedPayment],
    ) -> Result<ParsedReceipt, ProofError> {
        if proof.chain != self.chain {
            return Err(ProofError::Invalid(format!(
                "{:?} proof sent to {:?} verifier",
                proof.chain, self.chain
            )));
        }
        let receipt: ParsedReceipt = serde_json::from_str(&proof.payload)
            .map_err(|e| ProofError::Malformed(e.to_string()))?;

        if receipt.memo != expected_memo {
            return Err(ProofError::MemoMismatch {
                expected: expected_memo.to_string(),
                found: receipt.memo,
            });
        }
        if let Some(missing) = expected_payments.iter().find(|p| !receipt.pays(p)) {
            return Err(ProofError::PaymentMissing {
                address: missing.address.clone(),
                token_id: missing.token_id.clone(),
                amount: missing.amount,
            });
        }
        Ok(receipt)
    }
}

fn tagged_digest(tag: &str, id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    hasher.update([0u8]);
    hasher.update(id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Memo the user must attach to the external deposit for a porting request
pub fn porting_memo(porting_id: &str) -> String {
    format!("PS1-{}", tagged_digest("portal-porting", porting_id))
}

/// Memo the custodian must attach to the external payout for a redeem
pub fn redeem_memo(redeem_id: &str) -> String {
    format!("PS2-{}", tagged_digest("portal-redeem", redeem_id))
}

/// Memo of a third-party collateral deposit into the vault
pub fn topup_memo(custodian: &str) -> String {
    format!("PS3-{}", tagged_digest("portal-topup", custodian))
}

/// Identifier of an external transaction, used for replay protection
pub fn unique_external_tx_id(chain: ExternalChain, block_hash: &str, tx_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chain.name().as_bytes());
    hasher.update([0u8]);
    hasher.update(block_hash.as_bytes());
    hasher.update(tx_index.to_le_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt() -> ParsedReceipt {
        ParsedReceipt {
            memo: porting_memo("porting-1"),
            payments: vec![ExpectedPayment {
                address: "bc1custodian".to_string(),
                token_id: TokenId::from("pbtc"),
                amount: 100,
            }],
        }
    }

    #[test]
    fn test_unique_id_depends_on_every_field() {
        let base = unique_external_tx_id(ExternalChain::Bitcoin, "00ab", 1);
        assert_ne!(base, unique_external_tx_id(ExternalChain::Ethereum, "00ab", 1));
        assert_ne!(base, unique_external_tx_id(ExternalChain::Bitcoin, "00ac", 1));
        assert_ne!(base, unique_external_tx_id(ExternalChain::Bitcoin, "00ab", 2));
        assert_eq!(base, unique_external_tx_id(ExternalChain::Bitcoin, "00ab", 1));
    }

    #[test]
    fn test_memos_are_distinct_per_flow() {
        assert_ne!(porting_memo("x"), redeem_memo("x"));
        assert_ne!(redeem_memo("x"), topup_memo("x"));
    }

    #[test]
    fn test_passthrough_accepts_matching_receipt() {
        let registry = VerifierRegistry::passthrough();
        let proof = PassthroughVerifier::encode(ExternalChain::Bitcoin, "blk", 0, &receipt()).unwrap();
        let parsed = registry
            .verify(&proof, &porting_memo("porting-1"), &receipt().payments)
            .unwrap();
        assert_eq!(parsed, receipt());
    }

    #[test]
    fn test_passthrough_rejects_wrong_memo_and_amount() {
        let registry = VerifierRegistry::passthrough();
        let proof = PassthroughVerifier::encode(ExternalChain::Bitcoin, "blk", 0, &receipt()).unwrap();

        let err = registry
            .verify(&proof, &porting_memo("porting-2"), &receipt().payments)
            .unwrap_err();
        assert!(matches!(err, ProofError::MemoMismatch { .. }));

        let mut more = receipt().payments;
        more[0].amount = 101;
        let err = registry
            .verify(&proof, &porting_memo("porting-1"), &more)
            .unwrap_err();
        assert!(matches!(err, ProofError::PaymentMissing { .. }));
    }

    #[test]
    fn test_encoded_proof_carries_receipt() {
        let proof = PassthroughVerifier::encode(ExternalChain::Bitcoin, "blk", 3, &receipt()).unwrap();
        assert_eq!(proof.tx_index, 3);
        let decoded: ParsedReceipt = serde_json::from_str(&proof.payload).unwrap();
        assert_eq!(decoded, receipt());

        // an empty payload is malformed, never an empty receipt
        let empty = ExternalProof {
            payload: String::new(),
            ..proof
        };
        let err = VerifierRegistry::passthrough()
            .verify(&empty, &porting_memo("porting-1"), &[])
            .unwrap_err();
        assert!(matches!(err, ProofError::Malformed(_)));
    }

    #[test]
    fn test_missing_verifier() {
        let registry = VerifierRegistry::new();
        let proof = PassthroughVerifier::encode(ExternalChain::Ethereum, "blk", 0, &receipt()).unwrap();
        assert_eq!(
            registry.verify(&proof, "memo", &[]),
            Err(ProofError::NoVerifier(ExternalChain::Ethereum))
        );
    }
}
