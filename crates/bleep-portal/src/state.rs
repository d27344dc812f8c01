// PORTAL WORKING STATE
//
// SAFETY INVARIANTS:
// 1. One exclusively owned snapshot per block production/validation attempt
// 2. Every map is a BTreeMap; iteration order is key order on every node
// 3. persist() writes exactly the entities of the snapshot and deletes the
//    rest, so load(persist(s)) == s
// 4. verify_invariants() runs before any snapshot is committed

use crate::collateral::CollateralBundle;
use crate::custodian::CustodianState;
use crate::error::PortalError;
use crate::liquidation::LiquidationPool;
use crate::porting::WaitingPortingRequest;
use crate::redeem::RedeemRequest;
use crate::store::{decode_bincode, get_bincode, keys, put_bincode, PortalStore, StoreError};
use crate::tokens::TokenId;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalMeta {
    /// Accepted porting and redeem fees not yet paid out as rewards
    pub fee_pool: u64,
    /// Beacon height of the last reward distribution
    pub last_reward_height: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalState {
    pub custodians: BTreeMap<String, CustodianState>,
    pub waiting_porting: BTreeMap<String, WaitingPortingRequest>,
    pub waiting_redeems: BTreeMap<String, RedeemRequest>,
    pub matched_redeems: BTreeMap<String, RedeemRequest>,
    pub liquidation_pool: LiquidationPool,
    pub meta: PortalMeta,
}

impl PortalState {
    pub fn genesis() -> Self {
        PortalState::default()
    }

    pub fn load(store: &dyn PortalStore) -> Result<Self, PortalError> {
        let state = PortalState {
            custodians: load_map(store, keys::CUSTODIAN_PREFIX)?,
            waiting_porting: load_map(store, keys::WAITING_PORTING_PREFIX)?,
            waiting_redeems: load_map(store, keys::WAITING_REDEEM_PREFIX)?,
            matched_redeems: load_map(store, keys::MATCHED_REDEEM_PREFIX)?,
            liquidation_pool: get_bincode(store, keys::LIQUIDATION_POOL)?.unwrap_or_default(),
            meta: get_bincode(store, keys::META)?.unwrap_or_default(),
        };
        debug!(
            "[Portal] Loaded state: {} custodians, {} waiting portings, {} waiting / {} matched redeems",
            state.custodians.len(),
            state.waiting_porting.len(),
            state.waiting_redeems.len(),
            state.matched_redeems.len()
        );
        Ok(state)
    }

    pub fn persist(&self, store: &mut dyn PortalStore) -> Result<(), PortalError> {
        persist_map(store, keys::CUSTODIAN_PREFIX, &self.custodians)?;
        persist_map(store, keys::WAITING_PORTING_PREFIX, &self.waiting_porting)?;
        persist_map(store, keys::WAITING_REDEEM_PREFIX, &self.waiting_redeems)?;
        persist_map(store, keys::MATCHED_REDEEM_PREFIX, &self.matched_redeems)?;
        put_bincode(store, keys::LIQUIDATION_POOL, &self.liquidation_pool)?;
        put_bincode(store, keys::META, &self.meta)?;
        Ok(())
    }

    /// Hex SHA-256 of the canonical encoding
    pub fn fingerprint(&self) -> Result<String, PortalError> {
        let bytes = bincode::serialize(self).map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn custodian(&self, address: &str) -> Option<&CustodianState> {
        self.custodians.get(address)
    }

    pub fn custodian_mut(&mut self, address: &str) -> Result<&mut CustodianState, PortalError> {
        self.custodians
            .get_mut(address)
            .ok_or_else(|| PortalError::InvariantViolation(format!("unknown custodian {}", address)))
    }

    /// Collateral a custodian keeps locked for waiting porting requests of `token`
    pub fn porting_locks(&self, custodian: &str, token: &TokenId) -> Result<CollateralBundle, PortalError> {
        self.waiting_porting
            .values()
            .filter(|r| &r.token_id == token)
            .try_fold(CollateralBundle::default(), |acc, r| {
                acc.checked_add(&r.locked_by(custodian)?)
            })
    }

    /// Collateral backing a custodian's current holding of `token`, i.e. the
    /// locks for the token minus those of still-waiting porting requests
    pub fn holding_locked(&self, custodian: &str, token: &TokenId) -> Result<CollateralBundle, PortalError> {
        let locked = self
            .custodians
            .get(custodian)
            .map(|c| c.locked_for(token))
            .unwrap_or_default();
        locked.checked_sub(&self.porting_locks(custodian, token)?)
    }

    /// Whether a request ID is pending in either tracker of its flow
    pub fn is_porting_pending(&self, porting_id: &str) -> bool {
        self.waiting_porting.contains_key(porting_id)
    }

    pub fn is_redeem_pending(&self, redeem_id: &str) -> bool {
        self.waiting_redeems.contains_key(redeem_id) || self.matched_redeems.contains_key(redeem_id)
    }

    pub fn verify_invariants(&self) -> Result<(), PortalError> {
        for custodian in self.custodians.values() {
            custodian.verify_conservation()?;
        }

        for (id, request) in &self.waiting_porting {
            if request.total_allocated()? != request.amount {
                return Err(PortalError::InvariantViolation(format!(
                    "porting {}: allocation != amount",
                    id
                )));
            }
            for matched in &request.custodians {
                let locked = self
                    .custodians
                    .get(&matched.custodian_address)
                    .map(|c| c.locked_for(&request.token_id))
                    .unwrap_or_default();
                if !matched.locked_collateral.fits_within(&locked) {
                    return Err(PortalError::InvariantViolation(format!(
                        "porting {}: lock of {} not held",
                        id, matched.custodian_address
                    )));
                }
            }
        }

        // reserved holding == Σ matches over both redeem trackers
        let mut reserved: BTreeMap<(String, TokenId), u64> = BTreeMap::new();
        for (id, request) in &self.waiting_redeems {
            if request.matched_amount()? >= request.amount {
                return Err(PortalError::InvariantViolation(format!(
                    "waiting redeem {} is fully matched",
                    id
                )));
            }
            tally_reservations(&mut reserved, request)?;
        }
        for (id, request) in &self.matched_redeems {
            if request.matched_amount()? > request.amount || request.custodians.is_empty() {
                return Err(PortalError::InvariantViolation(format!(
                    "matched redeem {}: bad match list",
                    id
                )));
            }
            if self.waiting_redeems.contains_key(id) {
                return Err(PortalError::InvariantViolation(format!(
                    "redeem {} both waiting and matched",
                    id
                )));
            }
            tally_reservations(&mut reserved, request)?;
        }
        for custodian in self.custodians.values() {
            for (token, amount) in &custodian.reserved_public_tokens {
                let expected = reserved
                    .get(&(custodian.address.clone(), token.clone()))
                    .copied()
                    .unwrap_or(0);
                if *amount != expected {
                    return Err(PortalError::InvariantViolation(format!(
                        "custodian {}: reserved {} {} but matched {}",
                        custodian.address, amount, token, expected
                    )));
                }
            }
        }
        for ((address, token), amount) in &reserved {
            let held = self.custodians.get(address).map(|c| c.reserved(token)).unwrap_or(0);
            if held != *amount {
                return Err(PortalError::InvariantViolation(format!(
                    "redeems match {} {} to {} but {} is reserved",
                    amount, token, address, held
                )));
            }
        }
        Ok(())
    }
}

fn tally_reservations(
    reserved: &mut BTreeMap<(String, TokenId), u64>,
    request: &RedeemRequest,
) -> Result<(), PortalError> {
    for matched in &request.custodians {
        let slot = reserved
            .entry((matched.custodian_address.clone(), request.token_id.clone()))
            .or_insert(0);
        *slot = slot
            .checked_add(matched.amount)
            .ok_or(PortalError::ArithmeticOverflow("reservation tally"))?;
    }
    Ok(())
}

fn load_map<T: DeserializeOwned>(
    store: &dyn PortalStore,
    prefix: &[u8],
) -> Result<BTreeMap<String, T>, PortalError> {
    let mut out = BTreeMap::new();
    for (key, value) in store.scan_prefix(prefix)? {
        let id = String::from_utf8(key[prefix.len()..].to_vec())
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        out.insert(id, decode_bincode(&value)?);
    }
    Ok(out)
}

fn persist_map<T: Serialize>(
    store: &mut dyn PortalStore,
    prefix: &[u8],
    entities: &BTreeMap<String, T>,
) -> Result<(), PortalError> {
    let stale: BTreeSet<Vec<u8>> = store
        .scan_prefix(prefix)?
        .into_iter()
        .map(|(key, _)| key)
        .filter(|key| {
            let id = &key[prefix.len()..];
            std::str::from_utf8(id)
                .map(|id| !entities.contains_key(id))
                .unwrap_or(true)
        })
        .collect();
    for key in stale {
        store.delete(&key)?;
    }
    for (id, entity) in entities {
        put_bincode(store, &keys::with_id(prefix, id), entity)?;
    }
    Ok(())
}
