// CUSTODIAN LEDGER
//
// SAFETY INVARIANTS:
// 1. free + Σ locked == total, for the native coin and every collateral token
// 2. reserved <= holding, per portal token
// 3. Custodians are created on first deposit and never deleted
// 4. Every mutation is checked; a failed mutation leaves the ledger untouched

use crate::collateral::{checked_add, checked_sub, set_or_remove, CollateralBundle};
use crate::error::PortalError;
use crate::tokens::{CollateralKind, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianState {
    pub address: String,
    /// External receiving address per portal token
    pub remote_addresses: BTreeMap<TokenId, String>,
    /// Native collateral deposited
    pub total_collateral: u64,
    /// Native collateral not locked against any portal token
    pub free_collateral: u64,
    /// Per portal token: collateral locked against it
    pub locked_collateral: BTreeMap<TokenId, CollateralBundle>,
    /// Per third-party collateral token
    pub total_token_collaterals: BTreeMap<TokenId, u64>,
    pub free_token_collaterals: BTreeMap<TokenId, u64>,
    /// Per portal token: pubToken minted against this custodian
    pub holding_public_tokens: BTreeMap<TokenId, u64>,
    /// Per portal token: holding matched to redeems, not yet paid out
    pub reserved_public_tokens: BTreeMap<TokenId, u64>,
    /// Native rewards accrued and not withdrawn
    pub reward_balance: u64,
}

impl CustodianState {
    pub fn new(address: impl Into<String>) -> Self {
        CustodianState {
            address: address.into(),
            ..CustodianState::default()
        }
    }

    pub fn remote_address(&self, token: &TokenId) -> Option<&str> {
        self.remote_addresses.get(token).map(String::as_str)
    }

    /// Register addresses for tokens that have none yet; existing entries win
    pub fn register_remote_addresses(&mut self, addresses: &BTreeMap<TokenId, String>) {
        for (token, address) in addresses {
            self.remote_addresses
                .entry(token.clone())
                .or_insert_with(|| address.clone());
        }
    }

    pub fn deposit_native(&mut self, amount: u64) -> Result<(), PortalError> {
        let total = checked_add(self.total_collateral, amount, "custodian deposit")?;
        let free = checked_add(self.free_collateral, amount, "custodian deposit")?;
        self.total_collateral = total;
        self.free_collateral = free;
        Ok(())
    }

    pub fn deposit_token(&mut self, token: &TokenId, amount: u64) -> Result<(), PortalError> {
        let total = checked_add(token_amount(&self.total_token_collaterals, token), amount, "token deposit")?;
        let free = checked_add(token_amount(&self.free_token_collaterals, token), amount, "token deposit")?;
        set_or_remove(&mut self.total_token_collaterals, token, total);
        set_or_remove(&mut self.free_token_collaterals, token, free);
        Ok(())
    }

    pub fn deposit(&mut self, kind: &CollateralKind, amount: u64) -> Result<(), PortalError> {
        match kind {
            CollateralKind::Native => self.deposit_native(amount),
            CollateralKind::Token(token) => self.deposit_token(token, amount),
        }
    }

    /// Remove free collateral of one kind from the custodian altogether
    pub fn withdraw(&mut self, kind: &CollateralKind, amount: u64) -> Result<(), PortalError> {
        match kind {
            CollateralKind::Native => {
                let free = checked_sub(self.free_collateral, amount, "withdraw native")?;
                let total = checked_sub(self.total_collateral, amount, "withdraw native")?;
                self.free_collateral = free;
                self.total_collateral = total;
            }
            CollateralKind::Token(token) => {
                let free = checked_sub(token_amount(&self.free_token_collaterals, token), amount, "withdraw token")?;
                let total = checked_sub(token_amount(&self.total_token_collaterals, token), amount, "withdraw token")?;
                set_or_remove(&mut self.free_token_collaterals, token, free);
                set_or_remove(&mut self.total_token_collaterals, token, total);
            }
        }
        Ok(())
    }

    pub fn free_bundle(&self) -> CollateralBundle {
        CollateralBundle {
            native: self.free_collateral,
            tokens: self.free_token_collaterals.clone(),
        }
    }

    pub fn free_of(&self, kind: &CollateralKind) -> u64 {
        self.free_bundle().amount_of(kind)
    }

    pub fn locked_for(&self, token: &TokenId) -> CollateralBundle {
        self.locked_collateral.get(token).cloned().unwrap_or_default()
    }

    /// Everything locked, across all portal tokens
    pub fn total_locked(&self) -> Result<CollateralBundle, PortalError> {
        self.locked_collateral
            .values()
            .try_fold(CollateralBundle::default(), |acc, b| acc.checked_add(b))
    }

    /// free -> locked[token]
    pub fn lock(&mut self, token: &TokenId, bundle: &CollateralBundle) -> Result<(), PortalError> {
        let free = self.free_bundle().checked_sub(bundle)?;
        let locked = self.locked_for(token).checked_add(bundle)?;
        self.set_free(free);
        self.set_locked(token, locked);
        Ok(())
    }

    /// locked[token] -> free
    pub fn release(&mut self, token: &TokenId, bundle: &CollateralBundle) -> Result<(), PortalError> {
        let locked = self.locked_for(token).checked_sub(bundle)?;
        let free = self.free_bundle().checked_add(bundle)?;
        self.set_free(free);
        self.set_locked(token, locked);
        Ok(())
    }

    /// locked[token] leaves the custodian (liquidation)
    pub fn seize(&mut self, token: &TokenId, bundle: &CollateralBundle) -> Result<(), PortalError> {
        let locked = self.locked_for(token).checked_sub(bundle)?;
        let total_native = checked_sub(self.total_collateral, bundle.native, "seize native")?;
        let mut totals = self.total_token_collaterals.clone();
        for (id, amount) in &bundle.tokens {
            let left = checked_sub(token_amount(&totals, id), *amount, "seize token")?;
            set_or_remove(&mut totals, id, left);
        }
        self.total_collateral = total_native;
        self.total_token_collaterals = totals;
        self.set_locked(token, locked);
        Ok(())
    }

    pub fn holding(&self, token: &TokenId) -> u64 {
        token_amount(&self.holding_public_tokens, token)
    }

    pub fn reserved(&self, token: &TokenId) -> u64 {
        token_amount(&self.reserved_public_tokens, token)
    }

    /// Holding not yet matched to any redeem
    pub fn free_holding(&self, token: &TokenId) -> u64 {
        self.holding(token).saturating_sub(self.reserved(token))
    }

    pub fn add_holding(&mut self, token: &TokenId, amount: u64) -> Result<(), PortalError> {
        let holding = checked_add(self.holding(token), amount, "add holding")?;
        set_or_remove(&mut self.holding_public_tokens, token, holding);
        Ok(())
    }

    /// Burn holding that is not reserved (rate liquidation)
    pub fn reduce_free_holding(&mut self, token: &TokenId, amount: u64) -> Result<(), PortalError> {
        if amount > self.free_holding(token) {
            return Err(PortalError::InvariantViolation(format!(
                "custodian {} cannot drop {} reserved {}",
                self.address, amount, token
            )));
        }
        let holding = checked_sub(self.holding(token), amount, "reduce holding")?;
        set_or_remove(&mut self.holding_public_tokens, token, holding);
        Ok(())
    }

    /// Settle a reserved amount: holding and reserved both decrease
    pub fn settle_reserved(&mut self, token: &TokenId, amount: u64) -> Result<(), PortalError> {
        let holding = checked_sub(self.holding(token), amount, "settle holding")?;
        let reserved = checked_sub(self.reserved(token), amount, "settle reserved")?;
        set_or_remove(&mut self.holding_public_tokens, token, holding);
        set_or_remove(&mut self.reserved_public_tokens, token, reserved);
        Ok(())
    }

    pub fn reserve(&mut self, token: &TokenId, amount: u64) -> Result<(), PortalError> {
        if amount > self.free_holding(token) {
            return Err(PortalError::InvariantViolation(format!(
                "custodian {} reserves {} {} above free holding",
                self.address, amount, token
            )));
        }
        let reserved = checked_add(self.reserved(token), amount, "reserve")?;
        set_or_remove(&mut self.reserved_public_tokens, token, reserved);
        Ok(())
    }

    pub fn release_reservation(&mut self, token: &TokenId, amount: u64) -> Result<(), PortalError> {
        let reserved = checked_sub(self.reserved(token), amount, "release reservation")?;
        set_or_remove(&mut self.reserved_public_tokens, token, reserved);
        Ok(())
    }

    pub fn credit_reward(&mut self, amount: u64) -> Result<(), PortalError> {
        self.reward_balance = checked_add(self.reward_balance, amount, "reward")?;
        Ok(())
    }

    /// Check invariants 1 and 2 for this custodian
    pub fn verify_conservation(&self) -> Result<(), PortalError> {
        let locked = self.total_locked()?;
        let free = self.free_bundle();
        let expected = free.checked_add(&locked)?;
        if expected.native != self.total_collateral || expected.tokens != self.total_token_collaterals {
            return Err(PortalError::InvariantViolation(format!(
                "custodian {}: free + locked != total",
                self.address
            )));
        }
        if let Some(token) = self
            .reserved_public_tokens
            .iter()
            .find(|(token, reserved)| **reserved > self.holding(token))
            .map(|(token, _)| token)
        {
            return Err(PortalError::InvariantViolation(format!(
                "custodian {}: reserved {} exceeds holding",
                self.address, token
            )));
        }
        Ok(())
    }

    fn set_free(&mut self, free: CollateralBundle) {
        self.free_collateral = free.native;
        self.free_token_collaterals = free.tokens;
    }

    fn set_locked(&mut self, token: &TokenId, locked: CollateralBundle) {
        if locked.is_empty() {
            self.locked_collateral.remove(token);
        } else {
            self.locked_collateral.insert(token.clone(), locked);
        }
    }
}

fn token_amount(map: &BTreeMap<TokenId, u64>, token: &TokenId) -> u64 {
    map.get(token).copied().unwrap_or(0)
}
