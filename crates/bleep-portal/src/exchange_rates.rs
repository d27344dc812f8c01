/// FINAL EXCHANGE RATES
///
/// Read-only price snapshot for one beacon height. Prices are expressed in a
/// common accounting unit per base unit of each asset; aggregation happens
/// upstream in the oracle.

use crate::error::PortalError;
use crate::tokens::TokenId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalExchangeRates {
    /// Beacon height the snapshot is valid for
    pub beacon_height: u64,
    /// Asset -> price in the common unit
    pub rates: BTreeMap<TokenId, u64>,
}

impl FinalExchangeRates {
    pub fn new(beacon_height: u64) -> Self {
        FinalExchangeRates {
            beacon_height,
            rates: BTreeMap::new(),
        }
    }

    pub fn with_rate(mut self, token: impl Into<TokenId>, price: u64) -> Self {
        self.set_rate(token, price);
        self
    }

    pub fn set_rate(&mut self, token: impl Into<TokenId>, price: u64) {
        self.rates.insert(token.into(), price);
    }

    /// A zero price is treated as missing
    pub fn price(&self, token: &TokenId) -> Result<u64, PortalError> {
        match self.rates.get(token) {
            Some(price) if *price > 0 => Ok(*price),
            _ => Err(PortalError::MissingExchangeRate(token.clone())),
        }
    }

    pub fn value_of(&self, token: &TokenId, amount: u64) -> Result<u128, PortalError> {
        Ok(u128::from(amount) * u128::from(self.price(token)?))
    }
}

/// Source of the agreed price table for a beacon height
pub trait ExchangeRateProvider {
    fn final_rates(&self, beacon_height: u64) -> Result<FinalExchangeRates, PortalError>;
}

/// A fixed table serves every height
impl ExchangeRateProvider for FinalExchangeRates {
    fn final_rates(&self, beacon_height: u64) -> Result<FinalExchangeRates, PortalError> {
        Ok(FinalExchangeRates {
            beacon_height,
            rates: self.rates.clone(),
        })
    }
}

/// Rates recorded per beacon height; a height without its own entry uses
/// the latest earlier table.
#[derive(Debug, Clone, Default)]
pub struct RateHistory {
    tables: BTreeMap<u64, FinalExchangeRates>,
}

impl RateHistory {
    pub fn new() -> Self {
        RateHistory::default()
    }

    pub fn record(&mut self, rates: FinalExchangeRates) {
        self.tables.insert(rates.beacon_height, rates);
    }
}

impl ExchangeRateProvider for RateHistory {
    fn final_rates(&self, beacon_height: u64) -> Result<FinalExchangeRates, PortalError> {
        self.tables
            .range(..=beacon_height)
            .next_back()
            .map(|(_, table)| table.final_rates(beacon_height))
            .unwrap_or_else(|| Ok(FinalExchangeRates::new(beacon_height)))
    }
}
