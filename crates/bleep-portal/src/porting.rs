/// PORTING (MINT) TRACKER
///
/// Waiting porting requests, the porting fee and the custodian selection
/// that decides who backs a newly minted amount.

use crate::collateral::{div_ceil, to_u64, CollateralBundle};
use crate::custodian::CustodianState;
use crate::engine::BlockContext;
use crate::error::PortalError;
use crate::exchange_rates::FinalExchangeRates;
use crate::params::{CustodianSelection, PortalParams};
use crate::tokens::{ShardId, TokenId};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One custodian's share of a porting request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingPortingCustodian {
    pub custodian_address: String,
    /// Where the user pays this custodian's share on the external chain
    pub remote_address: String,
    pub amount: u64,
    pub locked_collateral: CollateralBundle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingPortingRequest {
    pub porting_id: String,
    pub token_id: TokenId,
    pub amount: u64,
    pub requester: String,
    pub fee: u64,
    pub custodians: Vec<MatchingPortingCustodian>,
    pub shard_id: ShardId,
    pub shard_height: u64,
    pub beacon_height: u64,
}

impl WaitingPortingRequest {
    pub fn total_allocated(&self) -> Result<u64, PortalError> {
        self.custodians.iter().try_fold(0u64, |acc, c| {
            acc.checked_add(c.amount)
                .ok_or(PortalError::ArithmeticOverflow("porting allocation"))
        })
    }

    pub fn is_backed_by(&self, custodian: &str) -> bool {
        self.custodians.iter().any(|c| c.custodian_address == custodian)
    }

    /// Collateral this request keeps locked on one custodian
    pub fn locked_by(&self, custodian: &str) -> Result<CollateralBundle, PortalError> {
        self.custodians
            .iter()
            .filter(|c| c.custodian_address == custodian)
            .try_fold(CollateralBundle::default(), |acc, c| acc.checked_add(&c.locked_collateral))
    }

    pub fn is_expired(&self, block: &BlockContext, timeout: u64) -> bool {
        block.age(self.shard_id, self.shard_height) > timeout
    }
}

/// Minimum porting fee in native units:
/// `ceil(amount * price(token) * porting_fee_bps / (10000 * price(native)))`
pub fn porting_fee(
    params: &PortalParams,
    rates: &FinalExchangeRates,
    token: &TokenId,
    amount: u64,
) -> Result<u64, PortalError> {
    min_fee(params, rates, token, amount, params.porting_fee_bps)
}

pub(crate) fn min_fee(
    params: &PortalParams,
    rates: &FinalExchangeRates,
    token: &TokenId,
    amount: u64,
    bps: u64,
) -> Result<u64, PortalError> {
    let value = rates.value_of(token, amount)?;
    let native_price = u128::from(rates.price(&params.native_token)?);
    let numerator = value
        .checked_mul(u128::from(bps))
        .ok_or(PortalError::ArithmeticOverflow("min fee"))?;
    to_u64(div_ceil(numerator, 10_000 * native_price), "min fee")
}

/// Greedy custodian selection for a porting request.
///
/// Returns `None` when the candidates cannot cover the whole amount.
pub fn select_porting_custodians(
    params: &PortalParams,
    rates: &FinalExchangeRates,
    custodians: &BTreeMap<String, CustodianState>,
    token: &TokenId,
    amount: u64,
) -> Result<Option<Vec<MatchingPortingCustodian>>, PortalError> {
    let price = u128::from(rates.price(token)?);
    let ratio = u128::from(params.required_collateral_percent);

    let mut candidates = Vec::new();
    for custodian in custodians.values() {
        if custodian.remote_address(token).is_none() {
            continue;
        }
        let free = custodian.free_bundle();
        if free.is_empty() {
            continue;
        }
        let free_value = free.value(rates, &params.native_token)?;
        candidates.push((custodian, free, free_value));
    }

    let ordered: Vec<_> = match params.custodian_selection {
        CustodianSelection::LargestFreeCollateral => candidates
            .into_iter()
            .sorted_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.address.cmp(&b.0.address)))
            .collect(),
        CustodianSelection::Address => candidates,
    };

    let mut remaining = u128::from(amount);
    let mut selected = Vec::new();
    for (custodian, free, free_value) in ordered {
        if remaining == 0 {
            break;
        }
        let capacity = free_value
            .checked_mul(100)
            .ok_or(PortalError::ArithmeticOverflow("porting capacity"))?
            / (ratio * price);
        let alloc = capacity.min(remaining);
        if alloc == 0 {
            continue;
        }
        let lock_value = alloc
            .checked_mul(price)
            .and_then(|v| v.checked_mul(ratio))
            .map(|v| div_ceil(v, 100))
            .ok_or(PortalError::ArithmeticOverflow("porting lock"))?;
        let (locked, uncovered) = free.draw(lock_value, rates, &params.native_token)?;
        if uncovered > 0 {
            return Err(PortalError::InvariantViolation(format!(
                "custodian {} capacity {} does not cover lock {}",
                custodian.address, capacity, lock_value
            )));
        }
        selected.push(MatchingPortingCustodian {
            custodian_address: custodian.address.clone(),
            remote_address: custodian.remote_address(token).unwrap_or_default().to_string(),
            amount: to_u64(alloc, "porting allocation")?,
            locked_collateral: locked,
        });
        remaining -= alloc;
    }

    if remaining > 0 {
        return Ok(None);
    }
    Ok(Some(selected))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates() -> FinalExchangeRates {
        FinalExchangeRates::new(1)
            .with_rate("prv", 1)
            .with_rate("pbtc", 10)
            .with_rate("usdt", 1)
    }

    fn custodian(address: &str, native: u64) -> CustodianState {
        let mut c = CustodianState::new(address);
        c.deposit_native(native).unwrap();
        c.remote_addresses
            .insert(TokenId::from("pbtc"), format!("bc1-{}", address));
        c
    }

    fn book(list: Vec<CustodianState>) -> BTreeMap<String, CustodianState> {
        list.into_iter().map(|c| (c.address.clone(), c)).collect()
    }

    #[test]
    fn test_single_custodian_locks_required_ratio() {
        let custodians = book(vec![custodian("c1", 10_000)]);
        let picked = select_porting_custodians(
            &PortalParams::default(),
            &rates(),
            &custodians,
            &TokenId::from("pbtc"),
            100,
        )
        .unwrap()
        .unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].amount, 100);
        assert_eq!(picked[0].locked_collateral, CollateralBundle::native(1_500));
        assert_eq!(picked[0].remote_address, "bc1-c1");
    }

    #[test]
    fn test_largest_free_collateral_first_then_spill() {
        let custodians = book(vec![custodian("a", 900), custodian("b", 3_000)]);
        let picked = select_porting_custodians(
            &PortalParams::default(),
            &rates(),
            &custodians,
            &TokenId::from("pbtc"),
            250,
        )
        .unwrap()
        .unwrap();
        // b covers 200 (3000 / 15), a the remaining 50
        assert_eq!(picked[0].custodian_address, "b");
        assert_eq!(picked[0].amount, 200);
        assert_eq!(picked[1].custodian_address, "a");
        assert_eq!(picked[1].amount, 50);
        assert_eq!(picked[1].locked_collateral.native, 750);
    }

    #[test]
    fn test_address_order_selection() {
        let params = PortalParams {
            custodian_selection: CustodianSelection::Address,
            ..PortalParams::default()
        };
        let custodians = book(vec![custodian("a", 900), custodian("b", 3_000)]);
        let picked = select_porting_custodians(&params, &rates(), &custodians, &TokenId::from("pbtc"), 70)
            .unwrap()
            .unwrap();
        assert_eq!(picked[0].custodian_address, "a");
        assert_eq!(picked[0].amount, 60);
        assert_eq!(picked[1].custodian_address, "b");
        assert_eq!(picked[1].amount, 10);
    }

    #[test]
    fn test_uncoverable_amount() {
        let mut no_address = CustodianState::new("z");
        no_address.deposit_native(1_000_000).unwrap();
        let custodians = book(vec![custodian("a", 1_000), no_address]);
        let picked = select_porting_custodians(
            &PortalParams::default(),
            &rates(),
            &custodians,
            &TokenId::from("pbtc"),
            100,
        )
        .unwrap();
        assert!(picked.is_none());
    }

    #[test]
    fn test_fee_rounds_up() {
        let fee = porting_fee(&PortalParams::default(), &rates(), &TokenId::from("pbtc"), 100).unwrap();
        // 100 * 10 * 1 / 10000 = 0.1 -> 1
        assert_eq!(fee, 1);
    }
}
