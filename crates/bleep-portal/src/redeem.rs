/// REDEEM (BURN) TRACKER
///
/// Waiting and matched redeem requests. A redeem is filled incrementally by
/// custodians reserving part of their holding; it is promoted to the matched
/// set exactly when the reserved parts add up to the requested amount.

use crate::custodian::CustodianState;
use crate::engine::BlockContext;
use crate::error::PortalError;
use crate::exchange_rates::FinalExchangeRates;
use crate::params::PortalParams;
use crate::porting::min_fee;
use crate::tokens::{ShardId, TokenId};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingRedeemCustodian {
    pub custodian_address: String,
    pub remote_address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemRequest {
    pub redeem_id: String,
    pub token_id: TokenId,
    pub amount: u64,
    pub redeemer: String,
    /// External address the custodians pay out to
    pub redeemer_remote_address: String,
    pub fee: u64,
    pub custodians: Vec<MatchingRedeemCustodian>,
    pub shard_id: ShardId,
    pub shard_height: u64,
    pub beacon_height: u64,
    /// Set once a rate liquidation cancelled one of the matches
    pub cancelled_by_liquidation: bool,
}

impl RedeemRequest {
    pub fn matched_amount(&self) -> Result<u64, PortalError> {
        self.custodians.iter().try_fold(0u64, |acc, c| {
            acc.checked_add(c.amount)
                .ok_or(PortalError::ArithmeticOverflow("redeem matched amount"))
        })
    }

    pub fn remaining(&self) -> Result<u64, PortalError> {
        self.amount
            .checked_sub(self.matched_amount()?)
            .ok_or_else(|| PortalError::InvariantViolation(format!("redeem {} over-matched", self.redeem_id)))
    }

    pub fn is_fully_matched(&self) -> Result<bool, PortalError> {
        Ok(self.matched_amount()? == self.amount)
    }

    pub fn custodian(&self, address: &str) -> Option<&MatchingRedeemCustodian> {
        self.custodians.iter().find(|c| c.custodian_address == address)
    }

    pub fn remove_custodian(&mut self, address: &str) -> Option<MatchingRedeemCustodian> {
        let index = self.custodians.iter().position(|c| c.custodian_address == address)?;
        Some(self.custodians.remove(index))
    }

    pub fn age(&self, block: &BlockContext) -> u64 {
        block.age(self.shard_id, self.shard_height)
    }
}

/// Minimum redeem fee in native units
pub fn redeem_fee(
    params: &PortalParams,
    rates: &FinalExchangeRates,
    token: &TokenId,
    amount: u64,
) -> Result<u64, PortalError> {
    min_fee(params, rates, token, amount, params.redeem_fee_bps)
}

/// Holding that can still back new redeems of `token`: unreserved holding
/// minus what waiting redeems still need.
pub fn available_holding(
    custodians: &BTreeMap<String, CustodianState>,
    waiting: &BTreeMap<String, RedeemRequest>,
    token: &TokenId,
) -> Result<u64, PortalError> {
    let mut free: u64 = 0;
    for custodian in custodians.values() {
        free = free
            .checked_add(custodian.free_holding(token))
            .ok_or(PortalError::ArithmeticOverflow("available holding"))?;
    }
    let mut pending: u64 = 0;
    for request in waiting.values().filter(|r| &r.token_id == token) {
        pending = pending
            .checked_add(request.remaining()?)
            .ok_or(PortalError::ArithmeticOverflow("pending redeems"))?;
    }
    Ok(free.saturating_sub(pending))
}

/// First-fit fill of `remaining` by free holding, largest first, ties by
/// address. Custodians already on the request are skipped. The result may
/// cover less than `remaining`.
pub fn pick_custodians(
    custodians: &BTreeMap<String, CustodianState>,
    request: &RedeemRequest,
    remaining: u64,
) -> Vec<MatchingRedeemCustodian> {
    let token = &request.token_id;
    let candidates = custodians
        .values()
        .filter(|c| request.custodian(&c.address).is_none())
        .filter(|c| c.free_holding(token) > 0)
        .filter_map(|c| c.remote_address(token).map(|remote| (c, remote)))
        .sorted_by(|a, b| {
            b.0.free_holding(token)
                .cmp(&a.0.free_holding(token))
                .then_with(|| a.0.address.cmp(&b.0.address))
        });

    let mut left = remaining;
    let mut picked = Vec::new();
    for (custodian, remote) in candidates {
        if left == 0 {
            break;
        }
        let amount = custodian.free_holding(token).min(left);
        picked.push(MatchingRedeemCustodian {
            custodian_address: custodian.address.clone(),
            remote_address: remote.to_string(),
            amount,
        });
        left -= amount;
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pbtc() -> TokenId {
        TokenId::from("pbtc")
    }

    fn holder(address: &str, holding: u64, reserved: u64) -> CustodianState {
        let mut c = CustodianState::new(address);
        c.remote_addresses.insert(pbtc(), format!("bc1-{}", address));
        c.add_holding(&pbtc(), holding).unwrap();
        c.reserve(&pbtc(), reserved).unwrap();
        c
    }

    fn request(amount: u64, custodians: Vec<MatchingRedeemCustodian>) -> RedeemRequest {
        RedeemRequest {
            redeem_id: "r1".to_string(),
            token_id: pbtc(),
            amount,
            redeemer: "user".to_string(),
            redeemer_remote_address: "bc1-user".to_string(),
            fee: 1,
            custodians,
            shard_id: 0,
            shard_height: 10,
            beacon_height: 5,
            cancelled_by_liquidation: false,
        }
    }

    fn book(list: Vec<CustodianState>) -> BTreeMap<String, CustodianState> {
        list.into_iter().map(|c| (c.address.clone(), c)).collect()
    }

    #[test]
    fn test_available_holding_subtracts_pending_remainders() {
        let custodians = book(vec![holder("a", 100, 20), holder("b", 50, 0)]);
        let mut waiting = BTreeMap::new();
        let partial = request(
            60,
            vec![MatchingRedeemCustodian {
                custodian_address: "a".to_string(),
                remote_address: "bc1-a".to_string(),
                amount: 20,
            }],
        );
        waiting.insert("r1".to_string(), partial);
        // free: 80 + 50, pending remainder: 40
        assert_eq!(available_holding(&custodians, &waiting, &pbtc()).unwrap(), 90);
    }

    #[test]
    fn test_pick_is_first_fit_largest_first() {
        let custodians = book(vec![holder("a", 30, 0), holder("b", 30, 0), holder("c", 80, 0)]);
        let picked = pick_custodians(&custodians, &request(100, vec![]), 100);
        let summary: Vec<_> = picked
            .iter()
            .map(|p| (p.custodian_address.as_str(), p.amount))
            .collect();
        assert_eq!(summary, vec![("c", 80), ("a", 20)]);
    }

    #[test]
    fn test_pick_skips_already_matched() {
        let custodians = book(vec![holder("a", 30, 10), holder("b", 5, 0)]);
        let existing = MatchingRedeemCustodian {
            custodian_address: "a".to_string(),
            remote_address: "bc1-a".to_string(),
            amount: 10,
        };
        let picked = pick_custodians(&custodians, &request(40, vec![existing]), 30);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].custodian_address, "b");
        assert_eq!(picked[0].amount, 5);
    }

    #[test]
    fn test_remaining_and_removal() {
        let mut r = request(
            40,
            vec![MatchingRedeemCustodian {
                custodian_address: "a".to_string(),
                remote_address: "bc1-a".to_string(),
                amount: 40,
            }],
        );
        assert!(r.is_fully_matched().unwrap());
        assert_eq!(r.remaining().unwrap(), 0);
        assert!(r.remove_custodian("a").is_some());
        assert!(r.remove_custodian("a").is_none());
        assert_eq!(r.remaining().unwrap(), 40);
    }
}
