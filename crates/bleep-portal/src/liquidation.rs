// LIQUIDATION POOL & LIQUIDATION MATH
//
// SAFETY INVARIANTS:
// 1. Collateral enters the pool only by seizure from a custodian's locks
// 2. A run-away seizure is earmarked for the redeemer of that redeem ID
// 3. A rate liquidation burns holding that is not reserved by any redeem
// 4. Seized value never exceeds the collateral backing the liquidated holding

use crate::collateral::{div_ceil, to_u64, CollateralBundle};
use crate::error::PortalError;
use crate::exchange_rates::FinalExchangeRates;
use crate::params::PortalParams;
use crate::tokens::TokenId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Collateral seized by rate liquidation for one portal token, and the
/// pubToken amount it backs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub collateral: CollateralBundle,
    pub public_token_amount: u64,
}

/// Compensation seized for a redeemer whose custodian never paid out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemerClaim {
    pub redeemer: String,
    pub token_id: TokenId,
    pub collateral: CollateralBundle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationPool {
    pub pools: BTreeMap<TokenId, PoolEntry>,
    /// Redeem ID -> claim
    pub claims: BTreeMap<String, RedeemerClaim>,
}

impl LiquidationPool {
    pub fn entry(&self, token: &TokenId) -> Option<&PoolEntry> {
        self.pools.get(token)
    }

    pub fn deposit(
        &mut self,
        token: &TokenId,
        collateral: &CollateralBundle,
        public_token_amount: u64,
    ) -> Result<(), PortalError> {
        let current = self.pools.get(token).cloned().unwrap_or_default();
        let updated = PoolEntry {
            collateral: current.collateral.checked_add(collateral)?,
            public_token_amount: current
                .public_token_amount
                .checked_add(public_token_amount)
                .ok_or(PortalError::ArithmeticOverflow("pool deposit"))?,
        };
        self.pools.insert(token.clone(), updated);
        Ok(())
    }

    /// Collateral paid for burning `amount` pubTokens against the pool
    pub fn redeem_share(&self, token: &TokenId, amount: u64) -> Result<CollateralBundle, PortalError> {
        match self.pools.get(token) {
            Some(entry) if entry.public_token_amount > 0 => {
                entry.collateral.share(amount, entry.public_token_amount)
            }
            _ => Ok(CollateralBundle::default()),
        }
    }

    pub fn withdraw(
        &mut self,
        token: &TokenId,
        amount: u64,
        payout: &CollateralBundle,
    ) -> Result<(), PortalError> {
        let current = self
            .pools
            .get(token)
            .cloned()
            .ok_or_else(|| PortalError::InvariantViolation(format!("no pool for {}", token)))?;
        let updated = PoolEntry {
            collateral: current.collateral.checked_sub(payout)?,
            public_token_amount: current
                .public_token_amount
                .checked_sub(amount)
                .ok_or(PortalError::ArithmeticOverflow("pool withdraw"))?,
        };
        if updated.public_token_amount == 0 && updated.collateral.is_empty() {
            self.pools.remove(token);
        } else {
            self.pools.insert(token.clone(), updated);
        }
        Ok(())
    }

    /// Add seized collateral to the claim of a redeem; several custodians of
    /// the same redeem accumulate into one claim
    pub fn credit_claim(
        &mut self,
        redeem_id: &str,
        redeemer: &str,
        token: &TokenId,
        collateral: &CollateralBundle,
    ) -> Result<(), PortalError> {
        let updated = match self.claims.get(redeem_id) {
            Some(existing) => RedeemerClaim {
                collateral: existing.collateral.checked_add(collateral)?,
                ..existing.clone()
            },
            None => RedeemerClaim {
                redeemer: redeemer.to_string(),
                token_id: token.clone(),
                collateral: collateral.clone(),
            },
        };
        self.claims.insert(redeem_id.to_string(), updated);
        Ok(())
    }

    pub fn take_claim(&mut self, redeem_id: &str) -> Option<RedeemerClaim> {
        self.claims.remove(redeem_id)
    }

    /// Everything held by the pool, claims included
    pub fn total_collateral(&self) -> Result<CollateralBundle, PortalError> {
        let pooled = self
            .pools
            .values()
            .try_fold(CollateralBundle::default(), |acc, e| acc.checked_add(&e.collateral))?;
        self.claims
            .values()
            .try_fold(pooled, |acc, c| acc.checked_add(&c.collateral))
    }
}

/// Split of one unpaid match at run-away liquidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAwaySettlement {
    /// Moves to the redeemer's claim
    pub seized: CollateralBundle,
    /// Returns to the custodian's free collateral
    pub released: CollateralBundle,
}

/// Seize `amount * price * premium / 100` of value from the collateral
/// backing the custodian's holding; the rest of its proportional share for
/// `amount` is released.
pub fn settle_run_away(
    params: &PortalParams,
    rates: &FinalExchangeRates,
    holding_locked: &CollateralBundle,
    token: &TokenId,
    amount: u64,
    holding: u64,
) -> Result<RunAwaySettlement, PortalError> {
    let share = holding_locked.share(amount, holding)?;
    let seize_value = rates
        .value_of(token, amount)?
        .checked_mul(u128::from(params.run_away_premium_percent))
        .ok_or(PortalError::ArithmeticOverflow("run-away seize"))?
        / 100;
    let (seized, _uncovered) = holding_locked.draw(seize_value, rates, &params.native_token)?;
    let released = share.saturating_sub(&seized);
    Ok(RunAwaySettlement { seized, released })
}

/// Outcome of the collateral-ratio check for one custodian and token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLiquidationPlan {
    /// Collateral ratio before liquidation, percent, floored
    pub ratio_percent: u64,
    /// pubTokens taken off the custodian's holding
    pub liquidated_amount: u64,
    pub seized: CollateralBundle,
}

/// `locked_value * 100 / (holding * price)`, floored
pub fn collateral_ratio(locked_value: u128, holding: u64, price: u64) -> Result<u64, PortalError> {
    let debt = u128::from(holding) * u128::from(price);
    if debt == 0 {
        return Ok(u64::MAX);
    }
    let scaled = locked_value
        .checked_mul(100)
        .ok_or(PortalError::ArithmeticOverflow("collateral ratio"))?;
    Ok(u64::try_from(scaled / debt).unwrap_or(u64::MAX))
}

/// Plan a rate liquidation; `None` while the ratio is at or above the
/// threshold.
///
/// With `L` the value backing holding `H` at price `P`, the liquidated
/// amount `h` is the least that restores the target ratio:
/// `h = ceil((target*H*P - 100*L) / ((target - seize)*P))`, all of `H` when
/// the ratio is at or below the seize rate, and never more than
/// `liquidatable` (the unreserved holding).
pub fn plan_rate_liquidation(
    params: &PortalParams,
    rates: &FinalExchangeRates,
    holding_locked: &CollateralBundle,
    token: &TokenId,
    holding: u64,
    liquidatable: u64,
) -> Result<Option<RateLiquidationPlan>, PortalError> {
    if holding == 0 {
        return Ok(None);
    }
    let price = rates.price(token)?;
    let locked_value = holding_locked.value(rates, &params.native_token)?;
    let debt = u128::from(holding) * u128::from(price);
    let scaled_locked = locked_value
        .checked_mul(100)
        .ok_or(PortalError::ArithmeticOverflow("rate liquidation"))?;

    let threshold = u128::from(params.liquidation_threshold_percent);
    if scaled_locked >= threshold * debt {
        return Ok(None);
    }

    let target = u128::from(params.liquidation_target_percent);
    let seize = u128::from(params.rate_liquidation_seize_percent);
    let needed = if scaled_locked <= seize * debt {
        u128::from(holding)
    } else {
        let numerator = (target * debt).saturating_sub(scaled_locked);
        let denominator = (target - seize) * u128::from(price);
        div_ceil(numerator, denominator).min(u128::from(holding))
    };
    let liquidated = to_u64(needed, "rate liquidation")?.min(liquidatable);

    let seize_value = div_ceil(
        u128::from(liquidated)
            .checked_mul(u128::from(price))
            .and_then(|v| v.checked_mul(seize))
            .ok_or(PortalError::ArithmeticOverflow("rate liquidation seize"))?,
        100,
    );
    let (seized, _uncovered) = holding_locked.draw(seize_value, rates, &params.native_token)?;

    Ok(Some(RateLiquidationPlan {
        ratio_percent: collateral_ratio(locked_value, holding, price)?,
        liquidated_amount: liquidated,
        seized,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pbtc() -> TokenId {
        TokenId::from("pbtc")
    }

    fn rates(pbtc_price: u64) -> FinalExchangeRates {
        FinalExchangeRates::new(1)
            .with_rate("prv", 1)
            .with_rate("pbtc", pbtc_price)
    }

    #[test]
    fn test_rate_liquidation_restores_target() {
        let params = PortalParams::default();
        let locked = CollateralBundle::native(1_500);
        let plan = plan_rate_liquidation(&params, &rates(12), &locked, &pbtc(), 100, 100)
            .unwrap()
            .unwrap();
        assert_eq!(plan.ratio_percent, 125);
        assert_eq!(plan.liquidated_amount, 56);
        assert_eq!(plan.seized, CollateralBundle::native(706));

        let left = locked.checked_sub(&plan.seized).unwrap();
        let ratio = collateral_ratio(u128::from(left.native), 100 - 56, 12).unwrap();
        assert!(ratio >= 150);
    }

    #[test]
    fn test_healthy_custodian_untouched() {
        let params = PortalParams::default();
        let locked = CollateralBundle::native(1_500);
        assert!(plan_rate_liquidation(&params, &rates(10), &locked, &pbtc(), 100, 100)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_deeply_underwater_takes_everything_liquidatable() {
        let params = PortalParams::default();
        let locked = CollateralBundle::native(1_000);
        // ratio 1000*100/(100*10) = 100 <= seize 105
        let plan = plan_rate_liquidation(&params, &rates(10), &locked, &pbtc(), 100, 70)
            .unwrap()
            .unwrap();
        assert_eq!(plan.liquidated_amount, 70);
        assert_eq!(plan.seized, CollateralBundle::native(735));
    }

    #[test]
    fn test_run_away_premium_and_release() {
        let params = PortalParams::default();
        let locked = CollateralBundle::native(1_500);
        let settlement = settle_run_away(&params, &rates(10), &locked, &pbtc(), 40, 100).unwrap();
        // share 600, seized 40*10*105/100 = 420
        assert_eq!(settlement.seized, CollateralBundle::native(420));
        assert_eq!(settlement.released, CollateralBundle::native(180));
    }

    #[test]
    fn test_pool_share_and_withdraw() {
        let mut pool = LiquidationPool::default();
        pool.deposit(&pbtc(), &CollateralBundle::native(706), 56).unwrap();
        let payout = pool.redeem_share(&pbtc(), 28).unwrap();
        assert_eq!(payout, CollateralBundle::native(353));
        pool.withdraw(&pbtc(), 28, &payout).unwrap();
        assert_eq!(pool.entry(&pbtc()).unwrap().public_token_amount, 28);

        let rest = pool.redeem_share(&pbtc(), 28).unwrap();
        pool.withdraw(&pbtc(), 28, &rest).unwrap();
        assert!(pool.entry(&pbtc()).is_none());
    }

    #[test]
    fn test_claims_accumulate_per_redeem() {
        let mut pool = LiquidationPool::default();
        pool.credit_claim("r1", "user", &pbtc(), &CollateralBundle::native(10)).unwrap();
        pool.credit_claim("r1", "user", &pbtc(), &CollateralBundle::native(5)).unwrap();
        assert_eq!(pool.total_collateral().unwrap(), CollateralBundle::native(15));
        let claim = pool.take_claim("r1").unwrap();
        assert_eq!(claim.collateral.native, 15);
        assert!(pool.take_claim("r1").is_none());
    }
}
