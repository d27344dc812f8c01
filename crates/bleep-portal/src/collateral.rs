// COLLATERAL ARITHMETIC
//
// SAFETY INVARIANTS:
// 1. Every ledger operation is checked; overflow or underflow is a hard fault
// 2. Bundles are canonical: zero token entries are never stored
// 3. Collateral is drawn native-first, then third-party tokens in id order

use crate::error::PortalError;
use crate::exchange_rates::FinalExchangeRates;
use crate::tokens::{CollateralKind, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub(crate) fn checked_add(a: u64, b: u64, what: &'static str) -> Result<u64, PortalError> {
    a.checked_add(b).ok_or(PortalError::ArithmeticOverflow(what))
}

pub(crate) fn checked_sub(a: u64, b: u64, what: &'static str) -> Result<u64, PortalError> {
    a.checked_sub(b).ok_or(PortalError::ArithmeticOverflow(what))
}

pub(crate) fn to_u64(value: u128, what: &'static str) -> Result<u64, PortalError> {
    u64::try_from(value).map_err(|_| PortalError::ArithmeticOverflow(what))
}

pub(crate) fn div_ceil(a: u128, b: u128) -> u128 {
    if b == 0 {
        return 0;
    }
    a / b + u128::from(a % b != 0)
}

/// `a * b / c`, floored. `c == 0` yields 0.
pub(crate) fn mul_div(a: u64, b: u64, c: u64, what: &'static str) -> Result<u64, PortalError> {
    if c == 0 {
        return Ok(0);
    }
    to_u64(u128::from(a) * u128::from(b) / u128::from(c), what)
}

pub(crate) fn set_or_remove(map: &mut BTreeMap<TokenId, u64>, token: &TokenId, amount: u64) {
    if amount == 0 {
        map.remove(token);
    } else {
        map.insert(token.clone(), amount);
    }
}

/// Amount of collateral spread over the native coin and third-party tokens
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralBundle {
    pub native: u64,
    #[serde(default)]
    pub tokens: BTreeMap<TokenId, u64>,
}

impl CollateralBundle {
    pub fn native(amount: u64) -> Self {
        CollateralBundle {
            native: amount,
            tokens: BTreeMap::new(),
        }
    }

    pub fn with_token(mut self, token: TokenId, amount: u64) -> Self {
        if amount > 0 {
            self.tokens.insert(token, amount);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.native == 0 && self.tokens.values().all(|v| *v == 0)
    }

    pub fn amount_of(&self, kind: &CollateralKind) -> u64 {
        match kind {
            CollateralKind::Native => self.native,
            CollateralKind::Token(id) => self.tokens.get(id).copied().unwrap_or(0),
        }
    }

    /// True when every kind in `self` is covered by `other`
    pub fn fits_within(&self, other: &CollateralBundle) -> bool {
        self.native <= other.native
            && self
                .tokens
                .iter()
                .all(|(id, amount)| *amount <= other.tokens.get(id).copied().unwrap_or(0))
    }

    pub fn checked_add(&self, other: &CollateralBundle) -> Result<Self, PortalError> {
        let mut out = self.clone();
        out.native = checked_add(out.native, other.native, "bundle add")?;
        for (id, amount) in &other.tokens {
            let current = out.tokens.get(id).copied().unwrap_or(0);
            set_or_remove(&mut out.tokens, id, checked_add(current, *amount, "bundle add")?);
        }
        Ok(out)
    }

    pub fn checked_sub(&self, other: &CollateralBundle) -> Result<Self, PortalError> {
        let mut out = self.clone();
        out.native = checked_sub(out.native, other.native, "bundle sub")?;
        for (id, amount) in &other.tokens {
            let current = out.tokens.get(id).copied().unwrap_or(0);
            set_or_remove(&mut out.tokens, id, checked_sub(current, *amount, "bundle sub")?);
        }
        Ok(out)
    }

    /// Per-kind subtraction clamped at zero
    pub fn saturating_sub(&self, other: &CollateralBundle) -> Self {
        let mut out = self.clone();
        out.native = out.native.saturating_sub(other.native);
        for (id, amount) in &other.tokens {
            let current = out.tokens.get(id).copied().unwrap_or(0);
            set_or_remove(&mut out.tokens, id, current.saturating_sub(*amount));
        }
        out
    }

    /// `self * numerator / denominator` per kind, floored
    pub fn share(&self, numerator: u64, denominator: u64) -> Result<Self, PortalError> {
        if denominator == 0 || numerator >= denominator {
            return Ok(self.clone());
        }
        let mut out = CollateralBundle::native(mul_div(
            self.native,
            numerator,
            denominator,
            "bundle share",
        )?);
        for (id, amount) in &self.tokens {
            let part = mul_div(*amount, numerator, denominator, "bundle share")?;
            set_or_remove(&mut out.tokens, id, part);
        }
        Ok(out)
    }

    /// Value in the common price unit
    pub fn value(
        &self,
        rates: &FinalExchangeRates,
        native_token: &TokenId,
    ) -> Result<u128, PortalError> {
        let mut total = if self.native > 0 {
            rates.value_of(native_token, self.native)?
        } else {
            0
        };
        for (id, amount) in &self.tokens {
            if *amount == 0 {
                continue;
            }
            total = total
                .checked_add(rates.value_of(id, *amount)?)
                .ok_or(PortalError::ArithmeticOverflow("bundle value"))?;
        }
        Ok(total)
    }

    /// Draws collateral worth `value` out of `self`, native first.
    ///
    /// Returns the drawn bundle and the part of `value` left uncovered
    /// (non-zero only when `self` is worth less than `value`).
    pub fn draw(
        &self,
        value: u128,
        rates: &FinalExchangeRates,
        native_token: &TokenId,
    ) -> Result<(CollateralBundle, u128), PortalError> {
        let mut remaining = value;
        let mut drawn = CollateralBundle::default();

        if remaining > 0 && self.native > 0 {
            let price = u128::from(rates.price(native_token)?);
            let take = div_ceil(remaining, price).min(u128::from(self.native));
            drawn.native = to_u64(take, "draw native")?;
            remaining = remaining.saturating_sub(take * price);
        }
        for (id, available) in &self.tokens {
            if remaining == 0 {
                break;
            }
            if *available == 0 {
                continue;
            }
            let price = u128::from(rates.price(id)?);
            let take = div_ceil(remaining, price).min(u128::from(*available));
            set_or_remove(&mut drawn.tokens, id, to_u64(take, "draw token")?);
            remaining = remaining.saturating_sub(take * price);
        }
        Ok((drawn, remaining))
    }
}
