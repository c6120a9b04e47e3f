// ===============================
// src/risk.rs
// ===============================
//
// Pre-trade checks on operator input. Rejections are values, logged at warn
// by the caller; nothing here touches the store or the network.
//
use thiserror::Error;

use crate::config::Limits;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RiskError {
    #[error("malformed security id {0:?}")]
    BadIsin(String),
    #[error("quantity must be positive")]
    NonPositiveQty,
    #[error("quantity {qty} above limit {max}")]
    QtyLimit { qty: i64, max: i64 },
    #[error("deposit amount must be non-zero")]
    ZeroDeposit,
    #[error("deposit amount {amount} above limit {max}")]
    DepositLimit { amount: i64, max: i64 },
}

/// MOEX SECIDs for bonds: ISIN-like, 3..=12 upper-case alphanumerics.
fn valid_isin(isin: &str) -> bool {
    (3..=12).contains(&isin.len()) && isin.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Normalises the id (trim + upper-case) and checks the quantity.
pub fn check_purchase(isin: &str, qty: i64, lim: &Limits) -> Result<String, RiskError> {
    let isin = isin.trim().to_ascii_uppercase();
    if !valid_isin(&isin) {
        return Err(RiskError::BadIsin(isin));
    }
    if qty <= 0 {
        return Err(RiskError::NonPositiveQty);
    }
    if qty > lim.max_purchase_qty {
        return Err(RiskError::QtyLimit { qty, max: lim.max_purchase_qty });
    }
    Ok(isin)
}

/// Negative amounts are withdrawals; the overdraft check is the ledger's.
pub fn check_deposit(amount: i64, lim: &Limits) -> Result<(), RiskError> {
    if amount == 0 {
        return Err(RiskError::ZeroDeposit);
    }
    if amount.unsigned_abs() > lim.max_deposit.unsigned_abs() {
        return Err(RiskError::DepositLimit { amount, max: lim.max_deposit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lim() -> Limits {
        Limits { max_purchase_qty: 100, max_deposit: 1_000_000 }
    }

    #[test]
    fn purchase_input_is_normalised_and_bounded() {
        assert_eq!(check_purchase(" ru000a0jx0j2 ", 5, &lim()), Ok("RU000A0JX0J2".to_string()));
        assert_eq!(check_purchase("RU-1", 5, &lim()), Err(RiskError::BadIsin("RU-1".into())));
        assert_eq!(check_purchase("RU0001", 0, &lim()), Err(RiskError::NonPositiveQty));
        assert_eq!(check_purchase("RU0001", 101, &lim()), Err(RiskError::QtyLimit { qty: 101, max: 100 }));
    }

    #[test]
    fn deposits_must_be_non_zero_and_bounded() {
        assert!(check_deposit(500, &lim()).is_ok());
        assert!(check_deposit(-500, &lim()).is_ok());
        assert_eq!(check_deposit(0, &lim()), Err(RiskError::ZeroDeposit));
        assert!(matches!(check_deposit(-2_000_000, &lim()), Err(RiskError::DepositLimit { .. })));
    }
}
