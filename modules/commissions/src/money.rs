//! Decimal money helpers
//!
//! All amounts are `rust_decimal::Decimal` values in major units ("49.99").
//! Rounding always goes to the currency's minor unit using round-half-up.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::PaymentMethod;

/// Upper-cased ISO-style code, `None` unless it is exactly three ASCII letters
pub fn normalize_currency(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code.to_ascii_uppercase())
    } else {
        None
    }
}

/// Number of decimal places in the currency's minor unit
pub fn minor_unit_scale(currency: &str) -> u32 {
    match currency.to_ascii_uppercase().as_str() {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" => 0,
        "BTC" | "ETH" | "LTC" => 8,
        _ => 2,
    }
}

/// Round half-up to the currency's minor unit.
///
/// Money amounts handled here are never negative, so "away from zero" at the
/// midpoint is the same as half-up.
pub fn round_to_minor(amount: Decimal, currency: &str) -> Decimal {
    let scale = minor_unit_scale(currency);
    let mut rounded = amount.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    // Pad so 25 renders as "25.00"
    rounded.rescale(scale);
    rounded
}

/// `amount * percent / 100`, rounded to the minor unit
pub fn percent_of(amount: Decimal, percent: Decimal, currency: &str) -> Decimal {
    round_to_minor(amount * percent / Decimal::ONE_HUNDRED, currency)
}

/// Payout fee schedule, in the payout's own currency.
///
/// - PayPal: 3%
/// - Bank transfer: 2%, capped at 5 units
/// - Crypto: 1%
/// - Anything else: free
pub fn payout_fee(method: &PaymentMethod, amount: Decimal, currency: &str) -> Decimal {
    let fee = match method {
        PaymentMethod::Paypal => amount * Decimal::new(3, 2),
        PaymentMethod::BankTransfer => (amount * Decimal::new(2, 2)).min(Decimal::new(5, 0)),
        PaymentMethod::Crypto => amount * Decimal::new(1, 2),
        PaymentMethod::Other(_) => Decimal::ZERO,
    };
    round_to_minor(fee, currency)
}

/// Gross / fee / net split for a payout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub total: Decimal,
    pub fee: Decimal,
    pub net: Decimal,
}

pub fn fee_breakdown(method: &PaymentMethod, total: Decimal, currency: &str) -> FeeBreakdown {
    let fee = payout_fee(method, total, currency);
    FeeBreakdown {
        total,
        fee,
        net: total - fee,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn commission_is_exact() {
        // Repeated runs must give exactly the same value
        for _ in 0..100 {
            assert_eq!(percent_of(d("250.00"), d("10"), "USD"), d("25.00"));
        }
        assert_eq!(percent_of(d("19.99"), d("15"), "USD"), d("3.00"));
        assert_eq!(percent_of(d("0.10"), d("33.3333"), "USD"), d("0.03"));
    }

    #[test]
    fn rounds_half_up_to_minor_unit() {
        assert_eq!(round_to_minor(d("1.005"), "USD"), d("1.01"));
        assert_eq!(round_to_minor(d("1.004"), "USD"), d("1.00"));
        assert_eq!(round_to_minor(d("1499.5"), "JPY"), d("1500"));
        assert_eq!(round_to_minor(d("0.123456785"), "BTC"), d("0.12345679"));
    }

    #[test]
    fn fee_schedule() {
        let hundred = d("100");

        let bank = fee_breakdown(&PaymentMethod::BankTransfer, hundred, "USD");
        assert_eq!(bank.fee, d("2"));
        assert_eq!(bank.net, d("98"));

        let paypal = fee_breakdown(&PaymentMethod::Paypal, hundred, "USD");
        assert_eq!(paypal.fee, d("3"));
        assert_eq!(paypal.net, d("97"));

        let crypto = fee_breakdown(&PaymentMethod::Crypto, hundred, "USD");
        assert_eq!(crypto.fee, d("1"));
        assert_eq!(crypto.net, d("99"));

        let other = fee_breakdown(&PaymentMethod::Other("gift_card".into()), hundred, "USD");
        assert_eq!(other.fee, Decimal::ZERO);
        assert_eq!(other.net, hundred);
    }

    #[test]
    fn bank_transfer_fee_is_capped() {
        assert_eq!(payout_fee(&PaymentMethod::BankTransfer, d("1000"), "USD"), d("5"));
        assert_eq!(payout_fee(&PaymentMethod::BankTransfer, d("250"), "USD"), d("5"));
        assert_eq!(payout_fee(&PaymentMethod::BankTransfer, d("249.99"), "USD"), d("5.00"));
        assert_eq!(payout_fee(&PaymentMethod::BankTransfer, d("50.55"), "USD"), d("1.01"));
    }

    #[test]
    fn fee_rounds_to_payout_currency() {
        let crypto = fee_breakdown(&PaymentMethod::Crypto, d("0.12345678"), "BTC");
        assert_eq!(crypto.fee, d("0.00123457"));
        assert_eq!(crypto.net, d("0.12222221"));

        let paypal = fee_breakdown(&PaymentMethod::Paypal, d("1999"), "JPY");
        assert_eq!(paypal.fee, d("60"));
        assert_eq!(paypal.net, d("1939"));
    }

    #[test]
    fn currency_codes_are_normalized() {
        assert_eq!(normalize_currency(" usd "), Some("USD".to_string()));
        assert_eq!(normalize_currency("btc"), Some("BTC".to_string()));
        assert_eq!(normalize_currency("US"), None);
        assert_eq!(normalize_currency("U5D"), None);
    }
}
