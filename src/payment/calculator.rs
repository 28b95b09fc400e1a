use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Minor-unit precision of the settlement currency (paise)
const MINOR_UNIT_DP: u32 = 2;

/// Full payment breakdown for a gross basis. `net + commission + tax` always
/// equals `gross` to the paisa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentBreakdown {
    pub gross: Decimal,
    pub commission: Decimal,
    pub tax: Decimal,
    pub net: Decimal,
}

/// Compute the commission/tax/net split for a gross amount. Commission and
/// tax are both taken on gross independently, never compounded. Stateless and
/// deterministic; a zero gross yields an all-zero breakdown.
pub fn compute(
    gross_amount: Decimal,
    commission_rate_pct: Decimal,
    tax_rate_pct: Decimal,
) -> PaymentBreakdown {
    let gross = round_minor(gross_amount);
    let commission = round_minor(gross * commission_rate_pct / dec!(100));
    let tax = round_minor(gross * tax_rate_pct / dec!(100));
    let net = gross - commission - tax;

    PaymentBreakdown {
        gross,
        commission,
        tax,
        net,
    }
}

/// Round to the currency minor unit, banker's rounding
fn round_minor(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MINOR_UNIT_DP, RoundingStrategy::MidpointNearestEven)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakdown_identity() {
        // net + commission + tax == gross for a spread of inputs
        let cases = [
            (dec!(210000), dec!(2), dec!(5)),
            (dec!(193200), dec!(2), dec!(5)),
            (dec!(0.01), dec!(2.5), dec!(18)),
            (dec!(99999.99), dec!(0), dec!(0)),
            (dec!(12345.67), dec!(1.75), dec!(12.5)),
        ];

        for (gross, commission_pct, tax_pct) in cases {
            let b = compute(gross, commission_pct, tax_pct);
            assert_eq!(b.net + b.commission + b.tax, b.gross);
        }
    }

    #[test]
    fn test_zero_gross_is_all_zero() {
        let b = compute(dec!(0), dec!(2), dec!(5));
        assert_eq!(b.gross, dec!(0));
        assert_eq!(b.commission, dec!(0.00));
        assert_eq!(b.tax, dec!(0.00));
        assert_eq!(b.net, dec!(0));
    }

    #[test]
    fn test_rates_apply_to_gross_independently() {
        // 2% and 5% of 210000, not compounded
        let b = compute(dec!(210000), dec!(2), dec!(5));
        assert_eq!(b.commission, dec!(4200.00));
        assert_eq!(b.tax, dec!(10500.00));
        assert_eq!(b.net, dec!(195300.00));
    }

    #[test]
    fn test_round_half_even_on_minor_unit() {
        // 0.125 rounds to 0.12, 0.135 rounds to 0.14
        assert_eq!(round_minor(dec!(0.125)), dec!(0.12));
        assert_eq!(round_minor(dec!(0.135)), dec!(0.14));

        // 1% of 12.50 = 0.125 -> banker's rounding lands on 0.12
        let b = compute(dec!(12.50), dec!(1), dec!(0));
        assert_eq!(b.commission, dec!(0.12));
    }

    #[test]
    fn test_deterministic() {
        let a = compute(dec!(193200), dec!(2), dec!(5));
        let b = compute(dec!(193200), dec!(2), dec!(5));
        assert_eq!(a, b);
    }
}
