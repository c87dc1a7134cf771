// src/money.rs

use crate::model::{DiscountType, LineItem};

/// Round a currency amount to 2 decimal places (half away from zero).
pub fn round_currency(value: f64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let rounded = (value * 100.0).round() / 100.0;
    // avoid leaking "-0.00" into persisted values
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// Coerce a percentage into `[0, 100]`, rounded to 2 decimals.
pub fn clamp_percent(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    round_currency(value).clamp(0.0, 100.0)
}

/// Coerce an amount into `[0, round(max)]`, rounded to 2 decimals.
pub fn clamp_amount(value: f64, max: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let ceiling = round_currency(max).max(0.0);
    round_currency(value).clamp(0.0, ceiling)
}

pub fn sanitize_quantity(value: f64) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 1;
    }
    let rounded = value.round();
    if rounded >= u32::MAX as f64 {
        u32::MAX
    } else {
        (rounded as u32).max(1)
    }
}

pub fn sanitize_price(value: f64) -> f64 {
    if !value.is_finite() || value < 0.0 {
        return 0.0;
    }
    round_currency(value)
}

/// Line total for an already-sanitized quantity and unit price.
pub fn line_total(quantity: u32, unit_price: f64) -> f64 {
    round_currency(quantity as f64 * unit_price)
}

/// Everything derived from the item list, the discount and the tax rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvoiceTotals {
    pub subtotal: f64,
    pub discount_type: DiscountType,
    pub discount_rate: f64,
    pub discount_amount: f64,
    pub tax_rate: f64,
    pub tax_amount: f64,
    pub total: f64,
}

impl InvoiceTotals {
    /// Recompute subtotal, discount, tax and total.
    ///
    /// For `Percentage` the amount follows from the rate; for `Fixed` the
    /// amount is clamped to the subtotal and the rate is derived back from
    /// it. The derived rate is rounded, so a rate that started as a round
    /// number can drift after a percentage → fixed → percentage cycle.
    pub fn compute(
        items: &[LineItem],
        discount_type: DiscountType,
        discount_rate: f64,
        discount_amount: f64,
        tax_rate: f64,
    ) -> Self {
        let subtotal = round_currency(items.iter().map(|item| item.line_total).sum());

        let (discount_rate, discount_amount) = match discount_type {
            DiscountType::Percentage => {
                let rate = clamp_percent(discount_rate);
                (rate, round_currency(subtotal * rate / 100.0))
            }
            DiscountType::Fixed => {
                let amount = clamp_amount(discount_amount, subtotal);
                let rate = if subtotal > 0.0 {
                    round_currency(amount / subtotal * 100.0)
                } else {
                    0.0
                };
                (rate, amount)
            }
        };

        let tax_rate = clamp_percent(tax_rate);
        let taxable_subtotal = round_currency(subtotal - discount_amount);
        let tax_amount = round_currency(taxable_subtotal * tax_rate / 100.0);
        let total = round_currency(taxable_subtotal + tax_amount);

        Self {
            subtotal,
            discount_type,
            discount_rate,
            discount_amount,
            tax_rate,
            tax_amount,
            total,
        }
    }
}
