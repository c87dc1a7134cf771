// src/applier.rs

use crate::heuristics::{DEFAULT_ITEM_NAME, normalize_date};
use crate::model::{DiscountType, InvoiceSnapshot, InvoiceStatus, LineItem};
use crate::money::{InvoiceTotals, clamp_percent, round_currency, sanitize_price, sanitize_quantity};
use crate::update::{Adjustments, ItemUpdate, Patch, StructuredInvoiceUpdate, UpdateSet};

const ADDED_ITEM_NAME: &str = "Service";

/// Merge a structured update into a snapshot and recompute every total.
///
/// Pure and infallible: a field the update gets wrong keeps its prior
/// value. The returned snapshot is complete and marked `Ready`.
pub fn apply_structured_invoice_update(
    invoice: &InvoiceSnapshot,
    update: &StructuredInvoiceUpdate,
) -> InvoiceSnapshot {
    let empty_set = UpdateSet::default();
    let set = update.set.as_ref().unwrap_or(&empty_set);
    let empty_adjustments = Adjustments::default();
    let adjustments = update.adjustments.as_ref().unwrap_or(&empty_adjustments);

    let items = resolve_items(&invoice.items, update);

    let mut tax_rate = match set.tax_rate {
        Patch::Value(rate) => clamp_percent(rate),
        _ => clamp_percent(invoice.tax_rate),
    };
    if let Some(delta) = adjustments.tax_rate_delta {
        tax_rate = clamp_percent(tax_rate + delta);
    }

    let (discount_type, discount_rate, discount_amount) =
        resolve_discount(invoice, set, adjustments);
    let totals =
        InvoiceTotals::compute(&items, discount_type, discount_rate, discount_amount, tax_rate);

    InvoiceSnapshot {
        id: invoice.id.clone(),
        status: InvoiceStatus::Ready,
        title: resolve_text(&set.title, &invoice.title),
        invoice_number: invoice.invoice_number.clone(),
        currency: set.currency.value().copied().unwrap_or(invoice.currency),
        issue_date: resolve_date(&set.issue_date, &invoice.issue_date),
        due_date: resolve_date(&set.due_date, &invoice.due_date),
        from_name: resolve_text(&set.from_name, &invoice.from_name),
        from_email: resolve_text(&set.from_email, &invoice.from_email),
        from_address: resolve_text(&set.from_address, &invoice.from_address),
        bill_to_name: resolve_text(&set.bill_to_name, &invoice.bill_to_name),
        bill_to_email: resolve_text(&set.bill_to_email, &invoice.bill_to_email),
        bill_to_address: resolve_text(&set.bill_to_address, &invoice.bill_to_address),
        notes: match &set.notes {
            Patch::Value(notes) => notes.clone(),
            Patch::Null => String::new(),
            Patch::Absent => invoice.notes.clone(),
        },
        discount_type: totals.discount_type,
        discount_rate: totals.discount_rate,
        discount_amount: totals.discount_amount,
        tax_rate: totals.tax_rate,
        subtotal: totals.subtotal,
        tax_amount: totals.tax_amount,
        total: totals.total,
        items,
        prompt: invoice.prompt.clone(),
        source_text: invoice.source_text.clone(),
    }
}

fn names_match(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Trimmed replacement when non-blank, else the fallback.
fn non_blank_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn resolve_text(patch: &Patch<String>, prior: &str) -> String {
    match patch {
        Patch::Value(value) => non_blank_or(value, prior),
        _ => prior.to_string(),
    }
}

fn resolve_date(patch: &Patch<String>, prior: &str) -> String {
    patch
        .value()
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| normalize_date(raw))
        .unwrap_or_else(|| prior.to_string())
}

// remove → update → add, then never leave the invoice without items
fn resolve_items(existing: &[LineItem], update: &StructuredInvoiceUpdate) -> Vec<LineItem> {
    let mut items: Vec<LineItem> = existing
        .iter()
        .filter(|item| {
            !update
                .remove_items
                .iter()
                .any(|target| names_match(&item.name, target))
        })
        .map(LineItem::normalized)
        .collect();

    for change in &update.update_items {
        if let Some(item) = items
            .iter_mut()
            .find(|item| names_match(&item.name, &change.target_name))
        {
            *item = apply_item_update(item, change);
        }
    }

    for added in &update.add_items {
        items.push(LineItem::new(
            non_blank_or(&added.name, ADDED_ITEM_NAME),
            added.description.clone(),
            added.quantity,
            added.unit_price,
        ));
    }

    if items.is_empty() {
        items.push(LineItem::new(DEFAULT_ITEM_NAME, "", 1.0, 0.0));
    }
    items
}

fn apply_item_update(current: &LineItem, change: &ItemUpdate) -> LineItem {
    let quantity = match change.quantity {
        Patch::Value(q) => sanitize_quantity(q),
        _ => current.quantity,
    };
    let unit_price = match change.unit_price {
        Patch::Value(p) => sanitize_price(p),
        _ => current.unit_price,
    };
    let description = match &change.description {
        Patch::Value(d) => d.clone(),
        Patch::Null => String::new(),
        Patch::Absent => current.description.clone(),
    };
    LineItem::new(
        resolve_text(&change.name, &current.name),
        description,
        f64::from(quantity),
        unit_price,
    )
}

/// Type, rate and amount before they are reconciled against the subtotal.
fn resolve_discount(
    invoice: &InvoiceSnapshot,
    set: &UpdateSet,
    adjustments: &Adjustments,
) -> (DiscountType, f64, f64) {
    let mut discount_type = set
        .discount_type
        .value()
        .copied()
        .unwrap_or(invoice.discount_type);
    let mut rate = clamp_percent(
        set.discount_rate
            .value()
            .copied()
            .unwrap_or(invoice.discount_rate),
    );
    let mut amount = round_currency(
        set.discount_amount
            .value()
            .copied()
            .unwrap_or(invoice.discount_amount)
            .max(0.0),
    );

    if !set.discount_type.is_value() {
        if set.discount_rate.is_value() {
            discount_type = DiscountType::Percentage;
        } else if set.discount_amount.is_value() {
            discount_type = DiscountType::Fixed;
        }
    }

    if let Some(delta) = adjustments.discount_rate_delta {
        discount_type = DiscountType::Percentage;
        rate = clamp_percent(rate + delta);
    }
    if let Some(delta) = adjustments.discount_amount_delta {
        discount_type = DiscountType::Fixed;
        amount = round_currency((amount + delta).max(0.0));
    }

    (discount_type, rate, amount)
}
