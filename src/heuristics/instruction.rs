use super::PatternRule;
use crate::model::{Currency, DiscountType, InvoiceSnapshot};
use crate::money::{clamp_percent, round_currency, sanitize_price, sanitize_quantity};
use crate::update::{Adjustments, ItemInput, Patch, StructuredInvoiceUpdate, UpdateSet};
use tracing::debug;

/// Accumulates what the rules matched; later rules overwrite earlier ones.
#[derive(Default)]
struct Builder {
    set: UpdateSet,
    adjustments: Adjustments,
    add_items: Vec<ItemInput>,
    remove_items: Vec<String>,
}

impl Builder {
    fn finish(self) -> StructuredInvoiceUpdate {
        StructuredInvoiceUpdate {
            set: (!self.set.is_empty()).then_some(self.set),
            adjustments: (!self.adjustments.is_empty()).then_some(self.adjustments),
            add_items: self.add_items,
            update_items: Vec::new(),
            remove_items: self.remove_items,
        }
    }
}

type RuleFn = fn(&str, &InvoiceSnapshot, &mut Builder) -> bool;

/// Rules in evaluation order.
const RULES: &[(&str, RuleFn)] = &[
    ("direct_tax", direct_tax),
    ("relative_tax", relative_tax),
    ("percent_discount", percent_discount),
    ("fixed_discount", fixed_discount),
    ("relative_discount_rate", relative_discount_rate),
    ("relative_discount_amount", relative_discount_amount),
    ("remove_discount", remove_discount),
    ("append_note", append_note),
    ("due_date", due_date),
    ("issue_date", issue_date),
    ("currency", currency),
    ("add_item", add_item),
    ("remove_item", remove_item),
];

/// Deterministic rule-based translation of an edit instruction.
///
/// Instructions no rule understands produce an empty update.
pub fn fallback_structured_update(
    instruction: &str,
    invoice: &InvoiceSnapshot,
) -> StructuredInvoiceUpdate {
    let text = instruction.trim();
    let mut builder = Builder::default();
    let mut matched = Vec::new();

    for (name, rule) in RULES {
        if rule(text, invoice, &mut builder) {
            matched.push(*name);
        }
    }

    debug!(rules = ?matched, "Fallback instruction rules matched");
    builder.finish()
}

// ---------------------------------------------------------------------------
// Tax
// ---------------------------------------------------------------------------

static DIRECT_TAX: PatternRule = PatternRule::new(
    "direct_tax",
    r"(?i)(?:tax|gst|vat)(?:\s*rate)?\s*(?:to|=|at|is|of)?\s*(\d+(?:\.\d+)?)\s*%?",
);
static INCREASE_TAX: PatternRule = PatternRule::new(
    "increase_tax",
    r"(?i)(?:increase|raise)\s+(?:tax|gst|vat)(?:\s*rate)?\s+by\s+(\d+(?:\.\d+)?)\s*%?",
);
static DECREASE_TAX: PatternRule = PatternRule::new(
    "decrease_tax",
    r"(?i)(?:decrease|reduce|lower)\s+(?:tax|gst|vat)(?:\s*rate)?\s+by\s+(\d+(?:\.\d+)?)\s*%?",
);

fn direct_tax(text: &str, _: &InvoiceSnapshot, out: &mut Builder) -> bool {
    let Some(rate) = DIRECT_TAX.number(text) else {
        return false;
    };
    out.set.tax_rate = Patch::Value(clamp_percent(rate));
    true
}

fn relative_tax(text: &str, _: &InvoiceSnapshot, out: &mut Builder) -> bool {
    let mut matched = false;
    if let Some(delta) = INCREASE_TAX.number(text) {
        out.adjustments.tax_rate_delta = Some(delta.abs());
        matched = true;
    }
    if let Some(delta) = DECREASE_TAX.number(text) {
        out.adjustments.tax_rate_delta = Some(-delta.abs());
        matched = true;
    }
    matched
}

// ---------------------------------------------------------------------------
// Discount
// ---------------------------------------------------------------------------

static PERCENT_DISCOUNT: [PatternRule; 2] = [
    PatternRule::new(
        "set_discount_percent",
        r"(?i)(?:set|change|apply|add)\s+(?:a\s+)?(?:discount|discount rate)\s*(?:to|at|=|of)?\s*(\d+(?:\.\d+)?)\s*%",
    ),
    PatternRule::new("percent_discount", r"(?i)(\d+(?:\.\d+)?)\s*%\s*discount"),
];
static FIXED_DISCOUNT: [PatternRule; 2] = [
    PatternRule::new(
        "set_discount_amount",
        r"(?i)(?:set|change|apply|add)\s+(?:a\s+)?(?:discount|discount amount)\s*(?:to|at|=|of)?\s*(?:USD|EUR|GBP|INR|\$|€|£|₹)?\s*(\d+(?:\.\d+)?)",
    ),
    PatternRule::new(
        "discount_of_amount",
        r"(?i)discount\s+of\s+(?:USD|EUR|GBP|INR|\$|€|£|₹)?\s*(\d+(?:\.\d+)?)",
    ),
];
static INCREASE_DISCOUNT_RATE: PatternRule = PatternRule::new(
    "increase_discount_rate",
    r"(?i)(?:increase|raise)\s+(?:discount|discount rate)\s+by\s+(\d+(?:\.\d+)?)\s*%",
);
static DECREASE_DISCOUNT_RATE: PatternRule = PatternRule::new(
    "decrease_discount_rate",
    r"(?i)(?:decrease|reduce|lower)\s+(?:discount|discount rate)\s+by\s+(\d+(?:\.\d+)?)\s*%",
);
static INCREASE_DISCOUNT_AMOUNT: PatternRule = PatternRule::new(
    "increase_discount_amount",
    r"(?i)(?:increase|raise)\s+(?:discount amount|discount)\s+by\s+(?:USD|EUR|GBP|INR|\$|€|£|₹)?\s*(\d+(?:\.\d+)?)",
);
static DECREASE_DISCOUNT_AMOUNT: PatternRule = PatternRule::new(
    "decrease_discount_amount",
    r"(?i)(?:decrease|reduce|lower)\s+(?:discount amount|discount)\s+by\s+(?:USD|EUR|GBP|INR|\$|€|£|₹)?\s*(\d+(?:\.\d+)?)",
);
static REMOVE_DISCOUNT: [PatternRule; 2] = [
    PatternRule::new("remove_discount", r"(?i)(?:remove|clear)\s+(?:the\s+)?discount"),
    PatternRule::new("no_discount", r"(?i)(?:no|without)\s+discount"),
];

fn percent_discount(text: &str, _: &InvoiceSnapshot, out: &mut Builder) -> bool {
    let Some(rate) = super::first_number(&PERCENT_DISCOUNT, text) else {
        return false;
    };
    out.set.discount_type = Patch::Value(DiscountType::Percentage);
    out.set.discount_rate = Patch::Value(clamp_percent(rate));
    true
}

fn fixed_discount(text: &str, _: &InvoiceSnapshot, out: &mut Builder) -> bool {
    let Some(amount) = super::first_number_without_percent(&FIXED_DISCOUNT, text) else {
        return false;
    };
    out.set.discount_type = Patch::Value(DiscountType::Fixed);
    out.set.discount_amount = Patch::Value(round_currency(amount.abs()));
    true
}

fn relative_discount_rate(text: &str, _: &InvoiceSnapshot, out: &mut Builder) -> bool {
    let mut matched = false;
    if let Some(delta) = INCREASE_DISCOUNT_RATE.number(text) {
        out.adjustments.discount_rate_delta = Some(delta.abs());
        matched = true;
    }
    if let Some(delta) = DECREASE_DISCOUNT_RATE.number(text) {
        out.adjustments.discount_rate_delta = Some(-delta.abs());
        matched = true;
    }
    matched
}

fn relative_discount_amount(text: &str, _: &InvoiceSnapshot, out: &mut Builder) -> bool {
    let mut matched = false;
    if let Some(delta) = INCREASE_DISCOUNT_AMOUNT.number_without_percent(text) {
        out.adjustments.discount_amount_delta = Some(delta.abs());
        matched = true;
    }
    if let Some(delta) = DECREASE_DISCOUNT_AMOUNT.number_without_percent(text) {
        out.adjustments.discount_amount_delta = Some(-delta.abs());
        matched = true;
    }
    if matched {
        out.set.discount_type = Patch::Value(DiscountType::Fixed);
    }
    matched
}

fn remove_discount(text: &str, _: &InvoiceSnapshot, out: &mut Builder) -> bool {
    if !super::any_match(&REMOVE_DISCOUNT, text) {
        return false;
    }
    out.set.discount_type = Patch::Value(DiscountType::Percentage);
    out.set.discount_rate = Patch::Value(0.0);
    out.set.discount_amount = Patch::Value(0.0);
    true
}

// ---------------------------------------------------------------------------
// Notes, dates, currency
// ---------------------------------------------------------------------------

static APPEND_NOTE: PatternRule = PatternRule::new(
    "append_note",
    r"(?i)(?:add|append)\s+notes?\s*[:\-]?\s*(.+)$",
);
static DUE_DATE: PatternRule = PatternRule::new(
    "due_date",
    r"(?i)(?:set|change|move)\s+(?:the\s+)?due\s+date\s+(?:to|on)?\s*[:\-]?\s*(.+)$",
);
static ISSUE_DATE: PatternRule = PatternRule::new(
    "issue_date",
    r"(?i)(?:set|change|move)\s+(?:the\s+)?issue\s+date\s+(?:to|on)?\s*[:\-]?\s*(.+)$",
);
static CURRENCY: PatternRule = PatternRule::new(
    "currency",
    r"(?i)(?:set|change)\s+(?:the\s+)?currency\s+(?:to)?\s*(USD|EUR|GBP|INR)",
);

/// The note is appended to whatever the invoice already says.
fn append_note(text: &str, invoice: &InvoiceSnapshot, out: &mut Builder) -> bool {
    let Some(note) = captured_text(&APPEND_NOTE, text) else {
        return false;
    };
    let existing = invoice.notes.trim_end();
    let notes = if existing.is_empty() {
        note
    } else {
        format!("{existing}\n{note}")
    };
    out.set.notes = Patch::Value(notes);
    true
}

fn due_date(text: &str, _: &InvoiceSnapshot, out: &mut Builder) -> bool {
    let Some(raw) = captured_text(&DUE_DATE, text) else {
        return false;
    };
    out.set.due_date = Patch::Value(raw);
    true
}

fn issue_date(text: &str, _: &InvoiceSnapshot, out: &mut Builder) -> bool {
    let Some(raw) = captured_text(&ISSUE_DATE, text) else {
        return false;
    };
    out.set.issue_date = Patch::Value(raw);
    true
}

fn currency(text: &str, _: &InvoiceSnapshot, out: &mut Builder) -> bool {
    let Some(code) = CURRENCY.captures(text).and_then(|c| Currency::from_code(&c[1])) else {
        return false;
    };
    out.set.currency = Patch::Value(code);
    true
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

static ADD_ITEM: PatternRule = PatternRule::new(
    "add_item",
    r"(?i)(?:add|include)\s+(?:an?\s+)?item\s*[:\-]?\s*(.+?)\s+x\s*(\d+(?:\.\d+)?)\s*@\s*(\d+(?:\.\d+)?)",
);
static REMOVE_ITEM: PatternRule = PatternRule::new(
    "remove_item",
    r#"(?i)(?:remove|delete)\s+(?:the\s+)?item\s*[:\-]?\s*["“]?([^"”]+)["”]?"#,
);

fn add_item(text: &str, _: &InvoiceSnapshot, out: &mut Builder) -> bool {
    let Some(caps) = ADD_ITEM.captures(text) else {
        return false;
    };
    let name = caps[1].trim();
    let (Ok(quantity), Ok(unit_price)) = (caps[2].parse::<f64>(), caps[3].parse::<f64>()) else {
        return false;
    };
    if name.is_empty() {
        return false;
    }
    out.add_items = vec![ItemInput {
        name: name.to_string(),
        description: String::new(),
        quantity: f64::from(sanitize_quantity(quantity)),
        unit_price: sanitize_price(unit_price),
    }];
    true
}

fn remove_item(text: &str, _: &InvoiceSnapshot, out: &mut Builder) -> bool {
    let Some(target) = captured_text(&REMOVE_ITEM, text) else {
        return false;
    };
    out.remove_items = vec![target];
    true
}

fn captured_text(rule: &PatternRule, text: &str) -> Option<String> {
    let caps = rule.captures(text)?;
    let value = caps.get(1)?.as_str().trim();
    (!value.is_empty()).then(|| value.to_string())
}
