use super::{
    LabelRule, PatternRule, any_match, first_number, first_number_without_percent,
    parse_calendar_date,
};
use crate::model::{Currency, DiscountType, InvoiceDraft, LineItem};
use crate::money::{InvoiceTotals, clamp_percent};
use rand::Rng;
use time::{Duration, OffsetDateTime};
use tracing::debug;

pub const DEFAULT_ITEM_NAME: &str = "Professional Services";
const DEFAULT_ITEM_DESCRIPTION: &str = "Generated from chat prompt";
const DEFAULT_ITEM_PRICE: f64 = 500.0;
const DEFAULT_DUE_DAYS: i64 = 14;

/// Input to the draft extractor.
#[derive(Debug, Clone, Default)]
pub struct DraftRequest {
    pub prompt: String,
    pub extracted_text: String,
    pub default_from_name: Option<String>,
    pub default_from_email: Option<String>,
}

impl DraftRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Rule tables, evaluated in declaration order
// ---------------------------------------------------------------------------

static ISSUE_DATE: LabelRule = LabelRule::new("issue_date", &["issue date", "invoice date", "date"]);
static DUE_DATE: LabelRule = LabelRule::new("due_date", &["due date", "payment due"]);

static FROM_NAME: LabelRule = LabelRule::new("from_name", &["from", "sender", "company"]);
static FROM_EMAIL: LabelRule = LabelRule::new("from_email", &["from email", "sender email"]);
static FROM_ADDRESS: LabelRule = LabelRule::new(
    "from_address",
    &["from address", "sender address", "company address"],
);
static BILL_TO_NAME: LabelRule = LabelRule::new("bill_to_name", &["bill to", "client", "to"]);
static BILL_TO_EMAIL: LabelRule = LabelRule::new(
    "bill_to_email",
    &["bill to email", "client email", "to email"],
);
static BILL_TO_ADDRESS: LabelRule = LabelRule::new(
    "bill_to_address",
    &["bill to address", "client address", "to address"],
);
static NOTES: LabelRule = LabelRule::new("notes", &["notes", "note", "memo"]);
static TITLE: LabelRule = LabelRule::new("title", &["title", "invoice title", "invoice"]);

static EMAIL: PatternRule = PatternRule::new(
    "email",
    r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}",
);

static TITLE_FOR: PatternRule = PatternRule::new("title_for", r"(?i)invoice\s+(?:for|to)\s+([^\n,.]+)");

static CURRENCY_RULES: [(Currency, PatternRule); 3] = [
    (Currency::Eur, PatternRule::new("currency_eur", r"(?i)EUR|€")),
    (Currency::Gbp, PatternRule::new("currency_gbp", r"(?i)GBP|£")),
    (Currency::Inr, PatternRule::new("currency_inr", r"(?i)INR|₹")),
];

// "- Design work x2 @ 150"
static ITEM_LINE: PatternRule = PatternRule::new(
    "item_line",
    r"(?i)^[-*]?\s*(.+?)\s+x\s*(\d+(?:\.\d+)?)\s*@\s*(?:USD|EUR|GBP|INR|\$|€|£|₹)?\s*(\d+(?:\.\d+)?)",
);

static NO_TAX: PatternRule = PatternRule::new("no_tax", r"(?i)(?:no|without)\s+(?:tax|gst|vat)");
static TAX_RATE: [PatternRule; 2] = [
    PatternRule::new(
        "tax_labelled",
        r"(?i)(?:tax|gst|vat)(?:\s*rate)?\s*(?:to|=|at|is|of|:|-)?\s*(\d+(?:\.\d+)?)\s*%?",
    ),
    PatternRule::new("tax_suffixed", r"(?i)(\d+(?:\.\d+)?)\s*%\s*(?:tax|gst|vat)"),
];

static NO_DISCOUNT: [PatternRule; 3] = [
    PatternRule::new("no_discount", r"(?i)(?:no|without)\s+discount"),
    PatternRule::new("discount_none", r"(?i)discount\s*[:\-]?\s*none"),
    PatternRule::new("remove_discount", r"(?i)remove\s+discount"),
];
static PERCENT_DISCOUNT: [PatternRule; 2] = [
    PatternRule::new(
        "discount_percent_labelled",
        r"(?i)discount(?:\s*rate)?\s*(?:to|=|at|is|of|:|-)?\s*(\d+(?:\.\d+)?)\s*%",
    ),
    PatternRule::new("discount_percent_suffixed", r"(?i)(\d+(?:\.\d+)?)\s*%\s*discount"),
];
static FIXED_DISCOUNT: [PatternRule; 2] = [
    PatternRule::new(
        "discount_fixed_labelled",
        r"(?i)discount(?:\s*(?:amount|value))?\s*(?:to|=|at|is|of|:|-)?\s*(?:USD|EUR|GBP|INR|\$|€|£|₹)?\s*(\d+(?:\.\d+)?)",
    ),
    PatternRule::new(
        "discount_fixed_of",
        r"(?i)discount\s+of\s+(?:USD|EUR|GBP|INR|\$|€|£|₹)?\s*(\d+(?:\.\d+)?)",
    ),
];

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Build a complete invoice draft from a prompt and any attachment text.
///
/// Never fails: anything the rules can't find falls back to a default.
pub fn generate_invoice_draft(request: &DraftRequest) -> InvoiceDraft {
    generate_invoice_draft_at(request, OffsetDateTime::now_utc())
}

/// Same as [`generate_invoice_draft`] with an explicit "now", used for the
/// issue-date default and the invoice number.
pub fn generate_invoice_draft_at(request: &DraftRequest, now: OffsetDateTime) -> InvoiceDraft {
    let now = truncate_to_seconds(now);
    let prompt = request.prompt.trim().to_string();
    let source_text = request.extracted_text.trim().to_string();
    let merged = [prompt.as_str(), source_text.as_str()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let issue_date = extract_date(&ISSUE_DATE, &merged).unwrap_or(now);
    let due_date = extract_date(&DUE_DATE, &merged)
        .unwrap_or_else(|| issue_date + Duration::days(DEFAULT_DUE_DAYS));

    let emails = extract_emails(&merged);
    let from_email = FROM_EMAIL
        .find(&merged)
        .or_else(|| request.default_from_email.clone())
        .or_else(|| emails.first().cloned())
        .unwrap_or_else(|| "billing@example.com".to_string());
    let bill_to_email = BILL_TO_EMAIL
        .find(&merged)
        .or_else(|| emails.get(1).cloned())
        .or_else(|| emails.first().cloned())
        .unwrap_or_else(|| "client@example.com".to_string());

    let from_name = FROM_NAME
        .find(&merged)
        .or_else(|| request.default_from_name.clone())
        .unwrap_or_else(|| "Your Business".to_string());
    let bill_to_name = BILL_TO_NAME.find(&merged).unwrap_or_else(|| "Client".to_string());
    let from_address = FROM_ADDRESS
        .find(&merged)
        .unwrap_or_else(|| "Business Address".to_string());
    let bill_to_address = BILL_TO_ADDRESS
        .find(&merged)
        .unwrap_or_else(|| "Client Address".to_string());
    let notes = NOTES.find(&merged).unwrap_or_default();

    let items = extract_items(&merged);
    let discount = extract_discount(&merged);
    let totals = InvoiceTotals::compute(
        &items,
        discount.discount_type,
        discount.rate,
        discount.amount,
        extract_tax_rate(&merged),
    );

    let draft = InvoiceDraft {
        title: extract_title(&merged),
        invoice_number: generate_invoice_number_at(now),
        currency: detect_currency(&merged),
        issue_date,
        due_date,
        from_name,
        from_email,
        from_address,
        bill_to_name,
        bill_to_email,
        bill_to_address,
        notes,
        discount_type: totals.discount_type,
        discount_rate: totals.discount_rate,
        discount_amount: totals.discount_amount,
        tax_rate: totals.tax_rate,
        subtotal: totals.subtotal,
        tax_amount: totals.tax_amount,
        total: totals.total,
        items,
        prompt,
        source_text,
    };

    debug!(
        invoice_number = %draft.invoice_number,
        items = draft.items.len(),
        total = draft.total,
        "Extracted invoice draft"
    );
    draft
}

/// `INV-<YYYYMMDD>-<base36 ms timestamp><4 random base36>`.
pub fn generate_invoice_number() -> String {
    generate_invoice_number_at(OffsetDateTime::now_utc())
}

fn generate_invoice_number_at(now: OffsetDateTime) -> String {
    let date_part = format!(
        "{:04}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day()
    );
    let millis = u64::try_from(now.unix_timestamp_nanos() / 1_000_000).unwrap_or_default();
    let random = rand::rng().random_range(0..36u64.pow(4));
    format!("INV-{date_part}-{}{:0>4}", to_base36(millis), to_base36(random))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if value == 0 {
        return "0".to_string();
    }
    let mut reversed = Vec::new();
    while value > 0 {
        reversed.push(char::from(DIGITS[(value % 36) as usize]));
        value /= 36;
    }
    reversed.into_iter().rev().collect()
}

fn truncate_to_seconds(value: OffsetDateTime) -> OffsetDateTime {
    value.replace_nanosecond(0).unwrap_or(value)
}

// ---------------------------------------------------------------------------
// Field extractors
// ---------------------------------------------------------------------------

fn extract_date(rule: &LabelRule, content: &str) -> Option<OffsetDateTime> {
    let raw = rule.find(content)?;
    parse_calendar_date(&raw).map(truncate_to_seconds)
}

fn extract_emails(content: &str) -> Vec<String> {
    let Some(re) = EMAIL.regex() else {
        return Vec::new();
    };
    let mut emails: Vec<String> = Vec::new();
    for found in re.find_iter(content) {
        let email = found.as_str().to_lowercase();
        if !emails.contains(&email) {
            emails.push(email);
        }
    }
    emails
}

fn detect_currency(content: &str) -> Currency {
    CURRENCY_RULES
        .iter()
        .find(|(_, rule)| rule.is_match(content))
        .map(|(currency, _)| *currency)
        .unwrap_or_default()
}

fn extract_title(content: &str) -> String {
    if let Some(title) = TITLE.find(content) {
        return title;
    }
    if let Some(caps) = TITLE_FOR.captures(content) {
        let name = caps[1].trim();
        if !name.is_empty() {
            return format!("Invoice for {name}");
        }
    }
    "AI Generated Invoice".to_string()
}

fn extract_items(content: &str) -> Vec<LineItem> {
    let mut items = Vec::new();

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some(caps) = ITEM_LINE.captures(line) else {
            continue;
        };
        let name = caps[1].trim();
        if name.is_empty() {
            continue;
        }
        let quantity = caps[2].parse::<f64>().unwrap_or(1.0);
        let unit_price = caps[3].parse::<f64>().unwrap_or(0.0);
        items.push(LineItem::new(name, "", quantity, unit_price));
    }

    if items.is_empty() {
        items.push(LineItem::new(
            DEFAULT_ITEM_NAME,
            DEFAULT_ITEM_DESCRIPTION,
            1.0,
            DEFAULT_ITEM_PRICE,
        ));
    }
    items
}

fn extract_tax_rate(content: &str) -> f64 {
    if NO_TAX.is_match(content) {
        return 0.0;
    }
    first_number(&TAX_RATE, content).map_or(0.0, clamp_percent)
}

struct ExtractedDiscount {
    discount_type: DiscountType,
    rate: f64,
    amount: f64,
}

impl ExtractedDiscount {
    const NONE: Self = Self {
        discount_type: DiscountType::Percentage,
        rate: 0.0,
        amount: 0.0,
    };
}

/// Amount and rate are finalised against the subtotal by `InvoiceTotals`.
fn extract_discount(content: &str) -> ExtractedDiscount {
    if any_match(&NO_DISCOUNT, content) {
        return ExtractedDiscount::NONE;
    }

    if let Some(rate) = first_number(&PERCENT_DISCOUNT, content) {
        return ExtractedDiscount {
            discount_type: DiscountType::Percentage,
            rate,
            amount: 0.0,
        };
    }

    if let Some(amount) = first_number_without_percent(&FIXED_DISCOUNT, content) {
        return ExtractedDiscount {
            discount_type: DiscountType::Fixed,
            rate: 0.0,
            amount,
        };
    }

    ExtractedDiscount::NONE
}
