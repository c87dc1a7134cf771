// src/serialization.rs

use bigdecimal::BigDecimal;
use serde_json::{Value, json};
use std::str::FromStr;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::SerializationError;
use crate::model::{Currency, DiscountType, InvoiceDraft, InvoiceSnapshot, InvoiceStatus, LineItem};
use crate::synthesizer::SynthesizedUpdate;

/// An invoice row as persisted: decimal money, real timestamps, and
/// nullable discount columns for rows written before they existed.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRecord {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub status: InvoiceStatus,
    pub prompt: Option<String>,
    pub source_text: Option<String>,
    pub invoice_number: String,
    pub currency: String,
    pub issue_date: OffsetDateTime,
    pub due_date: OffsetDateTime,
    pub from_name: String,
    pub from_email: String,
    pub from_address: String,
    pub bill_to_name: String,
    pub bill_to_email: String,
    pub bill_to_address: String,
    pub notes: Option<String>,
    pub subtotal: BigDecimal,
    pub discount_type: Option<DiscountType>,
    pub discount_rate: Option<BigDecimal>,
    pub discount_amount: Option<BigDecimal>,
    pub tax_rate: BigDecimal,
    pub tax_amount: BigDecimal,
    pub total: BigDecimal,
    pub raw_json: Option<Value>,
    pub items: Vec<ItemRecord>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    pub name: String,
    pub description: Option<String>,
    pub quantity: u32,
    pub unit_price: BigDecimal,
    pub line_total: BigDecimal,
}

/// Two-decimal fixed-point representation of an amount.
pub fn to_decimal(value: f64) -> BigDecimal {
    BigDecimal::from_str(&format!("{value:.2}")).unwrap_or_else(|_| BigDecimal::from(0))
}

fn to_number(field: &'static str, value: &BigDecimal) -> Result<f64, SerializationError> {
    let text = value.to_string();
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or(SerializationError::InvalidAmount { field, value: text })
}

pub fn format_timestamp(value: OffsetDateTime) -> Result<String, SerializationError> {
    Ok(value.format(&Rfc3339)?)
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<OffsetDateTime, SerializationError> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|_| SerializationError::InvalidDate {
        field,
        value: value.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Legacy discount recovery
// ---------------------------------------------------------------------------

fn raw_number(raw: Option<&Value>, key: &str) -> Option<f64> {
    let value = match raw?.as_object()?.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

fn raw_discount_type(raw: Option<&Value>) -> Option<DiscountType> {
    raw?.as_object()?
        .get("discountType")?
        .as_str()
        .and_then(DiscountType::from_code)
}

// ---------------------------------------------------------------------------
// Record → snapshot
// ---------------------------------------------------------------------------

/// Convert a persisted record into the pipeline's plain shape.
///
/// Missing discount columns are recovered from the raw JSON blob, then
/// default to a zero percentage discount.
pub fn snapshot_from_record(record: &InvoiceRecord) -> Result<InvoiceSnapshot, SerializationError> {
    let raw = record.raw_json.as_ref();

    let discount_type = record
        .discount_type
        .or_else(|| raw_discount_type(raw))
        .unwrap_or_default();
    let discount_rate = match &record.discount_rate {
        Some(rate) => to_number("discountRate", rate)?,
        None => raw_number(raw, "discountRate").unwrap_or(0.0),
    };
    let discount_amount = match &record.discount_amount {
        Some(amount) => to_number("discountAmount", amount)?,
        None => raw_number(raw, "discountAmount").unwrap_or(0.0),
    };

    let items = record
        .items
        .iter()
        .map(|item| {
            Ok(LineItem {
                name: item.name.clone(),
                description: item.description.clone().unwrap_or_default(),
                quantity: item.quantity,
                unit_price: to_number("unitPrice", &item.unit_price)?,
                line_total: to_number("lineTotal", &item.line_total)?,
            })
        })
        .collect::<Result<Vec<_>, SerializationError>>()?;

    Ok(InvoiceSnapshot {
        id: record.id.clone(),
        status: record.status,
        title: record.title.clone(),
        invoice_number: record.invoice_number.clone(),
        currency: Currency::from_code(&record.currency).unwrap_or_default(),
        issue_date: format_timestamp(record.issue_date)?,
        due_date: format_timestamp(record.due_date)?,
        from_name: record.from_name.clone(),
        from_email: record.from_email.clone(),
        from_address: record.from_address.clone(),
        bill_to_name: record.bill_to_name.clone(),
        bill_to_email: record.bill_to_email.clone(),
        bill_to_address: record.bill_to_address.clone(),
        notes: record.notes.clone().unwrap_or_default(),
        discount_type,
        discount_rate,
        discount_amount,
        tax_rate: to_number("taxRate", &record.tax_rate)?,
        subtotal: to_number("subtotal", &record.subtotal)?,
        tax_amount: to_number("taxAmount", &record.tax_amount)?,
        total: to_number("total", &record.total)?,
        items,
        prompt: record.prompt.clone(),
        source_text: record.source_text.clone(),
    })
}

// ---------------------------------------------------------------------------
// Draft / snapshot → record
// ---------------------------------------------------------------------------

fn item_records(items: &[LineItem]) -> Vec<ItemRecord> {
    items
        .iter()
        .map(|item| ItemRecord {
            name: item.name.clone(),
            description: Some(item.description.clone()),
            quantity: item.quantity,
            unit_price: to_decimal(item.unit_price),
            line_total: to_decimal(item.line_total),
        })
        .collect()
}

/// A fresh `Ready` record for a newly extracted draft.
pub fn record_from_draft(
    id: &str,
    owner_id: &str,
    draft: &InvoiceDraft,
    now: OffsetDateTime,
) -> Result<InvoiceRecord, SerializationError> {
    Ok(InvoiceRecord {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        title: draft.title.clone(),
        status: InvoiceStatus::Ready,
        prompt: Some(draft.prompt.clone()),
        source_text: Some(draft.source_text.clone()),
        invoice_number: draft.invoice_number.clone(),
        currency: draft.currency.as_str().to_string(),
        issue_date: draft.issue_date,
        due_date: draft.due_date,
        from_name: draft.from_name.clone(),
        from_email: draft.from_email.clone(),
        from_address: draft.from_address.clone(),
        bill_to_name: draft.bill_to_name.clone(),
        bill_to_email: draft.bill_to_email.clone(),
        bill_to_address: draft.bill_to_address.clone(),
        notes: Some(draft.notes.clone()),
        subtotal: to_decimal(draft.subtotal),
        discount_type: Some(draft.discount_type),
        discount_rate: Some(to_decimal(draft.discount_rate)),
        discount_amount: Some(to_decimal(draft.discount_amount)),
        tax_rate: to_decimal(draft.tax_rate),
        tax_amount: to_decimal(draft.tax_amount),
        total: to_decimal(draft.total),
        raw_json: Some(raw_json_for_draft(draft)?),
        items: item_records(&draft.items),
        created_at: now,
        updated_at: now,
    })
}

/// The record for the next version of `prior`, holding `snapshot`'s values.
pub fn record_from_snapshot(
    snapshot: &InvoiceSnapshot,
    prior: &InvoiceRecord,
    raw_json: Value,
    now: OffsetDateTime,
) -> Result<InvoiceRecord, SerializationError> {
    Ok(InvoiceRecord {
        id: prior.id.clone(),
        owner_id: prior.owner_id.clone(),
        title: snapshot.title.clone(),
        status: snapshot.status,
        prompt: snapshot.prompt.clone(),
        source_text: snapshot.source_text.clone(),
        invoice_number: snapshot.invoice_number.clone(),
        currency: snapshot.currency.as_str().to_string(),
        issue_date: parse_timestamp("issueDate", &snapshot.issue_date)?,
        due_date: parse_timestamp("dueDate", &snapshot.due_date)?,
        from_name: snapshot.from_name.clone(),
        from_email: snapshot.from_email.clone(),
        from_address: snapshot.from_address.clone(),
        bill_to_name: snapshot.bill_to_name.clone(),
        bill_to_email: snapshot.bill_to_email.clone(),
        bill_to_address: snapshot.bill_to_address.clone(),
        notes: Some(snapshot.notes.clone()),
        subtotal: to_decimal(snapshot.subtotal),
        discount_type: Some(snapshot.discount_type),
        discount_rate: Some(to_decimal(snapshot.discount_rate)),
        discount_amount: Some(to_decimal(snapshot.discount_amount)),
        tax_rate: to_decimal(snapshot.tax_rate),
        tax_amount: to_decimal(snapshot.tax_amount),
        total: to_decimal(snapshot.total),
        raw_json: Some(raw_json),
        items: item_records(&snapshot.items),
        created_at: prior.created_at,
        updated_at: now,
    })
}

// ---------------------------------------------------------------------------
// Audit JSON
// ---------------------------------------------------------------------------

/// Audit snapshot stored alongside a freshly generated invoice and its version.
pub fn raw_json_for_draft(draft: &InvoiceDraft) -> Result<Value, SerializationError> {
    Ok(json!({
        "title": draft.title,
        "invoiceNumber": draft.invoice_number,
        "currency": draft.currency,
        "issueDate": format_timestamp(draft.issue_date)?,
        "dueDate": format_timestamp(draft.due_date)?,
        "from": {
            "name": draft.from_name,
            "email": draft.from_email,
            "address": draft.from_address,
        },
        "billTo": {
            "name": draft.bill_to_name,
            "email": draft.bill_to_email,
            "address": draft.bill_to_address,
        },
        "notes": draft.notes,
        "subtotal": draft.subtotal,
        "discountType": draft.discount_type,
        "discountRate": draft.discount_rate,
        "discountAmount": draft.discount_amount,
        "taxRate": draft.tax_rate,
        "taxAmount": draft.tax_amount,
        "total": draft.total,
        "items": draft.items,
        "prompt": draft.prompt,
        "sourceText": draft.source_text,
    }))
}

/// Audit snapshot for an edit: the new values plus what produced them,
/// including any candidate models that failed first.
pub fn raw_json_for_edit(
    snapshot: &InvoiceSnapshot,
    instruction: &str,
    synthesized: &SynthesizedUpdate,
) -> Result<Value, serde_json::Error> {
    let failed_attempts: Vec<Value> = synthesized
        .attempts
        .iter()
        .map(|a| json!({ "model": a.model, "reason": a.failure.describe(&a.model) }))
        .collect();

    Ok(json!({
        "title": snapshot.title,
        "invoiceNumber": snapshot.invoice_number,
        "currency": snapshot.currency,
        "issueDate": snapshot.issue_date,
        "dueDate": snapshot.due_date,
        "from": {
            "name": snapshot.from_name,
            "email": snapshot.from_email,
            "address": snapshot.from_address,
        },
        "billTo": {
            "name": snapshot.bill_to_name,
            "email": snapshot.bill_to_email,
            "address": snapshot.bill_to_address,
        },
        "notes": snapshot.notes,
        "subtotal": snapshot.subtotal,
        "discountType": snapshot.discount_type,
        "discountRate": snapshot.discount_rate,
        "discountAmount": snapshot.discount_amount,
        "taxRate": snapshot.tax_rate,
        "taxAmount": snapshot.tax_amount,
        "total": snapshot.total,
        "items": snapshot.items,
        "prompt": snapshot.prompt.clone().unwrap_or_default(),
        "sourceText": snapshot.source_text.clone().unwrap_or_default(),
        "editInstruction": instruction,
        "structuredUpdate": serde_json::to_value(&synthesized.update)?,
        "updateSource": synthesized.source,
        "updateModel": synthesized.model,
        "failedAttempts": failed_attempts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heuristics::{DraftRequest, generate_invoice_draft_at};
    use crate::synthesizer::UpdateSource;
    use crate::update::StructuredInvoiceUpdate;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-03-05 14:30:15 UTC);

    fn acme_draft() -> InvoiceDraft {
        generate_invoice_draft_at(
            &DraftRequest::new(
                "Invoice for Acme Corp\n- Design work x2 @ 150\n- Hosting x1 @ 40\ntax 8%\ndiscount 10%",
            ),
            NOW,
        )
    }

    #[test]
    fn test_to_decimal_keeps_two_places() {
        assert_eq!(to_decimal(34.0).to_string(), "34.00");
        assert_eq!(to_decimal(24.48).to_string(), "24.48");
        assert_eq!(to_decimal(f64::NAN), BigDecimal::from(0));
    }

    #[test]
    fn test_draft_roundtrip() {
        let draft = acme_draft();
        let record = record_from_draft("inv_1", "owner_1", &draft, NOW).unwrap();
        let snapshot = snapshot_from_record(&record).unwrap();

        assert_eq!(snapshot.id, "inv_1");
        assert_eq!(snapshot.status, InvoiceStatus::Ready);
        assert_eq!(snapshot.title, draft.title);
        assert_eq!(snapshot.invoice_number, draft.invoice_number);
        assert_eq!(snapshot.currency, draft.currency);
        assert_eq!(snapshot.issue_date, "2024-03-05T14:30:15Z");
        assert_eq!(snapshot.due_date, "2024-03-19T14:30:15Z");
        assert_eq!(snapshot.items, draft.items);
        assert_eq!(snapshot.subtotal, draft.subtotal);
        assert_eq!(snapshot.discount_type, draft.discount_type);
        assert_eq!(snapshot.discount_rate, draft.discount_rate);
        assert_eq!(snapshot.discount_amount, draft.discount_amount);
        assert_eq!(snapshot.tax_rate, draft.tax_rate);
        assert_eq!(snapshot.tax_amount, draft.tax_amount);
        assert_eq!(snapshot.total, draft.total);
        assert_eq!(snapshot.notes, draft.notes);
        assert_eq!(snapshot.prompt.as_deref(), Some(draft.prompt.as_str()));

        let back = record_from_snapshot(&snapshot, &record, record.raw_json.clone().unwrap(), NOW)
            .unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_legacy_record_recovers_discount_from_raw_json() {
        let mut record = record_from_draft("inv_1", "owner_1", &acme_draft(), NOW).unwrap();
        record.discount_type = None;
        record.discount_rate = None;
        record.discount_amount = None;

        let snapshot = snapshot_from_record(&record).unwrap();
        assert_eq!(snapshot.discount_type, DiscountType::Percentage);
        assert_eq!(snapshot.discount_rate, 10.0);
        assert_eq!(snapshot.discount_amount, 34.0);

        record.raw_json = Some(json!({
            "discountType": "FIXED",
            "discountRate": "12.5",
            "discountAmount": 42.5
        }));
        let snapshot = snapshot_from_record(&record).unwrap();
        assert_eq!(snapshot.discount_type, DiscountType::Fixed);
        assert_eq!(snapshot.discount_rate, 12.5);
        assert_eq!(snapshot.discount_amount, 42.5);

        record.raw_json = Some(json!(["not", "an", "object"]));
        let snapshot = snapshot_from_record(&record).unwrap();
        assert_eq!(snapshot.discount_type, DiscountType::Percentage);
        assert_eq!(snapshot.discount_rate, 0.0);
        assert_eq!(snapshot.discount_amount, 0.0);
    }

    #[test]
    fn test_nulls_and_unknown_currency_normalise() {
        let mut record = record_from_draft("inv_1", "owner_1", &acme_draft(), NOW).unwrap();
        record.notes = None;
        record.currency = "JPY".into();
        record.items[0].description = None;

        let snapshot = snapshot_from_record(&record).unwrap();
        assert_eq!(snapshot.notes, "");
        assert_eq!(snapshot.currency, Currency::Usd);
        assert_eq!(snapshot.items[0].description, "");
    }

    #[test]
    fn test_edit_audit_json() {
        let draft = acme_draft();
        let record = record_from_draft("inv_1", "owner_1", &draft, NOW).unwrap();
        let snapshot = snapshot_from_record(&record).unwrap();
        let synthesized = SynthesizedUpdate {
            update: StructuredInvoiceUpdate {
                remove_items: vec!["Hosting".into()],
                ..Default::default()
            },
            source: UpdateSource::Fallback,
            model: None,
            attempts: Vec::new(),
        };

        let raw = raw_json_for_edit(&snapshot, "drop hosting", &synthesized).unwrap();
        assert_eq!(raw["billTo"]["name"], "Client");
        assert_eq!(raw["discountType"], "PERCENTAGE");
        assert_eq!(raw["editInstruction"], "drop hosting");
        assert_eq!(raw["updateSource"], "fallback");
        assert_eq!(raw["structuredUpdate"], json!({"removeItems": ["Hosting"]}));
        assert_eq!(raw["items"][0]["lineTotal"], 300.0);
        assert_eq!(raw["updateModel"], Value::Null);
        assert_eq!(raw["failedAttempts"], json!([]));
    }
}
