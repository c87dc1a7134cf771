// src/model.rs

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::money::{line_total, sanitize_price, sanitize_quantity};

/// The four supported invoice currencies. Amounts are never converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Usd,
    Eur,
    Gbp,
    Inr,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Inr => "INR",
        }
    }

    /// Case-insensitive lookup of an ISO code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_uppercase().as_str() {
            "USD" => Some(Currency::Usd),
            "EUR" => Some(Currency::Eur),
            "GBP" => Some(Currency::Gbp),
            "INR" => Some(Currency::Inr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountType {
    #[default]
    Percentage,
    Fixed,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "PERCENTAGE",
            DiscountType::Fixed => "FIXED",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "PERCENTAGE" => Some(DiscountType::Percentage),
            "FIXED" => Some(DiscountType::Fixed),
            _ => None,
        }
    }
}

/// Lifecycle of a stored invoice: DRAFT → GENERATING → READY, or ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    #[default]
    Draft,
    Generating,
    Ready,
    Error,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "DRAFT",
            InvoiceStatus::Generating => "GENERATING",
            InvoiceStatus::Ready => "READY",
            InvoiceStatus::Error => "ERROR",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "DRAFT" => Some(InvoiceStatus::Draft),
            "GENERATING" => Some(InvoiceStatus::Generating),
            "READY" => Some(InvoiceStatus::Ready),
            "ERROR" => Some(InvoiceStatus::Error),
            _ => None,
        }
    }
}

/// A single invoice line item. `line_total` is always derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub line_total: f64,
}

impl LineItem {
    /// Build an item from raw numbers, sanitizing quantity and price.
    pub fn new(name: impl Into<String>, description: impl Into<String>, quantity: f64, unit_price: f64) -> Self {
        let quantity = sanitize_quantity(quantity);
        let unit_price = sanitize_price(unit_price);
        Self {
            name: name.into(),
            description: description.into(),
            quantity,
            unit_price,
            line_total: line_total(quantity, unit_price),
        }
    }

    /// Re-run the sanitizers and recompute the total.
    pub fn normalized(&self) -> Self {
        Self::new(
            self.name.clone(),
            self.description.clone(),
            self.quantity as f64,
            self.unit_price,
        )
    }
}

/// A freshly extracted invoice, before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceDraft {
    pub title: String,
    pub invoice_number: String,
    pub currency: Currency,
    pub issue_date: OffsetDateTime,
    pub due_date: OffsetDateTime,
    pub from_name: String,
    pub from_email: String,
    pub from_address: String,
    pub bill_to_name: String,
    pub bill_to_email: String,
    pub bill_to_address: String,
    pub notes: String,
    pub discount_type: DiscountType,
    pub discount_rate: f64,
    pub discount_amount: f64,
    pub tax_rate: f64,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub total: f64,
    pub items: Vec<LineItem>,
    pub prompt: String,
    pub source_text: String,
}

/// The current state of a stored invoice, in the pipeline's plain shape.
///
/// Dates are RFC 3339 strings; money is `f64` rounded to 2 decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSnapshot {
    pub id: String,
    pub status: InvoiceStatus,
    pub title: String,
    pub invoice_number: String,
    pub currency: Currency,
    pub issue_date: String,
    pub due_date: String,
    pub from_name: String,
    pub from_email: String,
    pub from_address: String,
    pub bill_to_name: String,
    pub bill_to_email: String,
    pub bill_to_address: String,
    pub notes: String,
    pub discount_type: DiscountType,
    pub discount_rate: f64,
    pub discount_amount: f64,
    pub tax_rate: f64,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub total: f64,
    pub items: Vec<LineItem>,
    pub prompt: Option<String>,
    pub source_text: Option<String>,
}

/// Row shape for invoice listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSummary {
    pub id: String,
    pub title: String,
    pub client_name: String,
    pub status: InvoiceStatus,
    pub invoice_number: String,
    pub currency: Currency,
    pub total: f64,
    pub created_at: String,
    pub updated_at: String,
}
