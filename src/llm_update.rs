// src/llm_update.rs

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::model::{Currency, DiscountType, InvoiceSnapshot};

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Tried in order when no model is configured.
pub const DEFAULT_MODELS: &[&str] = &["gemini-2.0-flash-001", "gemini-1.5-flash-latest"];

const ERROR_BODY_CHARS: usize = 200;

const PREAMBLE: &str = r#"You are an invoice quick-edit engine.

Return valid JSON only. Never return markdown, prose, or code fences.

The response MUST always use this exact top-level shape:

{"set":{},"adjustments":{},"addItems":[],"updateItems":[],"removeItems":[]}

Only include fields that should change. Leave others out or keep containers empty.

All text edits (title, names, emails, addresses, notes) must be plain strings inside `set`.

Use this JSON syntax and field contract exactly:"#;

const FIELD_CONTRACT: &str = r#"{
  "set": {
    "title": "optional string",
    "currency": "optional one of USD, EUR, GBP, INR",
    "issueDate": "optional ISO date or parseable date string",
    "dueDate": "optional ISO date or parseable date string",
    "fromName": "optional string",
    "fromEmail": "optional string",
    "fromAddress": "optional string",
    "billToName": "optional string",
    "billToEmail": "optional string",
    "billToAddress": "optional string",
    "notes": "optional string",
    "discountType": "optional one of PERCENTAGE or FIXED",
    "discountRate": "optional number 0..100",
    "discountAmount": "optional non-negative number",
    "taxRate": "optional number 0..100"
  },
  "adjustments": {
    "discountRateDelta": "optional number",
    "discountAmountDelta": "optional number",
    "taxRateDelta": "optional number"
  },
  "addItems": [
    {
      "name": "string",
      "description": "optional string",
      "quantity": 1,
      "unitPrice": 100
    }
  ],
  "updateItems": [
    {
      "targetName": "existing item name to match",
      "name": "optional replacement name",
      "description": "optional replacement description",
      "quantity": "optional replacement quantity",
      "unitPrice": "optional replacement unitPrice"
    }
  ],
  "removeItems": ["existing item name"]
}"#;

const CLOSING: &str = "If the instruction is ambiguous, make the safest minimal edit.\n\n\
If no change is requested, return empty objects/arrays with the same top-level keys.";

/// What the model gets to see of the invoice: editable fields only.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptInvoice<'a> {
    title: &'a str,
    currency: Currency,
    issue_date: &'a str,
    due_date: &'a str,
    from_name: &'a str,
    from_email: &'a str,
    from_address: &'a str,
    bill_to_name: &'a str,
    bill_to_email: &'a str,
    bill_to_address: &'a str,
    notes: &'a str,
    discount_type: DiscountType,
    discount_rate: f64,
    discount_amount: f64,
    tax_rate: f64,
    items: Vec<PromptItem<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptItem<'a> {
    name: &'a str,
    description: &'a str,
    quantity: u32,
    unit_price: f64,
}

impl<'a> From<&'a InvoiceSnapshot> for PromptInvoice<'a> {
    fn from(invoice: &'a InvoiceSnapshot) -> Self {
        Self {
            title: &invoice.title,
            currency: invoice.currency,
            issue_date: &invoice.issue_date,
            due_date: &invoice.due_date,
            from_name: &invoice.from_name,
            from_email: &invoice.from_email,
            from_address: &invoice.from_address,
            bill_to_name: &invoice.bill_to_name,
            bill_to_email: &invoice.bill_to_email,
            bill_to_address: &invoice.bill_to_address,
            notes: &invoice.notes,
            discount_type: invoice.discount_type,
            discount_rate: invoice.discount_rate,
            discount_amount: invoice.discount_amount,
            tax_rate: invoice.tax_rate,
            items: invoice
                .items
                .iter()
                .map(|item| PromptItem {
                    name: &item.name,
                    description: &item.description,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
                .collect(),
        }
    }
}

/// The full edit prompt for one instruction against one invoice.
pub fn build_prompt(instruction: &str, invoice: &InvoiceSnapshot) -> String {
    let summary = serde_json::to_string_pretty(&PromptInvoice::from(invoice))
        .unwrap_or_else(|_| "{}".to_string());
    [
        PREAMBLE,
        FIELD_CONTRACT,
        CLOSING,
        "Instruction:",
        instruction,
        "Current invoice:",
        &summary,
    ]
    .join("\n\n")
}

/// Why a single model attempt produced nothing usable.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    Status { status: u16, body: String },
    TimedOut,
    Request(String),
    EmptyResponse,
    InvalidJson(String),
}

impl AttemptFailure {
    /// User-facing description naming the model that failed.
    pub fn describe(&self, model: &str) -> String {
        match self {
            AttemptFailure::Status { status, body } => {
                format!("Invoice edit model '{model}' failed ({status}). {body}")
                    .trim_end()
                    .to_string()
            }
            AttemptFailure::TimedOut => format!("Invoice edit model '{model}' timed out."),
            AttemptFailure::Request(reason) => {
                format!("Invoice edit model '{model}' request failed: {reason}")
            }
            AttemptFailure::EmptyResponse => {
                format!("Invoice edit model '{model}' returned an empty response.")
            }
            AttemptFailure::InvalidJson(reason) => {
                format!("Invoice edit model '{model}' returned invalid JSON ({reason}).")
            }
        }
    }
}

/// A text-generation backend: one prompt in, the response text out.
#[async_trait]
pub trait TextModel: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, AttemptFailure>;
}

// ---------------------------------------------------------------------------
// Gemini generateContent
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    response_mime_type: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    /// All candidate parts joined by newlines, trimmed.
    fn text(&self) -> String {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|content| content.parts.iter())
            .map(|part| part.text.as_deref().unwrap_or(""))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

pub struct GeminiClient {
    client: Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    fn url(&self, model: &str) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.endpoint.trim_end_matches('/'),
            urlencoding::encode(model),
            urlencoding::encode(&self.api_key)
        )
    }
}

fn request_failure(e: reqwest::Error) -> AttemptFailure {
    if e.is_timeout() {
        AttemptFailure::TimedOut
    } else {
        AttemptFailure::Request(e.to_string())
    }
}

#[async_trait]
impl TextModel for GeminiClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, AttemptFailure> {
        let request = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![RequestPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                response_mime_type: "application/json",
            },
        };

        let response = self
            .client
            .post(self.url(model))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(request_failure)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptFailure::Status {
                status,
                body: body.chars().take(ERROR_BODY_CHARS).collect(),
            });
        }

        let payload: GenerateResponse = response.json().await.map_err(request_failure)?;
        let text = payload.text();
        debug!(model, chars = text.len(), "Model response received");

        if text.is_empty() {
            return Err(AttemptFailure::EmptyResponse);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InvoiceStatus, LineItem};

    fn invoice() -> InvoiceSnapshot {
        InvoiceSnapshot {
            id: "secret-id".into(),
            status: InvoiceStatus::Ready,
            title: "Invoice for Acme Corp".into(),
            invoice_number: "INV-1".into(),
            currency: Currency::Usd,
            issue_date: "2024-03-05T00:00:00Z".into(),
            due_date: "2024-03-19T00:00:00Z".into(),
            from_name: "Studio".into(),
            from_email: "studio@example.com".into(),
            from_address: "1 Road".into(),
            bill_to_name: "Acme Corp".into(),
            bill_to_email: "ap@acme.test".into(),
            bill_to_address: "2 Street".into(),
            notes: String::new(),
            discount_type: DiscountType::Percentage,
            discount_rate: 10.0,
            discount_amount: 34.0,
            tax_rate: 8.0,
            subtotal: 340.0,
            tax_amount: 24.48,
            total: 330.48,
            items: vec![LineItem::new("Hosting", "", 1.0, 40.0)],
            prompt: None,
            source_text: None,
        }
    }

    #[test]
    fn test_prompt_redacts_totals_and_ids() {
        let prompt = build_prompt("drop hosting", &invoice());
        assert!(prompt.contains("Instruction:\n\ndrop hosting"));
        assert!(prompt.contains("\"billToName\": \"Acme Corp\""));
        assert!(prompt.contains("\"unitPrice\": 40.0"));
        assert!(!prompt.contains("secret-id"));
        assert!(!prompt.contains("\"total\""));
        assert!(!prompt.contains("\"subtotal\""));
        assert!(!prompt.contains("lineTotal"));
    }

    #[test]
    fn test_request_body_shape() {
        let request = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![RequestPart { text: "hi" }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                response_mime_type: "application/json",
            },
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
                "generationConfig": {"temperature": 0.0, "responseMimeType": "application/json"}
            })
        );
    }

    #[test]
    fn test_response_text_joins_parts() {
        let response: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[
                {"content":{"parts":[{"text":"{\"set\":"},{"text":"{}}"}]}},
                {"finishReason":"SAFETY"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(response.text(), "{\"set\":\n{}}");

        let empty: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.text(), "");
    }

    #[test]
    fn test_url_escapes_model_and_key() {
        let client = GeminiClient::new(
            "https://example.test/v1beta/",
            "k&y=1",
            Duration::from_secs(20),
        );
        assert_eq!(
            client.url("gemini-2.0-flash-001"),
            "https://example.test/v1beta/models/gemini-2.0-flash-001:generateContent?key=k%26y%3D1"
        );
    }

    #[test]
    fn test_failure_messages_name_the_model() {
        let status = AttemptFailure::Status {
            status: 429,
            body: "quota".into(),
        };
        assert_eq!(status.describe("m1"), "Invoice edit model 'm1' failed (429). quota");
        assert_eq!(
            AttemptFailure::TimedOut.describe("m2"),
            "Invoice edit model 'm2' timed out."
        );
        assert_eq!(
            AttemptFailure::EmptyResponse.describe("m3"),
            "Invoice edit model 'm3' returned an empty response."
        );
    }
}
