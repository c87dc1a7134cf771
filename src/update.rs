// src/update.rs

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::UpdateParseError;
use crate::model::{Currency, DiscountType};

/// A sparse field in an update: leave it alone, clear it, or replace it.
///
/// Missing keys deserialize to `Absent` (with `#[serde(default)]`), JSON
/// `null` to `Null`, anything else to `Value`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Patch<T> {
    #[default]
    Absent,
    Null,
    Value(T),
}

impl<T> Patch<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Patch::Absent)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Patch::Null)
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Patch::Value(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Patch::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl<T> From<Option<T>> for Patch<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Patch::Null, Patch::Value)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Patch::from)
    }
}

impl<T: Serialize> Serialize for Patch<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Patch::Value(v) => v.serialize(serializer),
            _ => serializer.serialize_none(),
        }
    }
}

// ---------------------------------------------------------------------------
// Numeric coercion: models send numbers as strings often enough
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberLike {
    Number(f64),
    Text(String),
}

fn coerce<E: serde::de::Error>(raw: NumberLike) -> Result<f64, E> {
    let value = match raw {
        NumberLike::Number(n) => n,
        NumberLike::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| E::custom(format!("expected a number, got {s:?}")))?,
    };
    if value.is_finite() {
        Ok(value)
    } else {
        Err(E::custom("number must be finite"))
    }
}

fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    coerce(NumberLike::deserialize(deserializer)?)
}

fn optional_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Option::<NumberLike>::deserialize(deserializer)?
        .map(coerce)
        .transpose()
}

fn patch_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Patch<f64>, D::Error> {
    match Option::<NumberLike>::deserialize(deserializer)? {
        None => Ok(Patch::Null),
        Some(raw) => coerce::<D::Error>(raw).map(Patch::Value),
    }
}

// ---------------------------------------------------------------------------
// The update envelope
// ---------------------------------------------------------------------------

/// Direct field replacements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSet {
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub title: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub currency: Patch<Currency>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub issue_date: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub due_date: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub from_name: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub from_email: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub from_address: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub bill_to_name: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub bill_to_email: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub bill_to_address: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub notes: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub discount_type: Patch<DiscountType>,
    #[serde(default, deserialize_with = "patch_number", skip_serializing_if = "Patch::is_absent")]
    pub discount_rate: Patch<f64>,
    #[serde(default, deserialize_with = "patch_number", skip_serializing_if = "Patch::is_absent")]
    pub discount_amount: Patch<f64>,
    #[serde(default, deserialize_with = "patch_number", skip_serializing_if = "Patch::is_absent")]
    pub tax_rate: Patch<f64>,
}

impl UpdateSet {
    pub fn is_empty(&self) -> bool {
        self == &UpdateSet::default()
    }

    fn text_fields(&self) -> [(&'static str, &Patch<String>); 9] {
        [
            ("set.title", &self.title),
            ("set.issueDate", &self.issue_date),
            ("set.dueDate", &self.due_date),
            ("set.fromName", &self.from_name),
            ("set.fromEmail", &self.from_email),
            ("set.fromAddress", &self.from_address),
            ("set.billToName", &self.bill_to_name),
            ("set.billToEmail", &self.bill_to_email),
            ("set.billToAddress", &self.bill_to_address),
        ]
    }

    /// Fields set to `null` that `null` cannot clear (everything but `notes`).
    fn null_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.text_fields()
            .into_iter()
            .map(|(field, patch)| (field, patch.is_null()))
            .chain([
                ("set.currency", self.currency.is_null()),
                ("set.discountType", self.discount_type.is_null()),
                ("set.discountRate", self.discount_rate.is_null()),
                ("set.discountAmount", self.discount_amount.is_null()),
                ("set.taxRate", self.tax_rate.is_null()),
            ])
            .filter_map(|(field, null)| null.then_some(field))
    }
}

/// Relative changes, applied after `set`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Adjustments {
    #[serde(default, deserialize_with = "optional_number", skip_serializing_if = "Option::is_none")]
    pub discount_rate_delta: Option<f64>,
    #[serde(default, deserialize_with = "optional_number", skip_serializing_if = "Option::is_none")]
    pub discount_amount_delta: Option<f64>,
    #[serde(default, deserialize_with = "optional_number", skip_serializing_if = "Option::is_none")]
    pub tax_rate_delta: Option<f64>,
}

impl Adjustments {
    pub fn is_empty(&self) -> bool {
        self.discount_rate_delta.is_none()
            && self.discount_amount_delta.is_none()
            && self.tax_rate_delta.is_none()
    }
}

/// A line item to append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(deserialize_with = "number")]
    pub quantity: f64,
    #[serde(deserialize_with = "number")]
    pub unit_price: f64,
}

/// Replacement fields for the first item whose name matches `target_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdate {
    pub target_name: String,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub name: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub description: Patch<String>,
    #[serde(default, deserialize_with = "patch_number", skip_serializing_if = "Patch::is_absent")]
    pub quantity: Patch<f64>,
    #[serde(default, deserialize_with = "patch_number", skip_serializing_if = "Patch::is_absent")]
    pub unit_price: Patch<f64>,
}

/// A partial edit to an invoice. Five independent slots; all empty is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredInvoiceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<UpdateSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustments: Option<Adjustments>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_items: Vec<ItemInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update_items: Vec<ItemUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_items: Vec<String>,
}

impl StructuredInvoiceUpdate {
    pub fn is_empty(&self) -> bool {
        self.set.as_ref().is_none_or(UpdateSet::is_empty)
            && self.adjustments.as_ref().is_none_or(Adjustments::is_empty)
            && self.add_items.is_empty()
            && self.update_items.is_empty()
            && self.remove_items.is_empty()
    }

    /// Check the field contract the model is asked to honour.
    pub fn validate(&self) -> Result<(), UpdateParseError> {
        if let Some(set) = &self.set {
            if let Some(field) = set.null_fields().next() {
                return Err(UpdateParseError::schema(field, "must not be null"));
            }
            for (field, patch) in set.text_fields() {
                if patch.value().is_some_and(|v| v.is_empty()) {
                    return Err(UpdateParseError::schema(field, "must not be empty"));
                }
            }
            check_percent("set.discountRate", &set.discount_rate)?;
            check_percent("set.taxRate", &set.tax_rate)?;
            if set.discount_amount.value().is_some_and(|v| *v < 0.0) {
                return Err(UpdateParseError::schema(
                    "set.discountAmount",
                    "must not be negative",
                ));
            }
        }

        for (i, item) in self.add_items.iter().enumerate() {
            if item.name.is_empty() {
                return Err(UpdateParseError::schema(
                    format!("addItems[{i}].name"),
                    "must not be empty",
                ));
            }
            if item.quantity <= 0.0 {
                return Err(UpdateParseError::schema(
                    format!("addItems[{i}].quantity"),
                    "must be positive",
                ));
            }
            if item.unit_price < 0.0 {
                return Err(UpdateParseError::schema(
                    format!("addItems[{i}].unitPrice"),
                    "must not be negative",
                ));
            }
        }

        for (i, item) in self.update_items.iter().enumerate() {
            if item.target_name.is_empty() {
                return Err(UpdateParseError::schema(
                    format!("updateItems[{i}].targetName"),
                    "must not be empty",
                ));
            }
            for (field, null) in [
                ("name", item.name.is_null()),
                ("quantity", item.quantity.is_null()),
                ("unitPrice", item.unit_price.is_null()),
            ] {
                if null {
                    return Err(UpdateParseError::schema(
                        format!("updateItems[{i}].{field}"),
                        "must not be null",
                    ));
                }
            }
            if item.name.value().is_some_and(|v| v.is_empty()) {
                return Err(UpdateParseError::schema(
                    format!("updateItems[{i}].name"),
                    "must not be empty",
                ));
            }
            if item.quantity.value().is_some_and(|v| *v <= 0.0) {
                return Err(UpdateParseError::schema(
                    format!("updateItems[{i}].quantity"),
                    "must be positive",
                ));
            }
            if item.unit_price.value().is_some_and(|v| *v < 0.0) {
                return Err(UpdateParseError::schema(
                    format!("updateItems[{i}].unitPrice"),
                    "must not be negative",
                ));
            }
        }

        if let Some(i) = self.remove_items.iter().position(String::is_empty) {
            return Err(UpdateParseError::schema(
                format!("removeItems[{i}]"),
                "must not be empty",
            ));
        }

        Ok(())
    }
}

fn check_percent(field: &str, patch: &Patch<f64>) -> Result<(), UpdateParseError> {
    match patch.value() {
        Some(v) if !(0.0..=100.0).contains(v) => {
            Err(UpdateParseError::schema(field, "must be between 0 and 100"))
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tolerant parsing of model output
// ---------------------------------------------------------------------------

const FENCE: &str = "```";

/// Locate the JSON document inside a model response.
///
/// Stage one takes the body of the first fenced block (optionally tagged
/// `json`); stage two falls back to the span from the first `{` to the
/// last `}`.
pub fn extract_json_payload(raw: &str) -> Option<&str> {
    fenced_block(raw).or_else(|| brace_span(raw))
}

fn fenced_block(raw: &str) -> Option<&str> {
    let open = raw.find(FENCE)?;
    let mut body = &raw[open + FENCE.len()..];
    if body.get(..4).is_some_and(|tag| tag.eq_ignore_ascii_case("json")) {
        body = &body[4..];
    }
    let close = body.find(FENCE)?;
    let inner = body[..close].trim();
    (!inner.is_empty()).then_some(inner)
}

fn brace_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(raw[start..=end].trim())
}

/// Extract, decode and validate a structured update from raw model text.
pub fn parse_structured_update(raw: &str) -> Result<StructuredInvoiceUpdate, UpdateParseError> {
    let payload = extract_json_payload(raw).ok_or(UpdateParseError::NoPayload)?;
    let update: StructuredInvoiceUpdate = serde_json::from_str(payload)?;
    update.validate()?;
    Ok(update)
}

/// Stage at which parsing failed, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateParseErrorKind {
    Payload,
    Decode,
    Schema,
}

impl UpdateParseErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateParseErrorKind::Payload => "payload",
            UpdateParseErrorKind::Decode => "decode",
            UpdateParseErrorKind::Schema => "schema",
        }
    }
}

impl UpdateParseError {
    pub fn kind(&self) -> UpdateParseErrorKind {
        match self {
            UpdateParseError::NoPayload => UpdateParseErrorKind::Payload,
            UpdateParseError::Json(_) => UpdateParseErrorKind::Decode,
            UpdateParseError::Schema { .. } => UpdateParseErrorKind::Schema,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_tri_state() {
        let set: UpdateSet =
            serde_json::from_str(r#"{"notes": null, "title": "Retainer"}"#).unwrap();
        assert_eq!(set.notes, Patch::Null);
        assert_eq!(set.title, Patch::Value("Retainer".to_string()));
        assert_eq!(set.from_name, Patch::Absent);

        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json, serde_json::json!({"title": "Retainer", "notes": null}));
    }

    #[test]
    fn test_numbers_are_coerced_from_strings() {
        let update = parse_structured_update(
            r#"{"set":{"taxRate":"8.5"},"adjustments":{"discountRateDelta":"-5"},
               "addItems":[{"name":"Support","quantity":"3","unitPrice":20}]}"#,
        )
        .unwrap();
        let set = update.set.as_ref().unwrap();
        assert_eq!(set.tax_rate, Patch::Value(8.5));
        assert_eq!(
            update.adjustments.as_ref().unwrap().discount_rate_delta,
            Some(-5.0)
        );
        assert_eq!(update.add_items[0].quantity, 3.0);
        assert_eq!(update.add_items[0].description, "");

        let err = parse_structured_update(r#"{"set":{"taxRate":"lots"}}"#).unwrap_err();
        assert_eq!(err.kind(), UpdateParseErrorKind::Decode);
    }

    #[test]
    fn test_is_empty() {
        assert!(StructuredInvoiceUpdate::default().is_empty());
        let containers = parse_structured_update(
            r#"{"set":{},"adjustments":{},"addItems":[],"updateItems":[],"removeItems":[]}"#,
        )
        .unwrap();
        assert!(containers.is_empty());

        let clear_notes = parse_structured_update(r#"{"set":{"notes":null}}"#).unwrap();
        assert!(!clear_notes.is_empty());

        let clear_description =
            parse_structured_update(r#"{"updateItems":[{"targetName":"Hosting","description":null}]}"#)
                .unwrap();
        assert!(!clear_description.is_empty());
    }

    #[test]
    fn test_null_only_clears_notes_and_descriptions() {
        let cases = [
            (r#"{"set":{"title":null,"fromName":null}}"#, "set.title"),
            (r#"{"set":{"billToAddress":null}}"#, "set.billToAddress"),
            (r#"{"set":{"currency":null}}"#, "set.currency"),
            (r#"{"set":{"discountType":null}}"#, "set.discountType"),
            (r#"{"set":{"notes":null,"taxRate":null}}"#, "set.taxRate"),
            (r#"{"updateItems":[{"targetName":"Hosting","unitPrice":null}]}"#, "updateItems[0].unitPrice"),
        ];
        for (raw, expected) in cases {
            match parse_structured_update(raw) {
                Err(UpdateParseError::Schema { field, reason }) => {
                    assert_eq!(field, expected, "{raw}");
                    assert_eq!(reason, "must not be null");
                }
                other => panic!("expected schema error for {raw}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_validation_rejects_out_of_contract_values() {
        let cases = [
            (r#"{"set":{"taxRate":101}}"#, "set.taxRate"),
            (r#"{"set":{"discountAmount":-1}}"#, "set.discountAmount"),
            (r#"{"set":{"title":""}}"#, "set.title"),
            (r#"{"addItems":[{"name":"A","quantity":0,"unitPrice":1}]}"#, "addItems[0].quantity"),
            (r#"{"updateItems":[{"targetName":""}]}"#, "updateItems[0].targetName"),
            (r#"{"removeItems":["Hosting",""]}"#, "removeItems[1]"),
        ];
        for (raw, expected) in cases {
            match parse_structured_update(raw) {
                Err(UpdateParseError::Schema { field, .. }) => assert_eq!(field, expected, "{raw}"),
                other => panic!("expected schema error for {raw}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let update =
            parse_structured_update(r#"{"removeItems":["Hosting"],"reasoning":"user asked"}"#)
                .unwrap();
        assert_eq!(update.remove_items, vec!["Hosting".to_string()]);
    }

    #[test]
    fn test_extract_json_payload_well_formed() {
        assert_eq!(extract_json_payload(r#"{"a":1}"#), Some(r#"{"a":1}"#));
        assert_eq!(
            extract_json_payload("```json\n{\"a\":1}\n```"),
            Some(r#"{"a":1}"#)
        );
        assert_eq!(extract_json_payload("```JSON {\"a\":1}```"), Some(r#"{"a":1}"#));
    }

    #[test]
    fn test_extract_json_payload_adversarial() {
        // prose around the object
        assert_eq!(
            extract_json_payload("Sure! Here you go: {\"a\":{\"b\":2}} Let me know."),
            Some(r#"{"a":{"b":2}}"#)
        );
        // fence without a tag, prose before it
        assert_eq!(
            extract_json_payload("Result:\n```\n{\"a\":1}\n```\nthanks"),
            Some(r#"{"a":1}"#)
        );
        // empty fence falls back to the brace span
        assert_eq!(extract_json_payload("``````{\"a\":1}"), Some(r#"{"a":1}"#));
        // unterminated fence falls back too
        assert_eq!(extract_json_payload("```json {\"a\":1}"), Some(r#"{"a":1}"#));
        assert_eq!(extract_json_payload("} backwards {"), None);
        assert_eq!(extract_json_payload("no json at all"), None);
    }

    #[test]
    fn test_parse_reports_stage() {
        assert_eq!(
            parse_structured_update("nothing here").unwrap_err().kind(),
            UpdateParseErrorKind::Payload
        );
        assert_eq!(
            parse_structured_update("{not json}").unwrap_err().kind(),
            UpdateParseErrorKind::Decode
        );
        assert_eq!(
            parse_structured_update(r#"{"set":{"currency":"JPY"}}"#)
                .unwrap_err()
                .kind(),
            UpdateParseErrorKind::Decode
        );
    }
}
