// src/service.rs

use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

use crate::applier::apply_structured_invoice_update;
use crate::error::{ServiceError, StoreError};
use crate::heuristics::{DraftRequest, generate_invoice_draft};
use crate::invoice_db::{InvoiceStore, NewVersion, VersionRecord};
use crate::model::{InvoiceSnapshot, InvoiceSummary};
use crate::serialization::{
    InvoiceRecord, raw_json_for_edit, record_from_draft, record_from_snapshot, snapshot_from_record,
};
use crate::synthesizer::{UpdateSource, UpdateSynthesizer};
use crate::update::StructuredInvoiceUpdate;

pub const NO_CHANGES_MESSAGE: &str = "No changes detected from instruction.";

/// Sender details used when the prompt doesn't name them.
#[derive(Debug, Clone, Default)]
pub struct BusinessDefaults {
    pub from_name: Option<String>,
    pub from_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedInvoice {
    pub invoice: InvoiceSnapshot,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum EditOutcome {
    /// The instruction produced an empty update; nothing was written.
    #[serde(rename_all = "camelCase")]
    NoChanges {
        invoice: InvoiceSnapshot,
        update_source: UpdateSource,
        structured_update: StructuredInvoiceUpdate,
        message: &'static str,
    },
    #[serde(rename_all = "camelCase")]
    Updated {
        invoice: InvoiceSnapshot,
        update_source: UpdateSource,
        structured_update: StructuredInvoiceUpdate,
        version: u32,
    },
}

/// Generate and edit flows over one store and one synthesizer.
pub struct InvoiceService {
    store: InvoiceStore,
    synthesizer: UpdateSynthesizer,
}

impl InvoiceService {
    pub fn new(store: InvoiceStore, synthesizer: UpdateSynthesizer) -> Self {
        Self { store, synthesizer }
    }

    pub fn store(&self) -> &InvoiceStore {
        &self.store
    }

    fn load(&self, owner_id: &str, invoice_id: &str) -> Result<InvoiceRecord, StoreError> {
        self.store
            .find_invoice(invoice_id, owner_id)?
            .ok_or_else(|| StoreError::NotFound(invoice_id.to_string()))
    }

    /// Draft an invoice from a prompt and attachment text.
    ///
    /// Without `invoice_id` this creates a new invoice at version 1. With
    /// one, the owner's existing invoice is overwritten by the fresh draft
    /// (including a new invoice number) and a new version is appended.
    pub fn generate(
        &mut self,
        owner_id: &str,
        defaults: &BusinessDefaults,
        prompt: &str,
        extracted_text: &str,
        invoice_id: Option<&str>,
    ) -> Result<GeneratedInvoice, ServiceError> {
        let draft = generate_invoice_draft(&DraftRequest {
            prompt: prompt.to_string(),
            extracted_text: extracted_text.to_string(),
            default_from_name: defaults.from_name.clone(),
            default_from_email: defaults.from_email.clone(),
        });
        let now = OffsetDateTime::now_utc();

        let (record, version) = match invoice_id {
            Some(id) => {
                let existing = self.load(owner_id, id)?;
                let mut record = record_from_draft(&existing.id, owner_id, &draft, now)?;
                record.created_at = existing.created_at;
                let version = self.store.update_invoice_with_new_version(
                    &record,
                    &NewVersion {
                        source_prompt: prompt.to_string(),
                        snapshot: record.raw_json.clone().unwrap_or_default(),
                    },
                )?;
                (record, version)
            }
            None => {
                let id = InvoiceStore::generate_id(owner_id, &draft.invoice_number, now);
                let record = record_from_draft(&id, owner_id, &draft, now)?;
                let version = self.store.create_invoice_with_version(
                    &record,
                    &NewVersion {
                        source_prompt: prompt.to_string(),
                        snapshot: record.raw_json.clone().unwrap_or_default(),
                    },
                )?;
                (record, version)
            }
        };

        info!(
            invoice_id = %record.id,
            invoice_number = %record.invoice_number,
            version,
            items = record.items.len(),
            "Invoice generated"
        );
        Ok(GeneratedInvoice {
            invoice: snapshot_from_record(&record)?,
            version,
        })
    }

    /// Apply a natural-language edit to a stored invoice.
    pub async fn edit(
        &mut self,
        owner_id: &str,
        invoice_id: &str,
        instruction: &str,
    ) -> Result<EditOutcome, ServiceError> {
        let existing = self.load(owner_id, invoice_id)?;
        let current = snapshot_from_record(&existing)?;

        let synthesized = self.synthesizer.synthesize(instruction, &current).await?;
        if synthesized.update.is_empty() {
            info!(invoice_id = %invoice_id, source = synthesized.source.as_str(), "Edit produced no changes");
            return Ok(EditOutcome::NoChanges {
                invoice: current,
                update_source: synthesized.source,
                structured_update: synthesized.update,
                message: NO_CHANGES_MESSAGE,
            });
        }

        let mut next = apply_structured_invoice_update(&current, &synthesized.update);
        let source_text = [
            existing.source_text.clone().unwrap_or_default(),
            format!("Edit instruction: {instruction}"),
        ]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
        next.source_text = Some(source_text);
        next.prompt = Some(existing.prompt.clone().unwrap_or_default());

        let raw_json = raw_json_for_edit(&next, instruction, &synthesized)?;
        let record = record_from_snapshot(&next, &existing, raw_json.clone(), OffsetDateTime::now_utc())?;
        let version = self.store.update_invoice_with_new_version(
            &record,
            &NewVersion {
                source_prompt: instruction.to_string(),
                snapshot: raw_json,
            },
        )?;

        info!(
            invoice_id = %invoice_id,
            version,
            source = synthesized.source.as_str(),
            model = synthesized.model.as_deref().unwrap_or("-"),
            failed_attempts = synthesized.attempts.len(),
            "Invoice edited"
        );
        Ok(EditOutcome::Updated {
            invoice: snapshot_from_record(&record)?,
            update_source: synthesized.source,
            structured_update: synthesized.update,
            version,
        })
    }

    pub fn show(&self, owner_id: &str, invoice_id: &str) -> Result<InvoiceSnapshot, ServiceError> {
        Ok(snapshot_from_record(&self.load(owner_id, invoice_id)?)?)
    }

    pub fn list(&self, owner_id: &str) -> Result<Vec<InvoiceSummary>, ServiceError> {
        Ok(self.store.list_invoices(owner_id)?)
    }

    /// Version history, only for invoices the owner can see.
    pub fn versions(&self, owner_id: &str, invoice_id: &str) -> Result<Vec<VersionRecord>, ServiceError> {
        self.load(owner_id, invoice_id)?;
        Ok(self.store.list_versions(invoice_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpdateAiError;
    use crate::llm_update::{AttemptFailure, TextModel};
    use crate::synthesizer::SynthesizerSettings;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    const ACME: &str = "Invoice for Acme Corp\n- Design work x2 @ 150\n- Hosting x1 @ 40\ntax 8%\ndiscount 10%";

    fn service(rule_fallback: bool) -> InvoiceService {
        let settings = SynthesizerSettings {
            rule_fallback,
            ..SynthesizerSettings::default()
        };
        InvoiceService::new(
            InvoiceStore::open_in_memory().unwrap(),
            UpdateSynthesizer::new(settings),
        )
    }

    /// Fails for the first candidate model, then answers with `reply`.
    struct FlakyModel {
        reply: &'static str,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextModel for FlakyModel {
        async fn generate(&self, model: &str, _prompt: &str) -> Result<String, AttemptFailure> {
            let first = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(model.to_string());
                calls.len() == 1
            };
            if first {
                return Err(AttemptFailure::Status {
                    status: 503,
                    body: "overloaded".into(),
                });
            }
            Ok(self.reply.to_string())
        }
    }

    fn service_with_model(reply: &'static str) -> InvoiceService {
        let settings = SynthesizerSettings {
            api_key: Some("test-key".into()),
            ..SynthesizerSettings::default()
        };
        let model = Arc::new(FlakyModel {
            reply,
            calls: Mutex::new(Vec::new()),
        });
        InvoiceService::new(
            InvoiceStore::open_in_memory().unwrap(),
            UpdateSynthesizer::with_model(settings, model),
        )
    }

    #[test]
    fn test_generate_creates_version_one() {
        let mut svc = service(true);
        let generated = svc
            .generate("owner", &BusinessDefaults::default(), ACME, "", None)
            .unwrap();

        assert_eq!(generated.version, 1);
        assert_eq!(generated.invoice.total, 330.48);
        assert_eq!(svc.show("owner", &generated.invoice.id).unwrap(), generated.invoice);
        assert_eq!(svc.list("owner").unwrap().len(), 1);
        assert!(matches!(
            svc.show("someone-else", &generated.invoice.id),
            Err(ServiceError::Store(StoreError::NotFound(_)))
        ));
    }

    #[test]
    fn test_generate_with_id_revises() {
        let mut svc = service(true);
        let defaults = BusinessDefaults {
            from_name: Some("Studio Nine".into()),
            from_email: Some("hello@studio.nine".into()),
        };
        let first = svc.generate("owner", &defaults, ACME, "", None).unwrap();
        let second = svc
            .generate("owner", &defaults, "Invoice for Globex\n- Audit x1 @ 900", "", Some(first.invoice.id.as_str()))
            .unwrap();

        assert_eq!(second.version, 2);
        assert_eq!(second.invoice.id, first.invoice.id);
        assert_eq!(second.invoice.total, 900.0);
        assert_eq!(second.invoice.from_name, "Studio Nine");
        assert_eq!(svc.list("owner").unwrap().len(), 1);

        let versions = svc.versions("owner", &first.invoice.id).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].source_prompt, "Invoice for Globex\n- Audit x1 @ 900");
    }

    #[tokio::test]
    async fn test_edit_with_rule_fallback_stores_new_version() {
        let mut svc = service(true);
        let id = svc
            .generate("owner", &BusinessDefaults::default(), ACME, "", None)
            .unwrap()
            .invoice
            .id;

        let outcome = svc.edit("owner", &id, "set vat to 20%").await.unwrap();
        let EditOutcome::Updated { invoice, update_source, version, .. } = outcome else {
            panic!("expected an update");
        };
        assert_eq!(version, 2);
        assert_eq!(update_source, UpdateSource::Fallback);
        assert_eq!(invoice.tax_rate, 20.0);
        assert_eq!(invoice.tax_amount, 61.2);
        assert_eq!(invoice.total, 367.2);
        assert_eq!(
            invoice.source_text.as_deref(),
            Some("Edit instruction: set vat to 20%")
        );

        let versions = svc.versions("owner", &id).unwrap();
        assert_eq!(versions[1].source_prompt, "set vat to 20%");
        assert_eq!(versions[1].snapshot["updateSource"], "fallback");
        assert_eq!(versions[1].snapshot["editInstruction"], "set vat to 20%");
    }

    #[tokio::test]
    async fn test_empty_edit_writes_nothing() {
        let mut svc = service(true);
        let id = svc
            .generate("owner", &BusinessDefaults::default(), ACME, "", None)
            .unwrap()
            .invoice
            .id;

        let outcome = svc.edit("owner", &id, "make it look nicer").await.unwrap();
        let EditOutcome::NoChanges { message, invoice, .. } = outcome else {
            panic!("expected no changes");
        };
        assert_eq!(message, NO_CHANGES_MESSAGE);
        assert_eq!(invoice.total, 330.48);
        assert_eq!(svc.versions("owner", &id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_edit_without_key_or_fallback_fails() {
        let mut svc = service(false);
        let id = svc
            .generate("owner", &BusinessDefaults::default(), ACME, "", None)
            .unwrap()
            .invoice
            .id;

        let err = svc.edit("owner", &id, "set vat to 20%").await.unwrap_err();
        assert!(matches!(err, ServiceError::Ai(UpdateAiError::MissingApiKey)));
        assert_eq!(svc.versions("owner", &id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_edit_from_model_records_attempts() {
        let mut svc = service_with_model(r#"```json
{"removeItems":["Hosting"],"set":{"notes":"Thanks!"}}
```"#);
        let id = svc
            .generate("owner", &BusinessDefaults::default(), ACME, "", None)
            .unwrap()
            .invoice
            .id;

        let outcome = svc.edit("owner", &id, "drop hosting and thank them").await.unwrap();
        let EditOutcome::Updated { invoice, update_source, version, .. } = outcome else {
            panic!("expected an update");
        };
        assert_eq!(version, 2);
        assert_eq!(update_source, UpdateSource::Llm);
        assert_eq!(invoice.items.len(), 1);
        assert_eq!(invoice.subtotal, 300.0);
        assert_eq!(invoice.notes, "Thanks!");
        assert_eq!(svc.show("owner", &id).unwrap(), invoice);

        let snapshot = &svc.versions("owner", &id).unwrap()[1].snapshot;
        assert_eq!(snapshot["updateSource"], "llm");
        assert_eq!(snapshot["updateModel"], "gemini-1.5-flash-latest");
        assert_eq!(snapshot["failedAttempts"][0]["model"], "gemini-2.0-flash-001");
        assert_eq!(
            snapshot["failedAttempts"][0]["reason"],
            "Invoice edit model 'gemini-2.0-flash-001' failed (503). overloaded"
        );
    }

    #[tokio::test]
    async fn test_edit_nulling_required_fields_writes_nothing() {
        let mut svc = service_with_model(r#"{"set":{"title":null,"fromName":null}}"#);
        let id = svc
            .generate("owner", &BusinessDefaults::default(), ACME, "", None)
            .unwrap()
            .invoice
            .id;

        let err = svc.edit("owner", &id, "blank the title").await.unwrap_err();
        assert!(matches!(err, ServiceError::Ai(UpdateAiError::ModelRequestFailed { .. })));
        assert_eq!(svc.versions("owner", &id).unwrap().len(), 1);
    }
}
