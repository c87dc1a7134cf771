pub mod applier;
pub mod attachments;
pub mod config;
pub mod error;
pub mod heuristics;
pub mod invoice_db;
pub mod llm_update;
pub mod model;
pub mod money;
pub mod serialization;
pub mod service;
pub mod synthesizer;
pub mod update;

pub use applier::apply_structured_invoice_update;
pub use error::{ServiceError, StoreError, UpdateAiError, UpdateParseError};
pub use heuristics::{DraftRequest, fallback_structured_update, generate_invoice_draft};
pub use model::{Currency, DiscountType, InvoiceDraft, InvoiceSnapshot, InvoiceStatus, LineItem};
pub use service::{EditOutcome, InvoiceService};
pub use synthesizer::{SynthesizedUpdate, SynthesizerSettings, UpdateSource, UpdateSynthesizer};
pub use update::{StructuredInvoiceUpdate, parse_structured_update};
