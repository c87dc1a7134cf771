// src/synthesizer.rs

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, info, info_span, warn};

use crate::error::UpdateAiError;
use crate::heuristics::fallback_structured_update;
use crate::llm_update::{
    AttemptFailure, DEFAULT_ENDPOINT, DEFAULT_MODELS, GeminiClient, TextModel, build_prompt,
};
use crate::model::InvoiceSnapshot;
use crate::update::{StructuredInvoiceUpdate, parse_structured_update};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Everything the synthesizer needs, resolved by the caller.
#[derive(Debug, Clone)]
pub struct SynthesizerSettings {
    pub api_key: Option<String>,
    /// Overrides the default candidate list when set.
    pub model: Option<String>,
    pub endpoint: String,
    pub timeout: Duration,
    pub rule_fallback: bool,
}

impl Default for SynthesizerSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            rule_fallback: false,
        }
    }
}

impl SynthesizerSettings {
    pub fn candidate_models(&self) -> Vec<String> {
        match self.model.as_deref().map(str::trim) {
            Some(model) if !model.is_empty() => vec![model.to_string()],
            _ => DEFAULT_MODELS.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    Llm,
    Fallback,
}

impl UpdateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateSource::Llm => "llm",
            UpdateSource::Fallback => "fallback",
        }
    }
}

/// One failed candidate model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelAttempt {
    pub model: String,
    pub failure: AttemptFailure,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct SynthesizedUpdate {
    pub update: StructuredInvoiceUpdate,
    pub source: UpdateSource,
    /// The model that produced the update, when it came from one.
    pub model: Option<String>,
    /// Failed attempts before the result, in order.
    pub attempts: Vec<ModelAttempt>,
}

/// Turns an edit instruction into a structured update.
pub struct UpdateSynthesizer {
    settings: SynthesizerSettings,
    model: Option<Arc<dyn TextModel>>,
}

impl UpdateSynthesizer {
    /// Uses the Gemini client when an API key is configured.
    pub fn new(settings: SynthesizerSettings) -> Self {
        let model = settings.api_key().map(|key| {
            Arc::new(GeminiClient::new(
                settings.endpoint.clone(),
                key,
                settings.timeout,
            )) as Arc<dyn TextModel>
        });
        Self { settings, model }
    }

    /// Uses the given backend; a missing API key still counts as unconfigured.
    pub fn with_model(settings: SynthesizerSettings, model: Arc<dyn TextModel>) -> Self {
        let model = settings.api_key().map(|_| model);
        Self { settings, model }
    }

    pub fn settings(&self) -> &SynthesizerSettings {
        &self.settings
    }

    pub async fn synthesize(
        &self,
        instruction: &str,
        invoice: &InvoiceSnapshot,
    ) -> Result<SynthesizedUpdate, UpdateAiError> {
        let result = match &self.model {
            Some(model) => self.from_model(model.as_ref(), instruction, invoice).await,
            None => Err(UpdateAiError::MissingApiKey),
        };

        match result {
            Ok(synthesized) => Ok(synthesized),
            Err(err) if self.settings.rule_fallback => {
                warn!(code = err.code(), error = %err, "Model path failed, using rule fallback");
                let attempts = match err {
                    UpdateAiError::ModelRequestFailed { attempts, .. } => attempts,
                    UpdateAiError::MissingApiKey => Vec::new(),
                };
                Ok(SynthesizedUpdate {
                    update: fallback_structured_update(instruction, invoice),
                    source: UpdateSource::Fallback,
                    model: None,
                    attempts,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Try each candidate in turn; the first usable update wins.
    async fn from_model(
        &self,
        model: &dyn TextModel,
        instruction: &str,
        invoice: &InvoiceSnapshot,
    ) -> Result<SynthesizedUpdate, UpdateAiError> {
        let prompt = build_prompt(instruction, invoice);
        let mut attempts = Vec::new();

        for candidate in self.settings.candidate_models() {
            let span = info_span!("model_attempt", model = %candidate);
            let started = Instant::now();

            let outcome = self
                .attempt(model, &candidate, &prompt)
                .instrument(span.clone())
                .await;

            match outcome {
                Ok(update) => {
                    span.in_scope(|| info!(failed_before = attempts.len(), "Structured update received"));
                    return Ok(SynthesizedUpdate {
                        update,
                        source: UpdateSource::Llm,
                        model: Some(candidate),
                        attempts,
                    });
                }
                Err(failure) => {
                    span.in_scope(|| warn!(reason = %failure.describe(&candidate), "Model attempt failed"));
                    attempts.push(ModelAttempt {
                        model: candidate,
                        failure,
                        elapsed: started.elapsed(),
                    });
                }
            }
        }

        let message = attempts
            .last()
            .map(|a| a.failure.describe(&a.model))
            .unwrap_or_else(|| "Invoice edit request failed.".to_string());
        Err(UpdateAiError::ModelRequestFailed { message, attempts })
    }

    async fn attempt(
        &self,
        model: &dyn TextModel,
        candidate: &str,
        prompt: &str,
    ) -> Result<StructuredInvoiceUpdate, AttemptFailure> {
        let text = tokio::time::timeout(self.settings.timeout, model.generate(candidate, prompt))
            .await
            .map_err(|_| AttemptFailure::TimedOut)??;

        if text.trim().is_empty() {
            return Err(AttemptFailure::EmptyResponse);
        }

        parse_structured_update(&text).map_err(|e| AttemptFailure::InvalidJson(e.to_string()))
    }
}
