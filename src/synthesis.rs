//! Report synthesis: extracted text → structured-synthesis service → report.
//!
//! ## Why a lenient, validated parser?
//!
//! The synthesis service is non-deterministic. Despite the contract in
//! [`crate::prompts`] it will occasionally wrap JSON in prose or code
//! fences, emit `null` where `""` was demanded, send a single string where
//! a list was expected, or drop whole nested objects. Parsing happens in two
//! explicit steps:
//!
//! 1. [`locate_json_object`] scans for the first balanced `{...}` block
//!    that parses as a JSON object, skipping braces inside string literals.
//! 2. [`parse_synthesis_response`] deserialises it through field-level
//!    normalisers that coerce every shape into the canonical one, returning
//!    `Ok(SynthesizedReport)` or a [`MalformedResponse`] describing why not.
//!
//! A response missing optional sections is a success with defaults; a
//! response with no object at all is a failure.
//!
//! ## Retry Strategy
//!
//! Service errors are retried with exponential backoff
//! (`retry_backoff_ms * 2^(attempt-1)`). Malformed responses are not
//! retried: the orchestrator applies one time budget to the whole stage.
//!
//! [`MalformedResponse`]: crate::error::IngestError::MalformedResponse

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::pipeline::text::strip_page_markers;
use crate::prompts::{build_synthesis_prompt, SYNTHESIS_SYSTEM_PROMPT};
use crate::report::{
    AdditionalContent, Conclusion, Findings, Guardian, MedicalImage, Patient, ReportStatus, Sex,
    StudyInfo, StudyType, Treatment, Veterinarian, VeterinaryReport, SYNTHESIS_CONFIDENCE,
};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

// ── Service seam ─────────────────────────────────────────────────────────

/// The external text-generation service, reduced to one call.
#[async_trait]
pub trait SynthesisService: Send + Sync {
    /// Send `prompt` and return the raw response text.
    async fn complete(&self, prompt: &str) -> Result<String, IngestError>;
}

/// [`SynthesisService`] backed by an edgequake-llm provider.
pub struct LlmSynthesisService {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl LlmSynthesisService {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &IngestConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    /// Resolve the provider from `config` and the environment.
    pub fn from_config(config: &IngestConfig) -> Result<Self, IngestError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config))
    }
}

#[async_trait]
impl SynthesisService for LlmSynthesisService {
    async fn complete(&self, prompt: &str) -> Result<String, IngestError> {
        let start = Instant::now();
        let messages = vec![
            ChatMessage::system(SYNTHESIS_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];

        let mut last_err: Option<String> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Synthesis: retry {}/{} after {}ms",
                    attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&self.options)).await {
                Ok(response) => {
                    debug!(
                        "Synthesis: {} input tokens, {} output tokens, {:?}",
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(response.content);
                }
                Err(e) => {
                    let err_msg = format!("{}", e);
                    warn!("Synthesis: attempt {} failed: {}", attempt + 1, err_msg);
                    last_err = Some(err_msg);
                }
            }
        }

        Err(IngestError::SynthesisFailed {
            attempts: self.max_retries + 1,
            detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
        })
    }
}

fn build_options(config: &IngestConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, IngestError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        IngestError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. `config.provider`
/// 2. `config.provider_name` + `config.model`
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`
/// 4. OpenAI when `OPENAI_API_KEY` is set
/// 5. `ProviderFactory::from_env`
pub fn resolve_provider(config: &IngestConfig) -> Result<Arc<dyn LLMProvider>, IngestError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-mini");
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-mini");
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| IngestError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

// ── Synthesizer ──────────────────────────────────────────────────────────

/// Drives one synthesis call and maps the answer onto a report.
#[derive(Clone)]
pub struct ReportSynthesizer {
    service: Arc<dyn SynthesisService>,
}

impl ReportSynthesizer {
    pub fn new(service: Arc<dyn SynthesisService>) -> Self {
        Self { service }
    }

    /// `document_text` is the page-marked text from the extraction walk.
    pub async fn synthesize(
        &self,
        source_filename: &str,
        document_text: &str,
        images: Vec<MedicalImage>,
    ) -> Result<VeterinaryReport, IngestError> {
        let prompt = build_synthesis_prompt(document_text);
        debug!("Synthesis prompt: {} chars", prompt.len());

        let raw = self.service.complete(&prompt).await?;
        let parsed = parse_synthesis_response(&raw)?;
        info!(
            "Synthesized report: study type {}, {} veterinarian(s), {} finding(s)",
            parsed.study_info.study_type,
            parsed.veterinarians.len(),
            parsed.findings.items.len()
        );

        Ok(parsed.into_report(source_filename, strip_page_markers(document_text), images))
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────

/// Byte range of the balanced `{...}` block starting at `start`, if it closes.
fn balanced_block_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Find the first balanced `{...}` block in `raw` that parses as a JSON
/// object. Prose, code fences and stray braces around it are ignored.
pub fn locate_json_object(raw: &str) -> Option<(&str, serde_json::Map<String, Value>)> {
    let bytes = raw.as_bytes();
    let mut from = 0;
    while let Some(offset) = raw[from..].find('{') {
        let start = from + offset;
        if let Some(end) = balanced_block_end(bytes, start) {
            let candidate = &raw[start..=end];
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
                return Some((candidate, map));
            }
        }
        from = start + 1;
    }
    None
}

/// Parse a raw synthesis response into validated report fields.
pub fn parse_synthesis_response(raw: &str) -> Result<SynthesizedReport, IngestError> {
    if raw.trim().is_empty() {
        return Err(IngestError::MalformedResponse {
            detail: "empty response".into(),
        });
    }

    let (_, mut map) = locate_json_object(raw).ok_or_else(|| IngestError::MalformedResponse {
        detail: format!("no JSON object found in response: {}", preview(raw)),
    })?;
    resolve_aliases(&mut map, RawReport::ALIASES);

    let raw_report: RawReport =
        serde_json::from_value(Value::Object(map)).map_err(|e| IngestError::MalformedResponse {
            detail: e.to_string(),
        })?;

    Ok(raw_report.validate())
}

fn preview(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(120) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Report fields as returned by the synthesis service, after validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesizedReport {
    pub study_info: StudyInfo,
    pub patient: Patient,
    pub guardian: Guardian,
    pub veterinarians: Vec<Veterinarian>,
    pub findings: Findings,
    pub conclusion: Conclusion,
    pub treatment: Treatment,
    pub additional: AdditionalContent,
}

impl SynthesizedReport {
    pub fn into_report(
        self,
        source_filename: &str,
        raw_extracted_text: String,
        images: Vec<MedicalImage>,
    ) -> VeterinaryReport {
        let mut report = VeterinaryReport::new(source_filename);
        report.status = ReportStatus::Completed;
        report.extraction_confidence = SYNTHESIS_CONFIDENCE;
        report.study_info = self.study_info;
        report.patient = self.patient;
        report.guardian = self.guardian;
        report.veterinarians = self.veterinarians;
        report.findings = self.findings;
        report.conclusion = self.conclusion;
        report.treatment = self.treatment;
        report.additional = self.additional;
        report.images = images;
        report.raw_extracted_text = raw_extracted_text;
        report
    }
}

// Wire shapes. Every field is optional and coerced; `validate` turns them
// into canonical values. Alternative key spellings are folded onto the
// canonical key before deserialising, so a response that carries both
// spellings keeps the canonical one instead of hitting a duplicate field.

/// `(canonical key, alternative spellings in order of preference)`.
type AliasTable = &'static [(&'static str, &'static [&'static str])];

trait WireShape: DeserializeOwned + Default {
    const ALIASES: AliasTable = &[];
}

/// Move each alias onto its canonical key. A canonical key that is already
/// present wins; otherwise the first alias found is kept. Every other
/// spelling is dropped.
fn resolve_aliases(map: &mut serde_json::Map<String, Value>, table: AliasTable) {
    for (canonical, aliases) in table {
        for alias in *aliases {
            if let Some(value) = map.remove(*alias) {
                if !map.contains_key(*canonical) {
                    map.insert((*canonical).to_string(), value);
                }
            }
        }
    }
}

/// Deserialise one wire section, folding its aliases first.
fn shaped<T: WireShape>(value: Value) -> Option<T> {
    match value {
        Value::Object(mut map) => {
            resolve_aliases(&mut map, T::ALIASES);
            T::deserialize(Value::Object(map)).ok()
        }
        other => T::deserialize(other).ok(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawReport {
    #[serde(deserialize_with = "lenient")]
    study_info: RawStudyInfo,
    #[serde(deserialize_with = "lenient")]
    patient: RawPatient,
    #[serde(deserialize_with = "lenient")]
    guardian: RawGuardian,
    #[serde(deserialize_with = "veterinarian_list")]
    veterinarians: Vec<RawVeterinarian>,
    #[serde(deserialize_with = "lenient")]
    findings: RawFindings,
    #[serde(deserialize_with = "lenient")]
    conclusion: RawConclusion,
    #[serde(deserialize_with = "lenient")]
    treatment: RawTreatment,
    #[serde(deserialize_with = "lenient")]
    additional: RawAdditional,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawStudyInfo {
    #[serde(deserialize_with = "text")]
    date: String,
    #[serde(deserialize_with = "text")]
    study_type: String,
    #[serde(deserialize_with = "text")]
    request_reason: String,
    #[serde(deserialize_with = "text")]
    referring_veterinarian: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawPatient {
    #[serde(deserialize_with = "text")]
    name: String,
    #[serde(deserialize_with = "text")]
    species: String,
    #[serde(deserialize_with = "text")]
    breed: String,
    #[serde(deserialize_with = "text")]
    age: String,
    #[serde(deserialize_with = "text")]
    sex: String,
    #[serde(deserialize_with = "text")]
    weight: String,
    #[serde(deserialize_with = "text")]
    id_tag: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawGuardian {
    #[serde(deserialize_with = "text")]
    name: String,
    #[serde(deserialize_with = "text")]
    phone: String,
    #[serde(deserialize_with = "text")]
    email: String,
    #[serde(deserialize_with = "text")]
    address: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawVeterinarian {
    #[serde(deserialize_with = "text")]
    name: String,
    #[serde(deserialize_with = "text")]
    license_number: String,
    #[serde(deserialize_with = "text")]
    clinic: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawFindings {
    #[serde(deserialize_with = "text")]
    summary: String,
    #[serde(deserialize_with = "text_list")]
    items: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawConclusion {
    #[serde(deserialize_with = "text_list")]
    primary_diagnoses: Vec<String>,
    #[serde(deserialize_with = "text_list")]
    differentials: Vec<String>,
    #[serde(deserialize_with = "text")]
    additional_notes: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawTreatment {
    #[serde(deserialize_with = "text_list")]
    recommendations: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawAdditional {
    #[serde(deserialize_with = "text")]
    narrative: String,
    #[serde(deserialize_with = "text_list")]
    observations: Vec<String>,
    #[serde(deserialize_with = "text_list")]
    recommendations: Vec<String>,
    #[serde(deserialize_with = "text_list")]
    medications: Vec<String>,
    #[serde(deserialize_with = "text_list")]
    procedures: Vec<String>,
}

impl WireShape for RawReport {
    const ALIASES: AliasTable = &[
        ("studyInfo", &["study_info", "study"]),
        ("guardian", &["tutor", "owner"]),
        ("veterinarians", &["veterinarian"]),
        ("additional", &["additionalContent", "additional_content"]),
    ];
}

impl WireShape for RawStudyInfo {
    const ALIASES: AliasTable = &[
        ("studyType", &["study_type", "type"]),
        ("requestReason", &["request_reason", "request"]),
        ("referringVeterinarian", &["referring_veterinarian"]),
    ];
}

impl WireShape for RawPatient {
    const ALIASES: AliasTable = &[("idTag", &["id_tag", "microchip"])];
}

impl WireShape for RawGuardian {}

impl WireShape for RawVeterinarian {
    const ALIASES: AliasTable = &[("licenseNumber", &["license_number", "license"])];
}

impl WireShape for RawFindings {
    const ALIASES: AliasTable = &[("items", &["main"])];
}

impl WireShape for RawConclusion {
    const ALIASES: AliasTable = &[
        ("primaryDiagnoses", &["primary_diagnoses", "diagnoses"]),
        ("additionalNotes", &["additional_notes", "notes"]),
    ];
}

impl WireShape for RawTreatment {}

impl WireShape for RawAdditional {
    const ALIASES: AliasTable = &[("narrative", &["report"])];
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

impl RawReport {
    fn validate(self) -> SynthesizedReport {
        let s = self.study_info;
        let p = self.patient;
        let g = self.guardian;
        SynthesizedReport {
            study_info: StudyInfo {
                date: s.date,
                study_type: StudyType::from_label(&s.study_type),
                request_reason: s.request_reason,
                referring_veterinarian: non_empty(s.referring_veterinarian),
            },
            patient: Patient {
                name: p.name,
                species: p.species,
                breed: p.breed,
                age: p.age,
                sex: Sex::from_label(&p.sex),
                weight: non_empty(p.weight),
                id_tag: non_empty(p.id_tag),
            },
            guardian: Guardian {
                name: g.name,
                phone: non_empty(g.phone),
                email: non_empty(g.email),
                address: non_empty(g.address),
            },
            veterinarians: self
                .veterinarians
                .into_iter()
                .filter(|v| !v.name.is_empty() || !v.license_number.is_empty())
                .map(|v| Veterinarian {
                    name: v.name,
                    license_number: non_empty(v.license_number),
                    clinic: non_empty(v.clinic),
                })
                .collect(),
            findings: Findings {
                summary: non_empty(self.findings.summary),
                items: self.findings.items,
            },
            conclusion: Conclusion {
                primary_diagnoses: self.conclusion.primary_diagnoses,
                differentials: self.conclusion.differentials,
                additional_notes: non_empty(self.conclusion.additional_notes),
            },
            treatment: Treatment {
                recommendations: self.treatment.recommendations,
            },
            additional: AdditionalContent {
                narrative: strip_page_markers(&self.additional.narrative),
                observations: self.additional.observations,
                recommendations: self.additional.recommendations,
                medications: self.additional.medications,
                procedures: self.additional.procedures,
            },
        }
    }
}

// ── Field normalisers ────────────────────────────────────────────────────

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Any nested shape; a wrong shape collapses to its default.
fn lenient<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: WireShape,
{
    let value = Value::deserialize(d)?;
    Ok(shaped(value).unwrap_or_default())
}

/// String, number or bool as trimmed text; anything else is `""`.
fn text<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(d)?;
    Ok(scalar_text(&value).unwrap_or_default())
}

/// An array of scalars, or one scalar standing in for a one-item list.
/// Blank items are dropped.
fn text_list<'de, D>(d: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(d)?;
    let items = match value {
        Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
        other => scalar_text(&other).into_iter().collect::<Vec<_>>(),
    };
    Ok(items.into_iter().filter(|s| !s.is_empty()).collect())
}

/// An array of signer objects (or bare names), or a single signer object.
fn veterinarian_list<'de, D>(d: D) -> Result<Vec<RawVeterinarian>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(d)?;
    let entries = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => Vec::new(),
    };
    Ok(entries
        .into_iter()
        .filter_map(|entry| match entry {
            Value::Object(_) => shaped::<RawVeterinarian>(entry),
            other => scalar_text(&other).map(|name| RawVeterinarian {
                name,
                ..Default::default()
            }),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const FULL: &str = r#"{
        "studyInfo": {"date": "12/03/2026", "studyType": "Radiografía", "requestReason": "Tos crónica", "referringVeterinarian": "Dr. Paz"},
        "patient": {"name": "Luna", "species": "Canino", "breed": "Labrador", "age": "7 años", "sex": "Hembra", "weight": 28.5},
        "guardian": {"name": "Marta Ruiz", "phone": ""},
        "veterinarians": [
            {"name": "Dra. Vega", "licenseNumber": "MP-1234", "clinic": "Centro Sur"},
            {"name": "Dr. Ortiz", "licenseNumber": ""}
        ],
        "findings": {"summary": "", "items": ["Cardiomegalia leve", "Patrón bronquial"]},
        "conclusion": {"primaryDiagnoses": ["Bronquitis crónica"], "differentials": [], "additionalNotes": ""},
        "treatment": {"recommendations": ["Control en 30 días"]},
        "additional": {"narrative": "--- PAGE 2 ---\nSe observa...", "medications": "Prednisolona"}
    }"#;

    #[test]
    fn full_response_maps_every_section() {
        let r = parse_synthesis_response(FULL).unwrap();
        assert_eq!(r.study_info.study_type, StudyType::Radiograph);
        assert_eq!(r.study_info.referring_veterinarian.as_deref(), Some("Dr. Paz"));
        assert_eq!(r.patient.sex, Sex::Female);
        assert_eq!(r.patient.weight.as_deref(), Some("28.5"));
        assert_eq!(r.guardian.phone, None);
        assert_eq!(r.veterinarians.len(), 2);
        assert_eq!(r.veterinarians[0].license_number.as_deref(), Some("MP-1234"));
        assert_eq!(r.veterinarians[1].license_number, None);
        assert_eq!(r.findings.items.len(), 2);
        assert_eq!(r.additional.medications, vec!["Prednisolona"]);
        assert!(!r.additional.narrative.contains("PAGE"));
    }

    #[test]
    fn response_missing_every_section_yields_empty_lists() {
        let r = parse_synthesis_response("{}").unwrap();
        assert!(r.veterinarians.is_empty());
        assert!(r.findings.items.is_empty());
        assert!(r.conclusion.primary_diagnoses.is_empty());
        assert!(r.conclusion.differentials.is_empty());
        assert!(r.treatment.recommendations.is_empty());
        assert!(r.additional.observations.is_empty());
        assert_eq!(r.study_info.study_type, StudyType::Other);
        assert_eq!(r.patient.sex, Sex::Unknown);
    }

    #[test]
    fn nulls_and_wrong_shapes_fall_back_to_defaults() {
        let raw = r#"{"patient": "Luna", "findings": {"items": null}, "conclusion": {"primaryDiagnoses": "Otitis"}, "veterinarians": {"name": "Dr. Sol"}}"#;
        let r = parse_synthesis_response(raw).unwrap();
        assert_eq!(r.patient, Patient::default());
        assert!(r.findings.items.is_empty());
        assert_eq!(r.conclusion.primary_diagnoses, vec!["Otitis"]);
        assert_eq!(r.veterinarians.len(), 1);
    }

    #[test]
    fn fenced_and_prose_wrapped_json_parses() {
        let raw = format!("Sure! Here is the extraction:\n```json\n{}\n```\nLet me know if {{anything}} else.", FULL);
        let r = parse_synthesis_response(&raw).unwrap();
        assert_eq!(r.patient.name, "Luna");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let raw = r#"note {not json} then {"patient": {"name": "Rex }{"}}"#;
        let (block, map) = locate_json_object(raw).unwrap();
        assert!(block.starts_with(r#"{"patient""#));
        assert_eq!(map["patient"]["name"], "Rex }{");
    }

    #[test]
    fn escaped_quotes_inside_strings() {
        let raw = r#"{"patient": {"name": "\"Toby\" {jr}"}}"#;
        let r = parse_synthesis_response(raw).unwrap();
        assert_eq!(r.patient.name, "\"Toby\" {jr}");
    }

    #[test]
    fn response_without_object_is_malformed() {
        for raw in ["I could not read the document.", "", "[1, 2, 3]", "{ unclosed"] {
            let err = parse_synthesis_response(raw).unwrap_err();
            assert!(matches!(err, IngestError::MalformedResponse { .. }), "{raw:?}");
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn snake_case_and_alias_keys_are_accepted() {
        let raw = r#"{"study_info": {"study_type": "ultrasound"}, "tutor": {"name": "Ana"}}"#;
        let r = parse_synthesis_response(raw).unwrap();
        assert_eq!(r.study_info.study_type, StudyType::Ultrasound);
        assert_eq!(r.guardian.name, "Ana");
    }

    #[test]
    fn both_spellings_of_a_top_level_key_keep_the_canonical_one() {
        let raw = r#"{
            "veterinarian": {"name": "Dr. Paz"},
            "veterinarians": [{"name": "Dra. Vega", "licenseNumber": "MP-1234"}],
            "tutor": {"name": "Ana"},
            "guardian": {"name": "Marta Ruiz"},
            "patient": {"name": "Luna"}
        }"#;
        let r = parse_synthesis_response(raw).unwrap();
        assert_eq!(r.veterinarians.len(), 1);
        assert_eq!(r.veterinarians[0].name, "Dra. Vega");
        assert_eq!(r.guardian.name, "Marta Ruiz");
        assert_eq!(r.patient.name, "Luna");
    }

    #[test]
    fn both_spellings_inside_a_section_keep_the_rest_of_the_section() {
        let raw = r#"{
            "studyInfo": {"studyType": "radiograph", "type": "RX tórax", "date": "12/03/2026", "requestReason": "Tos"},
            "findings": {"items": ["Cardiomegalia leve"], "main": ["otro"], "summary": "Leve"},
            "veterinarians": [{"name": "Dra. Vega", "licenseNumber": "MP-1234", "license": "X-9"}]
        }"#;
        let r = parse_synthesis_response(raw).unwrap();
        assert_eq!(r.study_info.study_type, StudyType::Radiograph);
        assert_eq!(r.study_info.date, "12/03/2026");
        assert_eq!(r.study_info.request_reason, "Tos");
        assert_eq!(r.findings.items, vec!["Cardiomegalia leve"]);
        assert_eq!(r.findings.summary.as_deref(), Some("Leve"));
        assert_eq!(r.veterinarians[0].license_number.as_deref(), Some("MP-1234"));
    }

    #[test]
    fn first_alias_wins_when_canonical_key_is_absent() {
        let raw = r#"{"study": {"type": "ultrasound"}, "study_info": {"study_type": "radiograph"}}"#;
        let r = parse_synthesis_response(raw).unwrap();
        assert_eq!(r.study_info.study_type, StudyType::Radiograph);
    }

    struct CannedService {
        reply: Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SynthesisService for CannedService {
        async fn complete(&self, prompt: &str) -> Result<String, IngestError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone().map_err(|detail| IngestError::SynthesisFailed {
                attempts: 1,
                detail,
            })
        }
    }

    #[tokio::test]
    async fn synthesizer_builds_report_with_fixed_confidence() {
        let service = Arc::new(CannedService {
            reply: Ok(FULL.to_string()),
            prompts: Mutex::new(Vec::new()),
        });
        let synth = ReportSynthesizer::new(service.clone());
        let report = synth
            .synthesize("rx-luna.pdf", "\n--- PAGE 1 ---\nPaciente: Luna\n", Vec::new())
            .await
            .unwrap();
        assert_eq!(report.extraction_confidence, SYNTHESIS_CONFIDENCE);
        assert_eq!(report.source_filename, "rx-luna.pdf");
        assert_eq!(report.raw_extracted_text, "Paciente: Luna");
        assert!(service.prompts.lock().unwrap()[0].contains("Paciente: Luna"));
    }

    #[tokio::test]
    async fn service_error_propagates() {
        let synth = ReportSynthesizer::new(Arc::new(CannedService {
            reply: Err("503 upstream".into()),
            prompts: Mutex::new(Vec::new()),
        }));
        let err = synth.synthesize("a.pdf", "text", Vec::new()).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn build_options_defaults() {
        let config = IngestConfig::default();
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.1));
        assert_eq!(opts.max_tokens, Some(4096));
    }
}
