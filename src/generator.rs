//! Answer synthesis through the profile's synthesis policy.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Result;
use crate::llm::{ChatMessage, CompletionClient, CompletionRequest};
use crate::model::{clip_text, AnswerDraft, EvidenceItem, PartialAnswer, RetrievalPlan};
use crate::profile::AgentProfile;

/// Marker of the synthetic expectation-coverage summary.
pub const EXPECTATION_SUMMARY_MARKER: &str = "R999";

/// Everything the generator needs for one synthesis call.
pub struct GenerationRequest<'a> {
    pub query: &'a str,
    pub scope_label: &'a str,
    pub plan: &'a RetrievalPlan,
    pub chunks: &'a [EvidenceItem],
    pub summaries: &'a [EvidenceItem],
    pub working_memory: &'a Map<String, Value>,
    pub partial_answers: &'a [PartialAnswer],
    pub profile: &'a AgentProfile,
}

/// Answer generator port.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<AnswerDraft>;
}

/// Build the synthetic `R999` summary from an expectation-coverage record,
/// so the generator can surface covered/missing expectations.
pub fn expectation_summary(record: &Value) -> Option<EvidenceItem> {
    let record = record.as_object()?;
    let covered = record
        .get("covered")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    let missing = record.get("missing").and_then(Value::as_array);
    let missing_count = missing.map(Vec::len).unwrap_or(0);
    let ratio = record
        .get("coverage_ratio")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let mut lines = vec![
        "[EXPECTATION_COVERAGE]".to_string(),
        format!("coverage_ratio={ratio}"),
        format!("covered={covered}"),
        format!("missing={missing_count}"),
    ];
    if let Some(missing) = missing {
        for row in missing.iter().take(6) {
            let Some(row) = row.as_object() else { continue };
            let id = row.get("id").and_then(Value::as_str).unwrap_or("expectation");
            let risk = row.get("missing_risk").and_then(Value::as_str).unwrap_or("");
            let reason = row.get("reason").and_then(Value::as_str).unwrap_or("");
            lines.push(format!("- missing:{id} risk={risk} reason={reason}"));
        }
    }
    let content = lines.join("\n");
    Some(
        EvidenceItem::new(EXPECTATION_SUMMARY_MARKER, content.clone(), 1.0).with_metadata(
            serde_json::json!({
                "row": {"content": content, "metadata": {}}
            }),
        ),
    )
}

/// LLM-backed generator assembling the synthesis prompt from the profile.
pub struct LlmAnswerGenerator {
    client: Arc<dyn CompletionClient>,
}

impl LlmAnswerGenerator {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    fn system_prompt(profile: &AgentProfile, plan: &RetrievalPlan) -> String {
        let synthesis = &profile.synthesis;
        let mut lines = vec![
            synthesis.system_persona.clone(),
            format!(
                "Rol: {}. Tono: {}.",
                profile.identity.role, profile.identity.tone
            ),
            format!(
                "Cita evidencia con el formato {} usando los marcadores provistos.",
                synthesis.citation_format
            ),
        ];
        lines.extend(synthesis.synthesis_rules.iter().cloned());
        let style = if plan.require_literal_evidence {
            &synthesis.strict_style
        } else {
            &synthesis.interpretive_style
        };
        lines.extend(style.iter().cloned());
        if plan.response_contract.as_deref() == Some("grounded_inference") {
            lines.push(
                "Estructura la respuesta con secciones 'Hechos citados' e 'Inferencias'; \
                 cada inferencia debe citar al menos dos evidencias."
                    .to_string(),
            );
        }
        lines.join("\n")
    }

    fn evidence_block(items: &[EvidenceItem]) -> String {
        items
            .iter()
            .map(|item| {
                let anchor = match (item.row_standard(), item.row_metadata().and_then(|meta| {
                    meta.get("clause_id").and_then(Value::as_str).map(str::to_string)
                })) {
                    (Some(standard), Some(clause)) => format!("{standard} {clause}"),
                    (Some(standard), None) => standard,
                    _ => String::new(),
                };
                if anchor.is_empty() {
                    format!("[{}] {}", item.source, clip_text(&item.content, 700))
                } else {
                    format!("[{}] ({anchor}) {}", item.source, clip_text(&item.content, 700))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn user_prompt(request: &GenerationRequest<'_>) -> String {
        let mut sections = Vec::new();
        if !request.scope_label.is_empty() {
            sections.push(format!("Alcance: {}", request.scope_label));
        }
        sections.push(format!("Pregunta: {}", request.query));
        if !request.chunks.is_empty() {
            sections.push(format!(
                "Evidencia (fragmentos):\n{}",
                Self::evidence_block(request.chunks)
            ));
        }
        if !request.summaries.is_empty() {
            sections.push(format!(
                "Evidencia (resumenes):\n{}",
                Self::evidence_block(request.summaries)
            ));
        }
        if !request.partial_answers.is_empty() {
            let partials = request
                .partial_answers
                .iter()
                .map(|partial| {
                    format!(
                        "- [{}] {} -> {}",
                        partial.id,
                        partial.query,
                        clip_text(&partial.summary, 400)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("Respuestas parciales por subconsulta:\n{partials}"));
        }
        let memory: Map<String, Value> = request
            .working_memory
            .iter()
            .filter(|(key, _)| key.as_str() != "last_replan_reason")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !memory.is_empty() {
            sections.push(format!(
                "Resultados de herramientas:\n{}",
                serde_json::to_string(&memory).unwrap_or_default()
            ));
        }
        sections.push(
            "Responde citando los marcadores de evidencia relevantes.".to_string(),
        );
        sections.join("\n\n")
    }
}

#[async_trait]
impl AnswerGenerator for LlmAnswerGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<AnswerDraft> {
        let mut summaries = request.summaries.to_vec();
        if let Some(record) = request.working_memory.get("expectation_coverage") {
            if let Some(summary) = expectation_summary(record) {
                summaries.push(summary);
            }
        }
        let borrowed = GenerationRequest {
            query: request.query,
            scope_label: request.scope_label,
            plan: request.plan,
            chunks: request.chunks,
            summaries: &summaries,
            working_memory: request.working_memory,
            partial_answers: request.partial_answers,
            profile: request.profile,
        };
        debug!(
            chunks = request.chunks.len(),
            summaries = summaries.len(),
            partials = request.partial_answers.len(),
            "generator_call"
        );
        let completion = self
            .client
            .complete(CompletionRequest::new(vec![
                ChatMessage::system(Self::system_prompt(request.profile, request.plan)),
                ChatMessage::user(Self::user_prompt(&borrowed)),
            ]))
            .await?;

        let mut evidence: Vec<EvidenceItem> = request.chunks.to_vec();
        evidence.extend(summaries);
        Ok(AnswerDraft {
            text: completion.content.trim().to_string(),
            mode: request.plan.mode.clone(),
            evidence,
        })
    }
}
