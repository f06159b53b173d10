//! Session context assembler
//!
//! Builds the tiered (HOT/WARM/COLD) bundle an agent receives when resuming
//! work: identity, unread-message count, guardrails, the pending hand-off,
//! and project context at increasing depth. The serialized bundle is held
//! under a token budget by dropping sections in a fixed priority order;
//! every drop is reported in the response metadata, never silent.

use crate::auth::authorize_read;
use crate::error::{MnemographError, Result};
use crate::storage::MemoryStore;
use crate::types::{RecordPayload, RequestContext};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Context assembly depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextDepth {
    /// Identity, unread count, guardrails, pending hand-off
    Hot,
    /// Hot + project summary, recent observations, recent decisions
    Warm,
    /// Warm + full project observation history
    Cold,
}

/// Pluggable token estimator
///
/// The chars-to-tokens ratio is an approximation whose precision only
/// affects budget tuning, so it stays swappable rather than baked in.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u32;
}

/// Default estimator: ceil(chars / ratio)
pub struct CharRatioEstimator {
    pub chars_per_token: f32,
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
        }
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> u32 {
        (text.chars().count() as f32 / self.chars_per_token).ceil() as u32
    }
}

/// Tuning knobs for the assembler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub default_max_tokens: u32,
    pub warm_observation_limit: u32,
    pub recency_window_days: i64,
    pub decision_limit: u32,
    pub identity_limit: u32,
    pub guardrail_limit: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 4000,
            warm_observation_limit: 20,
            recency_window_days: 14,
            decision_limit: 5,
            identity_limit: 10,
            guardrail_limit: 10,
        }
    }
}

/// How many entries survive the trim steps for guardrails and identity
const TRIMMED_SECTION_LEN: usize = 3;

/// Request to assemble context for a resuming agent
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContextRequest {
    pub agent_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub depth: ContextDepth,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// One identity item with its provenance/trust marker. Agent memories are
/// self-reported, so the marker travels with each item rather than being
/// implied by position in the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceWrapped {
    pub content: String,
    /// Always "agent_reported" for identity items
    pub source: String,
    pub recorded_at: DateTime<Utc>,
}

impl ProvenanceWrapped {
    fn agent_reported(content: String, recorded_at: DateTime<Utc>) -> Self {
        Self {
            content,
            source: "agent_reported".to_string(),
            recorded_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub agent_id: String,
    pub learnings: Vec<ProvenanceWrapped>,
    pub preferences: Vec<ProvenanceWrapped>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailNote {
    pub name: String,
    pub contents: Vec<String>,
}

/// The consumed hand-off as seen by the opening session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffNote {
    pub from_agent: String,
    pub summary: String,
    pub open_items: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextObservation {
    pub contents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContext {
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub decisions: Vec<String>,
    pub recent_observations: Vec<ContextObservation>,
    /// Full history, COLD only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<ContextObservation>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMetadata {
    pub estimated_tokens: u32,
    pub token_budget: u32,
    pub dropped_sections: Vec<String>,
}

/// The assembled bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContextBundle {
    pub depth: ContextDepth,
    pub identity: AgentIdentity,
    pub unread_messages: u64,
    pub guardrails: Vec<GuardrailNote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff: Option<HandoffNote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectContext>,
    pub metadata: ContextMetadata,
}

fn observation_view(payload: &RecordPayload) -> Option<(&Vec<String>, Option<&str>)> {
    match payload {
        RecordPayload::Observation {
            contents,
            message_type,
            ..
        } => Some((contents, message_type.as_deref())),
        _ => None,
    }
}

/// Session context assembler
pub struct ContextAssembler {
    store: Arc<dyn MemoryStore>,
    estimator: Arc<dyn TokenEstimator>,
    config: ContextConfig,
    legacy_passthrough: bool,
}

impl ContextAssembler {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        estimator: Arc<dyn TokenEstimator>,
        config: ContextConfig,
        legacy_passthrough: bool,
    ) -> Self {
        Self {
            store,
            estimator,
            config,
            legacy_passthrough,
        }
    }

    /// Assemble a bundle for a resuming agent.
    ///
    /// When a project id is given, the single active, unconsumed hand-off
    /// for that project is returned and marked consumed in the same call;
    /// later assemblies will not see it again.
    pub async fn assemble(
        &self,
        context: &RequestContext,
        request: &SessionContextRequest,
    ) -> Result<SessionContextBundle> {
        let auth = authorize_read(context, self.legacy_passthrough);
        if !auth.authorized {
            return Err(MnemographError::Forbidden(
                "no graph permissions".to_string(),
            ));
        }

        let tenant_id = &context.tenant_id;
        let budget = request
            .max_tokens
            .unwrap_or(self.config.default_max_tokens);
        if budget == 0 {
            return Err(MnemographError::Validation(
                "maxTokens must be positive".to_string(),
            ));
        }

        // HOT: identity, wrapped item by item with its provenance marker
        let identity_rows = self
            .store
            .observations_for_entity(
                tenant_id,
                &request.agent_id,
                None,
                Some(self.config.identity_limit * 2),
            )
            .await?;

        let mut learnings = Vec::new();
        let mut preferences = Vec::new();
        for record in &identity_rows {
            if let Some((contents, message_type)) = observation_view(&record.payload) {
                let target = match message_type {
                    Some("learning") => &mut learnings,
                    Some("preference") => &mut preferences,
                    _ => continue,
                };
                if target.len() < self.config.identity_limit as usize {
                    for content in contents {
                        target.push(ProvenanceWrapped::agent_reported(
                            content.clone(),
                            record.created_at,
                        ));
                    }
                }
            }
        }

        // HOT: count only, not content, to bound bundle size
        let unread_messages = self
            .store
            .count_unread_messages(tenant_id, &request.agent_id)
            .await?;

        // HOT: guardrail entities with their note contents
        let mut guardrails = Vec::new();
        for entity in self
            .store
            .list_entities_by_type(tenant_id, "guardrail")
            .await?
            .iter()
            .take(self.config.guardrail_limit as usize)
        {
            if let RecordPayload::Entity { name, .. } = &entity.payload {
                let contents = self
                    .store
                    .observations_for_entity(tenant_id, name, None, Some(3))
                    .await?
                    .iter()
                    .filter_map(|r| observation_view(&r.payload).map(|(c, _)| c.clone()))
                    .flatten()
                    .collect();
                guardrails.push(GuardrailNote {
                    name: name.clone(),
                    contents,
                });
            }
        }

        // HOT: consume the pending hand-off exactly once
        let handoff = match &request.project_id {
            Some(project_id) => self
                .store
                .consume_handoff(tenant_id, project_id)
                .await?
                .map(|h| HandoffNote {
                    from_agent: h.from_agent,
                    summary: h.summary,
                    open_items: h.open_items,
                    created_at: h.created_at,
                }),
            None => None,
        };

        let project = match (&request.project_id, request.depth) {
            (Some(project_id), ContextDepth::Warm | ContextDepth::Cold) => Some(
                self.project_context(tenant_id, project_id, request.depth)
                    .await?,
            ),
            _ => None,
        };

        let mut bundle = SessionContextBundle {
            depth: request.depth,
            identity: AgentIdentity {
                agent_id: request.agent_id.clone(),
                learnings,
                preferences,
            },
            unread_messages,
            guardrails,
            handoff,
            project,
            metadata: ContextMetadata {
                estimated_tokens: 0,
                token_budget: budget,
                dropped_sections: Vec::new(),
            },
        };

        enforce_budget(&mut bundle, budget, self.estimator.as_ref())?;

        debug!(
            tenant_id = %tenant_id,
            agent_id = %request.agent_id,
            depth = ?request.depth,
            estimated_tokens = bundle.metadata.estimated_tokens,
            dropped = bundle.metadata.dropped_sections.len(),
            "session context assembled"
        );

        Ok(bundle)
    }

    async fn project_context(
        &self,
        tenant_id: &str,
        project_id: &str,
        depth: ContextDepth,
    ) -> Result<ProjectContext> {
        let since = Utc::now() - Duration::days(self.config.recency_window_days);
        let recent_rows = self
            .store
            .observations_for_entity(
                tenant_id,
                project_id,
                Some(since),
                Some(self.config.warm_observation_limit),
            )
            .await?;

        let mut summary = None;
        let mut decisions = Vec::new();
        let mut recent_observations = Vec::new();
        for record in &recent_rows {
            let Some((contents, message_type)) = observation_view(&record.payload) else {
                continue;
            };
            match message_type {
                // Rows come newest first, so the first summary wins
                Some("summary") if summary.is_none() => {
                    summary = Some(contents.join("\n"));
                }
                Some("decision") => {
                    if decisions.len() < self.config.decision_limit as usize {
                        decisions.extend(contents.iter().cloned());
                    }
                }
                _ => recent_observations.push(ContextObservation {
                    contents: contents.clone(),
                    message_type: message_type.map(String::from),
                    created_at: record.created_at,
                }),
            }
        }

        let history = if depth == ContextDepth::Cold {
            let all_rows = self
                .store
                .observations_for_entity(tenant_id, project_id, None, None)
                .await?;
            Some(
                all_rows
                    .iter()
                    .filter_map(|record| {
                        observation_view(&record.payload).map(|(contents, message_type)| {
                            ContextObservation {
                                contents: contents.clone(),
                                message_type: message_type.map(String::from),
                                created_at: record.created_at,
                            }
                        })
                    })
                    .collect(),
            )
        } else {
            None
        };

        Ok(ProjectContext {
            project_id: project_id.to_string(),
            summary,
            decisions,
            recent_observations,
            history,
        })
    }
}

fn estimate_bundle(bundle: &SessionContextBundle, estimator: &dyn TokenEstimator) -> Result<u32> {
    let serialized = serde_json::to_string(bundle)?;
    Ok(estimator.estimate(&serialized))
}

/// Enforce the token budget by dropping sections lowest-priority-first:
/// COLD history, then project summary/decisions, then WARM observations,
/// then guardrails (trimmed), then identity learnings (trimmed to a
/// minimum, never removed). Each applied step is recorded in the metadata.
fn enforce_budget(
    bundle: &mut SessionContextBundle,
    budget: u32,
    estimator: &dyn TokenEstimator,
) -> Result<()> {
    bundle.metadata.estimated_tokens = estimate_bundle(bundle, estimator)?;

    let steps: [(&str, fn(&mut SessionContextBundle) -> bool); 5] = [
        ("cold_history", |b| {
            b.project
                .as_mut()
                .map(|p| p.history.take().is_some())
                .unwrap_or(false)
        }),
        ("project_summary", |b| {
            b.project
                .as_mut()
                .map(|p| {
                    let had = p.summary.is_some() || !p.decisions.is_empty();
                    p.summary = None;
                    p.decisions.clear();
                    had
                })
                .unwrap_or(false)
        }),
        ("warm_observations", |b| {
            b.project
                .as_mut()
                .map(|p| {
                    let had = !p.recent_observations.is_empty();
                    p.recent_observations.clear();
                    had
                })
                .unwrap_or(false)
        }),
        ("guardrails", |b| {
            if b.guardrails.len() > TRIMMED_SECTION_LEN {
                b.guardrails.truncate(TRIMMED_SECTION_LEN);
                true
            } else {
                false
            }
        }),
        ("identity_learnings", |b| {
            let before =
                b.identity.learnings.len() + b.identity.preferences.len();
            b.identity.learnings.truncate(TRIMMED_SECTION_LEN);
            b.identity.preferences.truncate(TRIMMED_SECTION_LEN);
            before > b.identity.learnings.len() + b.identity.preferences.len()
        }),
    ];

    for (name, apply) in steps {
        if bundle.metadata.estimated_tokens <= budget {
            break;
        }
        if apply(bundle) {
            bundle.metadata.dropped_sections.push(name.to_string());
            bundle.metadata.estimated_tokens = estimate_bundle(bundle, estimator)?;
        }
    }

    Ok(())
}
