//! Wire protocol types for the worker loopback API.
//!
//! These types are used by both:
//! - the host-side orchestration layer (supervisor, client, sessions)
//! - the worker process serving the loopback endpoints
//!
//! Everything here is serde-serializable JSON. Requests and responses
//! carry their own validation so neither side silently coerces a
//! malformed payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Validation
// ============================================================================

/// A request or response payload failed its declared schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

// ============================================================================
// Provider configuration
// ============================================================================

/// Which kind of model provider a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    /// A model served on the local machine; no credential required.
    LocalModel,
    /// A remote hosted model; requires a credential reference.
    HostedModel,
}

impl Provider {
    pub fn requires_credential(&self) -> bool {
        matches!(self, Provider::HostedModel)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::LocalModel => write!(f, "local-model"),
            Provider::HostedModel => write!(f, "hosted-model"),
        }
    }
}

/// Immutable description of how to reach a model provider.
///
/// `credential_ref` is an opaque handle into the host's secure storage.
/// The raw secret is resolved once at session creation and travels only
/// in the session-create request body, never in this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub endpoint: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f64 {
    0.7
}

impl ProviderConfig {
    pub fn local(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: Provider::LocalModel,
            endpoint: endpoint.into(),
            model: model.into(),
            credential_ref: None,
            temperature: default_temperature(),
            max_tokens: None,
        }
    }

    pub fn hosted(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        credential_ref: impl Into<String>,
    ) -> Self {
        Self {
            provider: Provider::HostedModel,
            endpoint: endpoint.into(),
            model: model.into(),
            credential_ref: Some(credential_ref.into()),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }

    /// Check the config invariants before any network call is made.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.model.trim().is_empty() {
            return Err(ValidationError::new("model cannot be empty"));
        }
        let endpoint = url::Url::parse(&self.endpoint)
            .map_err(|e| ValidationError::new(format!("malformed endpoint: {e}")))?;
        if endpoint.scheme() != "http" && endpoint.scheme() != "https" {
            return Err(ValidationError::new(format!(
                "endpoint must be http(s), got '{}'",
                endpoint.scheme()
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ValidationError::new(format!(
                "temperature must be between 0.0 and 2.0, got {}",
                self.temperature
            )));
        }
        if let Some(max_tokens) = self.max_tokens {
            if max_tokens == 0 {
                return Err(ValidationError::new("max_tokens must be positive"));
            }
        }
        if self.provider.requires_credential()
            && self
                .credential_ref
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            return Err(ValidationError::new(format!(
                "provider '{}' requires a credential reference",
                self.provider
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Entity generation
// ============================================================================

/// Single request/response entity generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateEntityRequest {
    pub entity_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl GenerateEntityRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.entity_type.trim().is_empty() {
            return Err(ValidationError::new("entity_type cannot be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("entity name cannot be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedEntity {
    pub name: String,
    pub kind: String,
    /// Generated entity body (source or schema text).
    pub content: String,
    /// Model that produced the entity.
    pub model: String,
}

impl GeneratedEntity {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("generated entity has empty name"));
        }
        if self.content.trim().is_empty() {
            return Err(ValidationError::new("generated entity has empty content"));
        }
        Ok(())
    }
}

// ============================================================================
// Capabilities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCapabilityStatus {
    Enabled,
    Disabled,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityEntry {
    pub status: ToolCapabilityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

/// Manifest of which tools the worker can currently serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub profile_id: String,
    pub last_updated: DateTime<Utc>,
    pub capabilities: std::collections::BTreeMap<String, CapabilityEntry>,
}

impl CapabilityProfile {
    /// Profile with every listed tool enabled.
    pub fn all_enabled(profile_id: impl Into<String>, tools: &[String]) -> Self {
        Self {
            profile_id: profile_id.into(),
            last_updated: Utc::now(),
            capabilities: tools
                .iter()
                .map(|t| {
                    (
                        t.clone(),
                        CapabilityEntry {
                            status: ToolCapabilityStatus::Enabled,
                            fallback: None,
                        },
                    )
                })
                .collect(),
        }
    }
}

// ============================================================================
// Conversation turns
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Conversation mode hint forwarded to the worker with each message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageMode {
    #[default]
    General,
    Improvement,
    Clarification,
}

// ============================================================================
// Worker sessions
// ============================================================================

/// Body of the session-create request sent to the worker over loopback.
///
/// This is the only place the resolved plaintext credential travels.
/// The `Debug` impl deliberately omits it so the secret cannot leak
/// through logs or error diagnostics.
#[derive(Clone, Serialize, Deserialize)]
pub struct CreateWorkerSessionRequest {
    pub provider: Provider,
    pub endpoint: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub active_tools: Vec<String>,
}

impl std::fmt::Debug for CreateWorkerSessionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateWorkerSessionRequest")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("system_prompt", &self.system_prompt)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("active_tools", &self.active_tools)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkerSessionResponse {
    pub session_id: Uuid,
    pub capability_profile: CapabilityProfile,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Assist streaming
// ============================================================================

/// Body of the streaming-assist request.
///
/// `stream_id` is assigned by the host so cancellation can name the
/// in-flight request deterministically on both sides of the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistRequest {
    pub stream_id: Uuid,
    pub session_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub mode: MessageMode,
    /// Full ordered conversation context, oldest first.
    #[serde(default)]
    pub history: Vec<Turn>,
}

/// Timing metadata attached to the stream completion marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMetadata {
    pub tokens_emitted: u64,
    pub duration_ms: u64,
    pub model: String,
}

/// One event on the incrementally-flushed assist stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistEvent {
    Token {
        token: String,
    },
    Complete {
        full_content: String,
        metadata: CompletionMetadata,
    },
    Error {
        message: String,
    },
}

impl AssistEvent {
    /// Completion and error markers terminate the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AssistEvent::Token { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelStreamRequest {
    pub stream_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelStreamResponse {
    pub stream_id: Uuid,
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ProviderConfig {
        ProviderConfig::local("http://127.0.0.1:11434", "test-model")
    }

    #[test]
    fn provider_config_valid() {
        assert!(local_config().validate().is_ok());
        assert!(
            ProviderConfig::hosted("https://api.example.com", "gpt-x", "ref-1")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn provider_config_rejects_empty_model() {
        let mut config = local_config();
        config.model = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn provider_config_rejects_malformed_endpoint() {
        let mut config = local_config();
        config.endpoint = "not a url".into();
        assert!(config.validate().is_err());

        config.endpoint = "ftp://example.com".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn provider_config_rejects_bad_temperature() {
        let mut config = local_config();
        config.temperature = 2.5;
        assert!(config.validate().is_err());
        config.temperature = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn provider_config_rejects_zero_max_tokens() {
        let mut config = local_config();
        config.max_tokens = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn hosted_provider_requires_credential_ref() {
        let mut config = ProviderConfig::hosted("https://api.example.com", "gpt-x", "ref-1");
        config.credential_ref = None;
        assert!(config.validate().is_err());

        config.credential_ref = Some("  ".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn assist_event_wire_format() {
        let token: AssistEvent = serde_json::from_str(r#"{"type":"token","token":"hi"}"#).unwrap();
        assert_eq!(
            token,
            AssistEvent::Token {
                token: "hi".into()
            }
        );
        assert!(!token.is_terminal());

        let complete: AssistEvent = serde_json::from_str(
            r#"{"type":"complete","full_content":"hi there","metadata":{"tokens_emitted":2,"duration_ms":10,"model":"stub"}}"#,
        )
        .unwrap();
        assert!(complete.is_terminal());

        let error: AssistEvent =
            serde_json::from_str(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert!(error.is_terminal());
    }

    #[test]
    fn provider_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&Provider::LocalModel).unwrap(),
            "\"local-model\""
        );
        assert_eq!(
            serde_json::to_string(&Provider::HostedModel).unwrap(),
            "\"hosted-model\""
        );
    }

    #[test]
    fn session_request_debug_redacts_api_key() {
        let request = CreateWorkerSessionRequest {
            provider: Provider::HostedModel,
            endpoint: "https://api.example.com".into(),
            model: "gpt-x".into(),
            api_key: Some("sk-super-secret".into()),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: None,
            active_tools: vec![],
        };
        let debug = format!("{request:?}");
        assert!(!debug.contains("sk-super-secret"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn generated_entity_validation() {
        let entity = GeneratedEntity {
            name: "Order".into(),
            kind: "schema".into(),
            content: "name: Order".into(),
            model: "stub".into(),
        };
        assert!(entity.validate().is_ok());

        let empty = GeneratedEntity {
            content: String::new(),
            ..entity
        };
        assert!(empty.validate().is_err());
    }
}
