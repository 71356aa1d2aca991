//! Server-enforced session policy.
//!
//! The policy is shared by every session of a relay instance and may be
//! changed at any time through the admin surface. Sessions read it when they
//! translate an outgoing `session.update`, so a change takes effect on the
//! next configuration exchange without reconnecting. The values the policy
//! was built with are kept as an immutable snapshot for revert.

use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use super::voice::RealtimeVoice;

/// Errors raised when a policy update is rejected.
#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("Invalid voice choice '{voice}'. Must be one of: {}", RealtimeVoice::names().join(", "))]
    InvalidVoice { voice: String },

    #[error("Value for '{field}' out of range: {reason}")]
    OutOfRange { field: PolicyField, reason: String },

    #[error("Unknown policy field: {0}")]
    UnknownField(String),
}

/// Policy values. Every field is optional; unset fields leave the client's
/// value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySettings {
    pub model: Option<String>,
    pub system_message: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub max_tokens: Option<u32>,
    pub disable_audio: Option<bool>,
    pub voice: Option<RealtimeVoice>,
}

/// Names of the individual policy fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyField {
    Model,
    SystemMessage,
    Temperature,
    TopP,
    PresencePenalty,
    FrequencyPenalty,
    MaxTokens,
    DisableAudio,
    Voice,
}

impl PolicyField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::SystemMessage => "system_message",
            Self::Temperature => "temperature",
            Self::TopP => "top_p",
            Self::PresencePenalty => "presence_penalty",
            Self::FrequencyPenalty => "frequency_penalty",
            Self::MaxTokens => "max_tokens",
            Self::DisableAudio => "disable_audio",
            Self::Voice => "voice",
        }
    }
}

impl std::fmt::Display for PolicyField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyField {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(Self::Model),
            // "prompt" is the name the admin UI has always used
            "system_message" | "prompt" => Ok(Self::SystemMessage),
            "temperature" => Ok(Self::Temperature),
            "top_p" => Ok(Self::TopP),
            "presence_penalty" => Ok(Self::PresencePenalty),
            "frequency_penalty" => Ok(Self::FrequencyPenalty),
            "max_tokens" => Ok(Self::MaxTokens),
            "disable_audio" => Ok(Self::DisableAudio),
            "voice" | "voice_choice" => Ok(Self::Voice),
            other => Err(PolicyError::UnknownField(other.to_string())),
        }
    }
}

/// Deserialize a field so that "absent" and "null" are distinguishable:
/// absent → `None`, null → `Some(None)`, value → `Some(Some(v))`.
fn patch_field<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Partial policy update. A `null` clears the field, an absent key leaves it
/// as it is.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyUpdate {
    #[serde(default, deserialize_with = "patch_field")]
    pub model: Option<Option<String>>,
    #[serde(default, deserialize_with = "patch_field")]
    pub system_message: Option<Option<String>>,
    #[serde(default, deserialize_with = "patch_field")]
    pub temperature: Option<Option<f64>>,
    #[serde(default, deserialize_with = "patch_field")]
    pub top_p: Option<Option<f64>>,
    #[serde(default, deserialize_with = "patch_field")]
    pub presence_penalty: Option<Option<f64>>,
    #[serde(default, deserialize_with = "patch_field")]
    pub frequency_penalty: Option<Option<f64>>,
    #[serde(default, deserialize_with = "patch_field")]
    pub max_tokens: Option<Option<u32>>,
    #[serde(default, deserialize_with = "patch_field")]
    pub disable_audio: Option<Option<bool>>,
    #[serde(default, deserialize_with = "patch_field")]
    pub voice: Option<Option<String>>,
}

fn check_range(
    field: PolicyField,
    value: Option<f64>,
    min: f64,
    max: f64,
) -> Result<Option<f64>, PolicyError> {
    match value {
        Some(v) if !v.is_finite() || v < min || v > max => Err(PolicyError::OutOfRange {
            field,
            reason: format!("{v} is not within [{min}, {max}]"),
        }),
        other => Ok(other),
    }
}

fn parse_voice(voice: Option<String>) -> Result<Option<RealtimeVoice>, PolicyError> {
    match voice {
        None => Ok(None),
        Some(name) => RealtimeVoice::parse(&name)
            .map(Some)
            .ok_or(PolicyError::InvalidVoice { voice: name }),
    }
}

impl PolicySettings {
    /// Apply a patch, validating every provided value before any is written.
    fn apply(&mut self, update: PolicyUpdate) -> Result<(), PolicyError> {
        let mut next = self.clone();

        if let Some(model) = update.model {
            next.model = model;
        }
        if let Some(message) = update.system_message {
            next.system_message = message;
        }
        if let Some(temperature) = update.temperature {
            next.temperature = check_range(PolicyField::Temperature, temperature, 0.0, 2.0)?;
        }
        if let Some(top_p) = update.top_p {
            next.top_p = check_range(PolicyField::TopP, top_p, 0.0, 1.0)?;
        }
        if let Some(penalty) = update.presence_penalty {
            next.presence_penalty = check_range(PolicyField::PresencePenalty, penalty, -2.0, 2.0)?;
        }
        if let Some(penalty) = update.frequency_penalty {
            next.frequency_penalty =
                check_range(PolicyField::FrequencyPenalty, penalty, -2.0, 2.0)?;
        }
        if let Some(max_tokens) = update.max_tokens {
            next.max_tokens = max_tokens;
        }
        if let Some(disable_audio) = update.disable_audio {
            next.disable_audio = disable_audio;
        }
        if let Some(voice) = update.voice {
            next.voice = parse_voice(voice)?;
        }

        *self = next;
        Ok(())
    }

    fn copy_field(&mut self, from: &PolicySettings, field: PolicyField) {
        match field {
            PolicyField::Model => self.model = from.model.clone(),
            PolicyField::SystemMessage => self.system_message = from.system_message.clone(),
            PolicyField::Temperature => self.temperature = from.temperature,
            PolicyField::TopP => self.top_p = from.top_p,
            PolicyField::PresencePenalty => self.presence_penalty = from.presence_penalty,
            PolicyField::FrequencyPenalty => self.frequency_penalty = from.frequency_penalty,
            PolicyField::MaxTokens => self.max_tokens = from.max_tokens,
            PolicyField::DisableAudio => self.disable_audio = from.disable_audio,
            PolicyField::Voice => self.voice = from.voice,
        }
    }
}

/// Shared, mutable session policy with an immutable original snapshot.
#[derive(Debug)]
pub struct SessionPolicy {
    current: RwLock<PolicySettings>,
    original: PolicySettings,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::new(PolicySettings::default())
    }
}

impl SessionPolicy {
    pub fn new(initial: PolicySettings) -> Self {
        Self {
            current: RwLock::new(initial.clone()),
            original: initial,
        }
    }

    /// Copy of the current values. Sessions take one snapshot per
    /// translation so a concurrent admin write never tears a message.
    pub fn snapshot(&self) -> PolicySettings {
        self.current.read().clone()
    }

    /// Values the policy was created with.
    pub fn original(&self) -> &PolicySettings {
        &self.original
    }

    pub fn update(&self, update: PolicyUpdate) -> Result<PolicySettings, PolicyError> {
        let mut current = self.current.write();
        current.apply(update)?;
        tracing::info!(policy = ?*current, "Session policy updated");
        Ok(current.clone())
    }

    /// Set the voice by name.
    pub fn set_voice(&self, voice: &str) -> Result<RealtimeVoice, PolicyError> {
        let parsed = RealtimeVoice::parse(voice).ok_or_else(|| PolicyError::InvalidVoice {
            voice: voice.to_string(),
        })?;
        self.current.write().voice = Some(parsed);
        tracing::info!(voice = %parsed, "Voice choice updated");
        Ok(parsed)
    }

    pub fn set_system_message(&self, message: Option<String>) {
        self.current.write().system_message = message;
    }

    /// Restore one field to its original value.
    pub fn revert(&self, field: PolicyField) -> PolicySettings {
        let mut current = self.current.write();
        current.copy_field(&self.original, field);
        tracing::info!(field = %field, "Policy field reverted to original");
        current.clone()
    }

    /// Restore every field to its original value.
    pub fn revert_all(&self) -> PolicySettings {
        let mut current = self.current.write();
        *current = self.original.clone();
        tracing::info!("Session policy reverted to original");
        current.clone()
    }

    /// Whether a field currently differs from its original value.
    pub fn is_custom(&self, field: PolicyField) -> bool {
        let mut candidate = self.snapshot();
        let before = candidate.clone();
        candidate.copy_field(&self.original, field);
        candidate != before
    }
}
