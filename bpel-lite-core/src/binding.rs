//! Transport collaborator interface and outbound URL construction.
//!
//! The engine never sees wire formats: outbound messages go through
//! [`MessageBinding::send`], inbound ones enter via the engine's
//! `on_message`. URL replacement encodes a base address template containing
//! `(partName)` placeholders, substituting each declared part exactly once.

use crate::types::{Message, Value};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// An engine-level outbound message handed to the binding layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub partner_link: String,
    pub operation: String,
    /// Concrete endpoint, when the partner link declares an address template.
    pub endpoint_url: Option<String>,
    /// Set when this is a fault reply.
    pub fault_name: Option<String>,
    pub message_exchange: String,
    pub message: Message,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DeliveryResult {
    Delivered,
    Rejected { reason: String },
}

#[async_trait]
pub trait MessageBinding: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<DeliveryResult>;
}

// ─── URL replacement ──────────────────────────────────────────

#[derive(Clone, Debug, Error, PartialEq)]
pub enum UrlReplacementError {
    #[error("missing replacement values for parts: {0:?}")]
    MissingReplacementValues(Vec<String>),

    #[error("part `{0}` must carry exactly one non-null simple value")]
    SimpleTypeExpected(String),

    #[error("part pattern `({0})` must match the template exactly once")]
    InvalidPattern(String),
}

/// Text content of a simple value; structured and null values are rejected.
pub fn simple_text(part: &str, value: &Value) -> Result<String, UrlReplacementError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => {
            Err(UrlReplacementError::SimpleTypeExpected(part.to_string()))
        }
    }
}

/// Encode `template` by substituting each declared part's `(name)` pattern
/// with its supplied value. Each part must be supplied exactly one non-null
/// simple value, and each pattern must match exactly once. Substitution is
/// confined to the not-yet-substituted remainder of the template, so a
/// replacement value containing another part's pattern never triggers a
/// spurious match.
pub fn replace_url_template(
    template: &str,
    declared_parts: &[String],
    values: &BTreeMap<String, Value>,
) -> Result<String, UrlReplacementError> {
    let declared: BTreeSet<&str> = declared_parts.iter().map(String::as_str).collect();
    let supplied: BTreeSet<&str> = values.keys().map(String::as_str).collect();
    if declared != supplied {
        let disjunction = declared
            .symmetric_difference(&supplied)
            .map(|s| s.to_string())
            .collect();
        return Err(UrlReplacementError::MissingReplacementValues(disjunction));
    }

    // Even indices hold unsubstituted template text, odd indices hold
    // already-substituted values.
    let mut segments = vec![template.to_string()];
    for (part, value) in values {
        let replacement = simple_text(part, value)?;
        replace_once(&mut segments, part, &replacement)?;
    }
    Ok(segments.concat())
}

fn replace_once(
    segments: &mut Vec<String>,
    part: &str,
    replacement: &str,
) -> Result<(), UrlReplacementError> {
    let pattern = format!("({part})");
    let mut i = 0;
    while i < segments.len() {
        let pieces: Vec<String> = segments[i]
            .split(pattern.as_str())
            .map(str::to_string)
            .collect();
        match pieces.len() {
            1 => {
                if i == segments.len() - 1 {
                    return Err(UrlReplacementError::InvalidPattern(part.to_string()));
                }
                // Step over the substituted value at i + 1.
                i += 2;
            }
            2 => {
                let tail = pieces[1].clone();
                let head = pieces[0].clone();
                segments.splice(i..=i, [head, replacement.to_string(), tail]);
                return Ok(());
            }
            _ => return Err(UrlReplacementError::InvalidPattern(part.to_string())),
        }
    }
    Err(UrlReplacementError::InvalidPattern(part.to_string()))
}
