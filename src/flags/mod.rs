use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;


/// A feature flag as received from the upstream control plane.
///
/// Only the fields the relay needs for evaluation and client-side filtering
/// are modeled; anything else the upstream sends is dropped on deserialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub client_side: bool,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub variations: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_variation: Option<usize>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
}

impl FeatureFlag {
    /// Returns the variation value at the given index, if it exists.
    pub fn variation_value(&self, index: usize) -> Option<&Value> {
        self.variations.get(index)
    }
}

/// A list of user keys that are force-served a specific variation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub values: Vec<String>,
    pub variation: usize,
}

/// A targeting rule: all clauses must match for the rule to apply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

/// Either a fixed variation index or a percentage rollout.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

/// Percentage rollout buckets; weights are in units of 0.001% (sum 100_000).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub variations: Vec<WeightedVariation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: usize,
    pub weight: u32,
}

/// A single condition on a user attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    pub attribute: String,
    pub op: ClauseOp,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub negate: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClauseOp {
    #[serde(rename = "in")]
    In,
    #[serde(rename = "startsWith")]
    StartsWith,
    #[serde(rename = "endsWith")]
    EndsWith,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "matches")]
    Matches,
    #[serde(rename = "lessThan")]
    LessThan,
    #[serde(rename = "greaterThan")]
    GreaterThan,
    #[serde(rename = "segmentMatch")]
    SegmentMatch,
}

/// A user segment: explicit include/exclude lists plus percentage rules.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
}

/// An end user as supplied by an SDK client, either base64-encoded in a URL
/// path segment or as a REPORT request body.
///
/// Attributes other than `key` are kept as raw JSON; clause matching looks
/// them up by name, falling back to the nested `custom` object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(flatten)]
    pub attributes: HashMap<String, Value>,
}

impl User {
    /// The user key, or the empty string if absent.
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or("")
    }

    /// Looks up an attribute by name: `key`, then top-level, then `custom.<name>`.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        if name == "key" {
            return self.key.clone().map(Value::String);
        }
        if let Some(v) = self.attributes.get(name) {
            return Some(v.clone());
        }
        self.attributes
            .get("custom")
            .and_then(|custom| custom.get(name))
            .cloned()
    }

    /// Decodes a user from a base64 URL path segment.
    ///
    /// URL-safe base64 without padding is the documented encoding, but some
    /// SDKs send standard base64, so both are accepted.
    pub fn from_base64(encoded: &str) -> Result<User, UserDecodeError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .or_else(|_| STANDARD.decode(encoded))
            .map_err(|_| UserDecodeError::InvalidBase64)?;
        serde_json::from_slice(&bytes).map_err(|e| UserDecodeError::InvalidJson(e.to_string()))
    }
}

/// Errors decoding a URL-embedded or REPORT-body user
#[derive(Debug, PartialEq)]
pub enum UserDecodeError {
    InvalidBase64,
    InvalidJson(String),
}

impl std::fmt::Display for UserDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserDecodeError::InvalidBase64 => write!(f, "user data is not valid base64"),
            UserDecodeError::InvalidJson(msg) => write!(f, "user data is not valid JSON: {}", msg),
        }
    }
}

impl std::error::Error for UserDecodeError {}
