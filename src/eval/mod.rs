use crate::flags::{Clause, ClauseOp, FeatureFlag, Segment, User, VariationOrRollout};
use crate::store::{DataKind, FeatureStore, StoreItem};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};


/// Why an evaluation produced the result it did.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum EvalReason {
    #[serde(rename = "OFF")]
    Off,
    #[serde(rename = "TARGET_MATCH")]
    TargetMatch,
    #[serde(rename = "RULE_MATCH")]
    RuleMatch {
        #[serde(rename = "ruleIndex")]
        rule_index: usize,
        #[serde(rename = "ruleId")]
        rule_id: String,
    },
    #[serde(rename = "FALLTHROUGH")]
    Fallthrough,
    #[serde(rename = "ERROR")]
    Error {
        #[serde(rename = "errorKind")]
        error_kind: &'static str,
    },
}

/// The outcome of evaluating one flag for one user.
#[derive(Clone, Debug, PartialEq)]
pub struct EvalDetail {
    pub value: Value,
    pub variation_index: Option<usize>,
    pub reason: EvalReason,
}

impl EvalDetail {
    fn error(error_kind: &'static str) -> Self {
        Self {
            value: Value::Null,
            variation_index: None,
            reason: EvalReason::Error { error_kind },
        }
    }
}

/// Whether this evaluation is part of an experiment, which forces event and
/// reason tracking in the client-side response schema.
pub fn is_experiment(flag: &FeatureFlag, reason: &EvalReason) -> bool {
    match reason {
        EvalReason::Fallthrough => flag.track_events_fallthrough,
        EvalReason::RuleMatch { rule_index, .. } => flag
            .rules
            .get(*rule_index)
            .map(|r| r.track_events)
            .unwrap_or(false),
        _ => false,
    }
}

/// One entry of the client-side evaluation response, new schema.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalXResult {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    pub version: u64,
    pub track_events: bool,
    pub track_reason: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<EvalReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
}

/// Evaluates flags against the environment's current snapshot.
///
/// Borrows the store read-side for segment lookups; nothing is cached, each
/// evaluation sees the latest data.
pub struct Evaluator<'a> {
    store: &'a dyn FeatureStore,
}

impl<'a> Evaluator<'a> {
    pub fn new(store: &'a dyn FeatureStore) -> Self {
        Self { store }
    }

    pub fn evaluate(&self, flag: &FeatureFlag, user: &User) -> EvalDetail {
        if !flag.on {
            return match flag.off_variation {
                Some(index) => self.variation_result(flag, index, EvalReason::Off),
                None => EvalDetail {
                    value: Value::Null,
                    variation_index: None,
                    reason: EvalReason::Off,
                },
            };
        }

        for target in &flag.targets {
            if target.values.iter().any(|v| v == user.key()) {
                return self.variation_result(flag, target.variation, EvalReason::TargetMatch);
            }
        }

        for (rule_index, rule) in flag.rules.iter().enumerate() {
            if rule.clauses.iter().all(|c| self.clause_matches(c, user)) {
                let reason = EvalReason::RuleMatch {
                    rule_index,
                    rule_id: rule.id.clone(),
                };
                return match self.resolve(flag, &rule.variation_or_rollout, user) {
                    Some(index) => self.variation_result(flag, index, reason),
                    None => EvalDetail::error("MALFORMED_FLAG"),
                };
            }
        }

        match self.resolve(flag, &flag.fallthrough, user) {
            Some(index) => self.variation_result(flag, index, EvalReason::Fallthrough),
            None => EvalDetail::error("MALFORMED_FLAG"),
        }
    }

    fn variation_result(&self, flag: &FeatureFlag, index: usize, reason: EvalReason) -> EvalDetail {
        match flag.variation_value(index) {
            Some(value) => EvalDetail {
                value: value.clone(),
                variation_index: Some(index),
                reason,
            },
            None => EvalDetail::error("MALFORMED_FLAG"),
        }
    }

    fn resolve(&self, flag: &FeatureFlag, vor: &VariationOrRollout, user: &User) -> Option<usize> {
        if let Some(index) = vor.variation {
            return Some(index);
        }
        let rollout = vor.rollout.as_ref()?;
        if rollout.variations.is_empty() || user.key().is_empty() {
            return None;
        }
        let bucket = bucket_user(&flag.key, &flag.salt, user, rollout.bucket_by.as_deref());
        let mut sum = 0u32;
        for weighted in &rollout.variations {
            sum += weighted.weight;
            if bucket < sum {
                return Some(weighted.variation);
            }
        }
        // Weights that do not cover the full range fall into the last bucket
        rollout.variations.last().map(|w| w.variation)
    }

    fn clause_matches(&self, clause: &Clause, user: &User) -> bool {
        if clause.op == ClauseOp::SegmentMatch {
            let matched = clause.values.iter().any(|v| {
                v.as_str()
                    .map(|key| self.segment_contains(key, user))
                    .unwrap_or(false)
            });
            return matched != clause.negate;
        }

        let attr_value = match user.attribute(&clause.attribute) {
            Some(v) => v,
            None => return false,
        };
        // A user attribute that is an array matches if any element matches
        let matched = match &attr_value {
            Value::Array(elements) => elements
                .iter()
                .any(|e| clause_value_matches(clause, e)),
            other => clause_value_matches(clause, other),
        };
        matched != clause.negate
    }

    fn segment_contains(&self, segment_key: &str, user: &User) -> bool {
        let segment = match self.store.get(DataKind::Segments, segment_key) {
            Ok(Some(descriptor)) => match descriptor.item {
                Some(StoreItem::Segment(segment)) => segment,
                _ => return false,
            },
            _ => return false,
        };
        segment_matches(&segment, user, |c, u| self.clause_matches(c, u))
    }
}

fn segment_matches(
    segment: &Segment,
    user: &User,
    clause_matches: impl Fn(&Clause, &User) -> bool,
) -> bool {
    let key = user.key();
    if segment.excluded.iter().any(|k| k == key) {
        return false;
    }
    if segment.included.iter().any(|k| k == key) {
        return true;
    }
    for rule in &segment.rules {
        if rule.clauses.iter().all(|c| clause_matches(c, user)) {
            match rule.weight {
                None => return true,
                Some(weight) => {
                    let bucket =
                        bucket_user(&segment.key, &segment.salt, user, rule.bucket_by.as_deref());
                    if bucket < weight {
                        return true;
                    }
                }
            }
        }
    }
    false
}

fn clause_value_matches(clause: &Clause, attr_value: &Value) -> bool {
    clause
        .values
        .iter()
        .any(|clause_value| op_matches(clause.op, attr_value, clause_value))
}

fn op_matches(op: ClauseOp, attr_value: &Value, clause_value: &Value) -> bool {
    match op {
        ClauseOp::In => attr_value == clause_value,
        ClauseOp::StartsWith => with_strings(attr_value, clause_value, |a, c| a.starts_with(c)),
        ClauseOp::EndsWith => with_strings(attr_value, clause_value, |a, c| a.ends_with(c)),
        ClauseOp::Contains => with_strings(attr_value, clause_value, |a, c| a.contains(c)),
        ClauseOp::Matches => with_strings(attr_value, clause_value, |a, c| {
            regex::Regex::new(c).map(|re| re.is_match(a)).unwrap_or(false)
        }),
        ClauseOp::LessThan => with_numbers(attr_value, clause_value, |a, c| a < c),
        ClauseOp::GreaterThan => with_numbers(attr_value, clause_value, |a, c| a > c),
        // segmentMatch is handled before per-value matching
        ClauseOp::SegmentMatch => false,
    }
}

fn with_strings(a: &Value, b: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    match (a.as_str(), b.as_str()) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    }
}

fn with_numbers(a: &Value, b: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    }
}

/// Deterministically buckets a user into [0, 100_000).
///
/// The digest input is `<key>.<salt>.<attribute value>`; the first 15 hex
/// characters of the SHA-256 digest are scaled onto the weight range.
pub fn bucket_user(key: &str, salt: &str, user: &User, bucket_by: Option<&str>) -> u32 {
    let attribute = bucket_by.unwrap_or("key");
    let bucket_value = match user.attribute(attribute) {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => return 0,
    };
    let digest = Sha256::digest(format!("{}.{}.{}", key, salt, bucket_value).as_bytes());
    let hex15 = &hex::encode(digest)[..15];
    let n = u64::from_str_radix(hex15, 16).unwrap_or(0);
    ((n as f64 / 0xFFF_FFFF_FFFF_FFFFu64 as f64) * 100_000.0) as u32
}
