//! Checks a candidate state against the checkpoint it is derived from.
//!
//! The "schema" is whatever keys the original checkpoint carried. Losing
//! one of them is an error; changing a value's JSON type or adding a key is
//! reported but does not block the edit. Input is only ever parsed as JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracelens_core::state::{encoded_size, ValueKind};
use tracelens_core::State;
use tracelens_settings::LimitSettings;
use tracelens_telemetry::metrics;
use tracing::debug;

use crate::errors::{EngineError, Result};

/// Field name used for issues about the state as a whole.
pub const STATE_FIELD: &str = "__state__";
/// Field name used for size issues.
pub const STATE_SIZE_FIELD: &str = "__state_size__";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity,
        }
    }
}

/// Outcome of a validation. `warnings` holds both warnings and
/// informational notes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    /// Compact JSON size of the candidate, when it was a mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_bytes: Option<usize>,
}

impl ValidationReport {
    fn from_issues(
        errors: Vec<ValidationIssue>,
        warnings: Vec<ValidationIssue>,
        state_bytes: Option<usize>,
    ) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
            state_bytes,
        }
    }

    /// A report with a single error.
    pub fn rejected(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::from_issues(
            vec![ValidationIssue::new(field, message, Severity::Error)],
            Vec::new(),
            None,
        )
    }

    pub fn error_fields(&self) -> Vec<&str> {
        self.errors.iter().map(|i| i.field.as_str()).collect()
    }

    pub fn warning_fields(&self) -> Vec<&str> {
        self.warnings.iter().map(|i| i.field.as_str()).collect()
    }

    /// One line naming every failing field.
    pub fn summary(&self) -> String {
        if self.errors.is_empty() {
            return "no errors".to_string();
        }
        self.errors
            .iter()
            .map(|i| format!("{}: {}", i.field, i.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Clone, Debug)]
pub struct StateValidator {
    limits: LimitSettings,
}

impl StateValidator {
    pub fn new(limits: LimitSettings) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &LimitSettings {
        &self.limits
    }

    /// Validate `candidate` against the state of the checkpoint it replaces.
    pub fn validate(&self, original: &State, candidate: &Value) -> ValidationReport {
        let Value::Object(candidate) = candidate else {
            return ValidationReport::rejected(
                STATE_FIELD,
                format!("state must be a JSON object, found {}", ValueKind::of(candidate)),
            );
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let size = encoded_size(candidate);
        if size > self.limits.max_state_bytes {
            errors.push(ValidationIssue::new(
                STATE_SIZE_FIELD,
                format!(
                    "state is {} ({size} bytes), above the {} byte limit",
                    human_size(size),
                    self.limits.max_state_bytes
                ),
                Severity::Error,
            ));
        } else if size > self.limits.warn_state_bytes {
            warnings.push(ValidationIssue::new(
                STATE_SIZE_FIELD,
                format!("state size is large ({}), may impact performance", human_size(size)),
                Severity::Warning,
            ));
        }

        for (key, before) in original {
            match candidate.get(key) {
                None => errors.push(ValidationIssue::new(
                    key,
                    format!("'{key}' is present in the original checkpoint and cannot be removed"),
                    Severity::Error,
                )),
                // A null in the original is an unset slot; any type may fill it.
                Some(_) if before.is_null() => {}
                Some(after) if ValueKind::of(after) != ValueKind::of(before) => {
                    warnings.push(ValidationIssue::new(
                        key,
                        format!(
                            "type of '{key}' changed from {} to {}",
                            ValueKind::of(before),
                            ValueKind::of(after)
                        ),
                        Severity::Warning,
                    ));
                }
                Some(_) => {}
            }
        }

        for key in candidate.keys().filter(|k| !original.contains_key(*k)) {
            warnings.push(ValidationIssue::new(
                key,
                format!("'{key}' is new and not present in the original checkpoint"),
                Severity::Info,
            ));
        }

        if let Some(step_count) = candidate.get("step_count") {
            match step_count.as_i64() {
                None if !step_count.is_null() => warnings.push(ValidationIssue::new(
                    "step_count",
                    "step_count should be an integer",
                    Severity::Warning,
                )),
                Some(n) if n > self.limits.step_count_warn_threshold => {
                    warnings.push(ValidationIssue::new(
                        "step_count",
                        format!(
                            "step_count is unusually high (>{}), may indicate an infinite loop",
                            self.limits.step_count_warn_threshold
                        ),
                        Severity::Warning,
                    ));
                }
                _ => {}
            }
        }

        ValidationReport::from_issues(errors, warnings, Some(size))
    }

    /// Parse `text` as JSON, then validate. Unparsable text is an error in
    /// the report, not a failure of the call.
    pub fn validate_json(&self, original: &State, text: &str) -> ValidationReport {
        match serde_json::from_str::<Value>(text) {
            Ok(candidate) => self.validate(original, &candidate),
            Err(e) => ValidationReport::rejected(STATE_FIELD, format!("state is not valid JSON: {e}")),
        }
    }

    /// Validate and hand back the candidate as a state ready to store.
    /// Oversized input is `PayloadTooLarge`; any other error is
    /// `Validation` carrying the full report.
    pub fn accept(&self, original: &State, candidate: Value) -> Result<State> {
        self.accept_with_warnings(original, candidate)
            .map(|(state, _)| state)
    }

    /// Like [`accept`](Self::accept), also returning the non-blocking issues.
    pub fn accept_with_warnings(
        &self,
        original: &State,
        candidate: Value,
    ) -> Result<(State, Vec<ValidationIssue>)> {
        let report = self.validate(original, &candidate);
        if let Some(size) = report.state_bytes.filter(|s| *s > self.limits.max_state_bytes) {
            metrics::validation_failed();
            return Err(EngineError::PayloadTooLarge {
                size,
                limit: self.limits.max_state_bytes,
            });
        }
        if !report.valid {
            metrics::validation_failed();
            return Err(EngineError::Validation(report));
        }
        if !report.warnings.is_empty() {
            debug!(warnings = ?report.warning_fields(), "state accepted with warnings");
        }
        match candidate {
            Value::Object(state) => Ok((state, report.warnings)),
            // validate() rejects every non-object.
            other => Err(EngineError::Validation(ValidationReport::rejected(
                STATE_FIELD,
                format!("state must be a JSON object, found {}", ValueKind::of(&other)),
            ))),
        }
    }
}

fn human_size(bytes: usize) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    if bytes as f64 >= MIB {
        format!("{:.1}MB", bytes as f64 / MIB)
    } else {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    }
}
