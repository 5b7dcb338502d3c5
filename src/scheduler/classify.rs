//! Turns a raw probe result into its final status by applying the monitor's rule.

use crate::db::{ProbeResult, Status};
use crate::rule::{Rule, Value};

/// Placeholder stored in place of a captured response body.
pub const REDACTED_BODY: &str = "*** Removed ***";

/// Apply `rule` to a completed probe result.
///
/// A result that already `Failed` keeps its status and message. Rule
/// problems downgrade the result to `Failed`, a rule that evaluates to
/// `false` downgrades it to `Error`. The `body` output is always redacted
/// afterwards, so rules may read it but sinks never see it.
pub fn classify(result: &mut ProbeResult, rule: &str) {
    let rule = rule.trim();

    if result.status != Status::Failed && !rule.is_empty() {
        match Rule::compile(rule) {
            Err(e) => {
                result.status = Status::Failed;
                result.message = format!("rule expression error: {}", e);
            }
            Ok(compiled) => match compiled.evaluate(&result.outputs) {
                Err(e) => {
                    result.status = Status::Failed;
                    result.message = format!("rule eval error: {}", e);
                }
                Ok(Value::Bool(true)) => {}
                Ok(Value::Bool(false)) => {
                    result.status = Status::Error;
                    result.message = format!("Rule violated: {}", rule);
                }
                Ok(_) => {
                    result.status = Status::Failed;
                    result.message = "rule didn't return a bool".to_string();
                }
            },
        }
    }

    if let Some(body) = result.outputs.get_mut("body") {
        *body = REDACTED_BODY.into();
    }
}
