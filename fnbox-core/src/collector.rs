// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Normalization of raw sandbox output into one result envelope.
//!
//! Both backends produce the same [`RawOutput`]; the collector pulls the
//! bootstrap's result line out of stdout, validates the handler's return
//! value and builds either an [`ExecutionResult`] or a `RuntimeError`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::bootstrap::{BOOT_MARKER, RESULT_MARKER};
use crate::backend::RawOutput;
use crate::error::InvocationError;
use crate::types::{EngineKind, SandboxId};

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    TimedOut,
    Failed,
}

impl Outcome {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Normalized result of a successful invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status_code: u16,
    pub body: Value,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(rename = "memoryPeakMB")]
    pub memory_peak_mb: u64,
    pub outcome: Outcome,
}

/// Per-invocation measurements, recorded for every outcome.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationMetrics {
    pub sandbox_id: String,
    pub function_id: String,
    pub engine: EngineKind,
    pub outcome: Outcome,
    pub cold_start: bool,
    /// Process start to boot marker.
    pub boot_ms: Option<u64>,
    /// Boot marker to exit.
    pub handler_ms: Option<u64>,
    /// Invoke start to exit.
    pub duration_ms: u64,
    /// Request accepted to teardown started, provisioning included.
    pub total_ms: u64,
    pub memory_peak_mb: Option<u64>,
}

/// Result line written by the runtime bootstrap.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BootstrapReport {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "memoryPeakKB")]
    memory_peak_kb: u64,
}

/// What the raw output says, before any outcome is applied.
#[derive(Debug)]
struct Parsed {
    user_stdout: String,
    report: Result<BootstrapReport, String>,
}

/// Stateless normalizer; only carries output limits.
#[derive(Debug, Clone)]
pub struct ResultCollector {
    stderr_excerpt_bytes: usize,
}

impl ResultCollector {
    pub fn new(stderr_excerpt_bytes: usize) -> Self {
        Self {
            stderr_excerpt_bytes,
        }
    }

    /// Decide the outcome of an invocation whose sandbox exited on its own.
    pub fn classify(&self, raw: &RawOutput) -> Outcome {
        if raw.exit_code != Some(0) {
            return Outcome::Failed;
        }
        match parse(raw).report {
            Ok(report) if report.ok && response_fields(&report.value).is_ok() => {
                Outcome::Completed
            }
            _ => Outcome::Failed,
        }
    }

    /// Build the result for `outcome` from `raw`.
    ///
    /// `Completed` yields an [`ExecutionResult`] and `Failed` a `RuntimeError`
    /// carrying the user stdout and a stderr excerpt. `TimedOut` yields an
    /// [`ExecutionResult`] with status 504 holding whatever was captured
    /// before termination; callers report it as a `TimeoutError`.
    pub fn normalize(
        &self,
        raw: &RawOutput,
        outcome: Outcome,
    ) -> Result<ExecutionResult, InvocationError> {
        let parsed = parse(raw);
        let memory_peak_mb = parsed
            .report
            .as_ref()
            .map(|r| kb_to_mb(r.memory_peak_kb))
            .unwrap_or(0);
        let stderr = self.excerpt(&raw.stderr);

        match outcome {
            Outcome::TimedOut => Ok(ExecutionResult {
                status_code: 504,
                body: Value::Null,
                stdout: parsed.user_stdout,
                stderr,
                duration_ms: raw.elapsed.as_millis() as u64,
                memory_peak_mb,
                outcome,
            }),
            Outcome::Completed => match self.completed(&parsed) {
                Ok((status_code, body)) => Ok(ExecutionResult {
                    status_code,
                    body,
                    stdout: parsed.user_stdout,
                    stderr,
                    duration_ms: raw.elapsed.as_millis() as u64,
                    memory_peak_mb,
                    outcome,
                }),
                Err(message) => Err(InvocationError::Runtime {
                    message,
                    stdout: parsed.user_stdout,
                    stderr,
                }),
            },
            Outcome::Failed => Err(InvocationError::Runtime {
                message: failure_message(raw, &parsed),
                stdout: parsed.user_stdout,
                stderr,
            }),
        }
    }

    /// Measurements for one invocation. `raw` is absent when the sandbox
    /// never ran or was abandoned.
    #[allow(clippy::too_many_arguments)]
    pub fn metrics(
        &self,
        sandbox_id: &SandboxId,
        function_id: &str,
        engine: EngineKind,
        outcome: Outcome,
        cold_start: bool,
        raw: Option<&RawOutput>,
        total: Duration,
    ) -> InvocationMetrics {
        let boot = raw.and_then(|r| r.boot_latency);
        let memory_peak_mb = raw
            .and_then(|r| parse(r).report.ok())
            .map(|report| kb_to_mb(report.memory_peak_kb));

        InvocationMetrics {
            sandbox_id: sandbox_id.to_string(),
            function_id: function_id.to_string(),
            engine,
            outcome,
            cold_start,
            boot_ms: boot.map(|b| b.as_millis() as u64),
            handler_ms: raw
                .zip(boot)
                .map(|(r, b)| r.elapsed.saturating_sub(b).as_millis() as u64),
            duration_ms: raw.map_or(0, |r| r.elapsed.as_millis() as u64),
            total_ms: total.as_millis() as u64,
            memory_peak_mb,
        }
    }

    fn completed(&self, parsed: &Parsed) -> Result<(u16, Value), String> {
        let report = parsed.report.as_ref().map_err(Clone::clone)?;
        if !report.ok {
            return Err(report
                .error
                .clone()
                .unwrap_or_else(|| "handler raised an error".to_string()));
        }
        response_fields(&report.value)
    }

    /// Tail of stderr, cut on a character boundary.
    fn excerpt(&self, stderr: &str) -> String {
        if stderr.len() <= self.stderr_excerpt_bytes {
            return stderr.to_string();
        }
        let mut start = stderr.len() - self.stderr_excerpt_bytes;
        while !stderr.is_char_boundary(start) {
            start += 1;
        }
        stderr[start..].to_string()
    }
}

fn parse(raw: &RawOutput) -> Parsed {
    let mut user_stdout = String::new();
    let mut report = Err("handler produced no result".to_string());
    // Console output before the boot marker belongs to the sandbox, not the user
    let booted_at = raw
        .stdout
        .lines()
        .position(|line| line.trim_start().starts_with(BOOT_MARKER));

    for (index, line) in raw.stdout.lines().enumerate() {
        let trimmed = line.trim_start();
        if let Some(json) = trimmed.strip_prefix(RESULT_MARKER) {
            report = serde_json::from_str::<BootstrapReport>(json.trim())
                .map_err(|e| format!("handler returned a malformed payload: {}", e));
            continue;
        }
        if booted_at.is_some_and(|boot| index <= boot) {
            continue;
        }
        user_stdout.push_str(line.trim_end_matches('\r'));
        user_stdout.push('\n');
    }

    Parsed {
        user_stdout,
        report,
    }
}

/// Extract `statusCode` and `body` from the handler's return value.
fn response_fields(value: &Value) -> Result<(u16, Value), String> {
    let Value::Object(map) = value else {
        return Err(format!(
            "handler returned a malformed payload: expected an object with statusCode and body, got {}",
            type_name(value)
        ));
    };

    let status_code = match map.get("statusCode") {
        None | Some(Value::Null) => 200,
        Some(Value::Number(n)) => match n.as_u64() {
            Some(code @ 100..=599) => code as u16,
            _ => {
                return Err(format!(
                    "handler returned a malformed payload: statusCode {} is not a valid HTTP status",
                    n
                ))
            }
        },
        Some(other) => {
            return Err(format!(
                "handler returned a malformed payload: statusCode must be a number, got {}",
                type_name(other)
            ))
        }
    };

    let body = match map.get("body") {
        None | Some(Value::Null) => Value::String(String::new()),
        Some(body) => body.clone(),
    };

    Ok((status_code, body))
}

fn failure_message(raw: &RawOutput, parsed: &Parsed) -> String {
    if let Ok(report) = &parsed.report {
        if !report.ok {
            if let Some(error) = &report.error {
                return error.clone();
            }
        }
    }

    let mut message = match raw.exit_code {
        Some(0) => match &parsed.report {
            Ok(report) => match response_fields(&report.value) {
                Err(reason) => reason,
                Ok(_) => "handler failed".to_string(),
            },
            Err(reason) => reason.clone(),
        },
        Some(137) => "sandbox was killed (exit status 137), possibly out of memory".to_string(),
        Some(code) => format!("handler exited with status {}", code),
        None => "sandbox was terminated by a signal".to_string(),
    };
    if raw.truncated {
        message.push_str(" (output truncated)");
    }
    message
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn kb_to_mb(kb: u64) -> u64 {
    kb.div_ceil(1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(stdout: &str, stderr: &str, exit_code: Option<i32>) -> RawOutput {
        RawOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            boot_latency: Some(Duration::from_millis(40)),
            elapsed: Duration::from_millis(120),
            truncated: false,
        }
    }

    fn result_line(payload: Value) -> String {
        format!("{} {}\n", RESULT_MARKER, payload)
    }

    #[test]
    fn test_completed_result() {
        let collector = ResultCollector::new(1024);
        let out = raw(
            &format!(
                "{}\nhello from handler\n{}",
                BOOT_MARKER,
                result_line(json!({
                    "ok": true,
                    "value": {"statusCode": 201, "body": {"id": 7}},
                    "memoryPeakKB": 10241
                }))
            ),
            "",
            Some(0),
        );

        assert_eq!(collector.classify(&out), Outcome::Completed);
        let result = collector.normalize(&out, Outcome::Completed).unwrap();
        assert_eq!(result.status_code, 201);
        assert_eq!(result.body, json!({"id": 7}));
        assert_eq!(result.stdout, "hello from handler\n");
        assert_eq!(result.memory_peak_mb, 11);
        assert_eq!(result.duration_ms, 120);
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let collector = ResultCollector::new(1024);
        let out = raw(
            &result_line(json!({"ok": true, "value": {}, "memoryPeakKB": 0})),
            "",
            Some(0),
        );

        let result = collector.normalize(&out, Outcome::Completed).unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(result.body, json!(""));
    }

    #[test]
    fn test_non_object_return_is_malformed() {
        let collector = ResultCollector::new(1024);
        let out = raw(
            &format!("partial\n{}", result_line(json!({"ok": true, "value": "hello"}))),
            "",
            Some(0),
        );

        assert_eq!(collector.classify(&out), Outcome::Failed);
        match collector.normalize(&out, Outcome::Failed).unwrap_err() {
            InvocationError::Runtime { message, stdout, .. } => {
                assert!(message.contains("malformed"));
                assert_eq!(stdout, "partial\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_status_code_is_malformed() {
        let collector = ResultCollector::new(1024);
        let out = raw(
            &result_line(json!({"ok": true, "value": {"statusCode": 42}})),
            "",
            Some(0),
        );
        assert_eq!(collector.classify(&out), Outcome::Failed);
    }

    #[test]
    fn test_missing_result_line() {
        let collector = ResultCollector::new(1024);
        let out = raw("just printing\n", "", Some(0));
        assert_eq!(collector.classify(&out), Outcome::Failed);

        let err = collector.normalize(&out, Outcome::Failed).unwrap_err();
        assert!(err.to_string().contains("no result"));
    }

    #[test]
    fn test_handler_exception() {
        let collector = ResultCollector::new(16);
        let out = raw(
            &result_line(json!({
                "ok": false,
                "error": "ValueError: bad input",
                "memoryPeakKB": 9000
            })),
            "Traceback (most recent call last):\nValueError: bad input\n",
            Some(1),
        );

        assert_eq!(collector.classify(&out), Outcome::Failed);
        match collector.normalize(&out, Outcome::Failed).unwrap_err() {
            InvocationError::Runtime { message, stderr, .. } => {
                assert_eq!(message, "ValueError: bad input");
                assert_eq!(stderr, "rror: bad input\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_signal_exit() {
        let collector = ResultCollector::new(1024);
        let out = raw("", "", None);
        let err = collector.normalize(&out, Outcome::Failed).unwrap_err();
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn test_timed_out_keeps_partial_output() {
        let collector = ResultCollector::new(1024);
        let out = raw(&format!("{}\nworking...\n", BOOT_MARKER), "", None);
        let result = collector.normalize(&out, Outcome::TimedOut).unwrap();
        assert_eq!(result.status_code, 504);
        assert_eq!(result.outcome, Outcome::TimedOut);
        assert_eq!(result.stdout, "working...\n");
    }

    #[test]
    fn test_console_noise_before_boot_dropped() {
        let collector = ResultCollector::new(1024);
        let out = raw(
            &format!(
                "booting...\r\nen1: assigned 10.0.2.15\r\n{}\r\nuser line\r\n{}",
                BOOT_MARKER,
                result_line(json!({"ok": true, "value": {"body": "ok"}}))
            ),
            "",
            Some(0),
        );
        let result = collector.normalize(&out, Outcome::Completed).unwrap();
        assert_eq!(result.stdout, "user line\n");
    }

    #[test]
    fn test_metrics() {
        let collector = ResultCollector::new(1024);
        let out = raw(
            &result_line(json!({"ok": true, "value": {}, "memoryPeakKB": 2048})),
            "",
            Some(0),
        );
        let metrics = collector.metrics(
            &SandboxId::generate(EngineKind::Unikernel),
            "u1-main-run",
            EngineKind::Unikernel,
            Outcome::Completed,
            true,
            Some(&out),
            Duration::from_millis(500),
        );
        assert_eq!(metrics.boot_ms, Some(40));
        assert_eq!(metrics.handler_ms, Some(80));
        assert_eq!(metrics.memory_peak_mb, Some(2));
        assert_eq!(metrics.total_ms, 500);
    }

    #[test]
    fn test_excerpt_respects_char_boundary() {
        let collector = ResultCollector::new(2);
        assert_eq!(collector.excerpt("aéb"), "b");
        assert_eq!(collector.excerpt("ab"), "ab");
    }
}
