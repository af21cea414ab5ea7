//! Echo machine
//!
//! Minimal execution machine used by tests and as a reference for
//! implementing real machines. It accepts either a plain command string
//! (`"echo hi"`) or an object:
//!
//! ```json
//! {"command": "echo hi", "sleep_ms": 50, "secrets": {"TOKEN": "t"}}
//! ```
//!
//! The `secrets` map is stripped during prefilter and round-trips through
//! the mediator; the run writes each secret name (never the value) plus
//! the echoed text to the output sink.

use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use super::{
    ExecutionMachine, FieldKind, FieldSpec, ParamSchema, Prefiltered, PrefilterError, RunContext,
};
use crate::ledger::SecretVars;

/// Granularity of the cancel-flag poll during a sleeping run
const SLEEP_STEP_MS: u64 = 10;

/// Execution machine that echoes its command text
#[derive(Debug, Default)]
pub struct EchoMachine;

impl EchoMachine {
    /// Create the machine
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionMachine for EchoMachine {
    fn job_type(&self) -> &str {
        "echo"
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema {
            fields: vec![
                FieldSpec {
                    path: "command",
                    kind: FieldKind::Text,
                    required: true,
                },
                FieldSpec {
                    path: "sleep_ms",
                    kind: FieldKind::Number,
                    required: false,
                },
            ],
        }
    }

    fn prefilter(&self, raw: &Value) -> Result<Prefiltered, PrefilterError> {
        let (command, sleep_ms, secrets) = match raw {
            Value::String(command) => (command.clone(), 0u64, SecretVars::new()),
            Value::Object(map) => {
                let command = map
                    .get("command")
                    .and_then(Value::as_str)
                    .ok_or_else(|| PrefilterError("missing command".into()))?
                    .to_string();
                let sleep_ms = map.get("sleep_ms").and_then(Value::as_u64).unwrap_or(0);
                let secrets = match map.get("secrets") {
                    None => SecretVars::new(),
                    Some(Value::Object(vars)) => vars
                        .iter()
                        .map(|(k, v)| match v.as_str() {
                            Some(s) => Ok((k.clone(), s.to_string())),
                            None => Err(PrefilterError(format!(
                                "secret {k} must be a string"
                            ))),
                        })
                        .collect::<Result<SecretVars, _>>()?,
                    Some(_) => return Err(PrefilterError("secrets must be a map".into())),
                };
                (command, sleep_ms, secrets)
            }
            other => {
                return Err(PrefilterError(format!(
                    "expected a command string or object, got {other}"
                )))
            }
        };

        Ok(Prefiltered {
            sanitized: json!({"command": command, "sleep_ms": sleep_ms}),
            secrets,
        })
    }

    fn run(&self, ctx: RunContext<'_>) -> Result<String, String> {
        let command = ctx
            .parameters
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| "job parameters lost their command".to_string())?
            .to_string();
        let sleep_ms = ctx
            .parameters
            .get("sleep_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        for name in ctx.secrets.keys() {
            ctx.output
                .line(&format!("secret available: {name}"))
                .map_err(|e| e.to_string())?;
        }

        let text = command.strip_prefix("echo ").unwrap_or(&command);
        ctx.output.line(text).map_err(|e| e.to_string())?;

        let mut slept = 0u64;
        while slept < sleep_ms {
            if ctx.is_cancelled() {
                return Err("cancelled".into());
            }
            thread::sleep(Duration::from_millis(SLEEP_STEP_MS));
            slept += SLEEP_STEP_MS;
        }
        if ctx.is_cancelled() {
            return Err("cancelled".into());
        }

        Ok(format!("echoed {} bytes", text.len()))
    }
}
