//! Capability Invocation
//!
//! The engine reaches the outside world through exactly one seam, the
//! [`CapabilityInvoker`] trait. Two implementations ship with the crate:
//!
//! - [`ProcessInvoker`]: runs the shell command a [`StaticCatalog`] assigns to
//!   the capability, feeding the parameters as JSON on stdin
//! - [`DryRunInvoker`]: performs no work and echoes what would have been sent

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::catalog::StaticCatalog;
use crate::workflow::CapabilityRef;

/// Failure reported by a capability invocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvocationError {
    #[error("capability '{0}' is not available")]
    UnknownCapability(String),
    #[error("capability '{capability}' failed: {message}")]
    Failed { capability: String, message: String },
    #[error("capability '{capability}' timed out after {timeout_ms} ms")]
    Timeout { capability: String, timeout_ms: u64 },
    #[error("could not launch capability '{capability}': {message}")]
    Launch { capability: String, message: String },
}

impl InvocationError {
    /// Convenience constructor for a generic failure.
    pub fn failed(capability: &CapabilityRef, message: impl Into<String>) -> Self {
        Self::Failed {
            capability: capability.to_string(),
            message: message.into(),
        }
    }
}

/// Invokes a capability with a concrete parameter map.
///
/// Implementations decide how a [`CapabilityRef`] reaches a live endpoint;
/// the engine only awaits a JSON value or an error.
#[async_trait]
pub trait CapabilityInvoker: Send + Sync {
    async fn invoke(
        &self,
        capability: &CapabilityRef,
        parameters: &Map<String, Value>,
    ) -> Result<Value, InvocationError>;
}

#[async_trait]
impl<T: CapabilityInvoker + ?Sized> CapabilityInvoker for Arc<T> {
    async fn invoke(
        &self,
        capability: &CapabilityRef,
        parameters: &Map<String, Value>,
    ) -> Result<Value, InvocationError> {
        (**self).invoke(capability, parameters).await
    }
}

/// Invoker that performs no work.
///
/// Returns `{"capability": "...", "parameters": {...}, "dry_run": true}`
/// so downstream output mappings can still be traced.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunInvoker;

#[async_trait]
impl CapabilityInvoker for DryRunInvoker {
    async fn invoke(
        &self,
        capability: &CapabilityRef,
        parameters: &Map<String, Value>,
    ) -> Result<Value, InvocationError> {
        info!("[DRY RUN] {} {}", capability, Value::Object(parameters.clone()));
        Ok(json!({
            "capability": capability.to_string(),
            "parameters": parameters,
            "dry_run": true,
        }))
    }
}

/// Runs catalog commands through the system shell.
///
/// The command template may contain `{name}` placeholders. Each one becomes a
/// quoted reference to an environment variable holding the parameter of the
/// same name (strings verbatim, other values as JSON), so a value always
/// reaches the command as one literal word. The full parameter map is also
/// written to the process's stdin as JSON.
/// Stdout is parsed as JSON when possible; otherwise the result is
/// `{"stdout": "<text>"}`.
pub struct ProcessInvoker {
    catalog: Arc<StaticCatalog>,
    working_dir: Option<PathBuf>,
}

impl ProcessInvoker {
    pub fn new(catalog: Arc<StaticCatalog>) -> Self {
        Self {
            catalog,
            working_dir: None,
        }
    }

    /// Sets the working directory commands run in.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = Some(dir.into());
    }
}

#[async_trait]
impl CapabilityInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        capability: &CapabilityRef,
        parameters: &Map<String, Value>,
    ) -> Result<Value, InvocationError> {
        let entry = self
            .catalog
            .get(capability)
            .ok_or_else(|| InvocationError::UnknownCapability(capability.to_string()))?;

        let (command_text, arguments) = render_command(entry.command(), parameters);
        debug!("Invoking {}: {}", capability, command_text);

        let (shell, flag) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };

        let mut cmd = Command::new(shell);
        cmd.arg(flag)
            .arg(&command_text)
            .env("CHAINRUNNER_SERVER", &capability.server)
            .env("CHAINRUNNER_TOOL", &capability.tool)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(arguments)
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let launch_error = |e: std::io::Error| InvocationError::Launch {
            capability: capability.to_string(),
            message: e.to_string(),
        };

        let mut child = cmd.spawn().map_err(launch_error)?;

        // Stdin is fed while stdout drains; a filter echoing a large payload
        // would otherwise block on a full pipe.
        let stdin = child.stdin.take();
        let payload = Value::Object(parameters.clone()).to_string();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that ignores stdin may close it early; that is not a failure.
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!("{}: stdin closed early: {}", capability, e);
                }
            }
        };

        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(launch_error)?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if output.status.success() {
            Ok(parse_stdout(&stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                "Capability '{}' failed with exit code: {:?}",
                capability,
                output.status.code()
            );
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            Err(InvocationError::failed(
                capability,
                format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    detail
                ),
            ))
        }
    }
}

const ARGUMENT_PREFIX: &str = "CHAINRUNNER_ARG_";

/// Replaces `{name}` placeholders with quoted environment references and
/// returns the command together with the variables it refers to.
fn render_command(
    template: &str,
    parameters: &Map<String, Value>,
) -> (String, Vec<(String, String)>) {
    let mut command = template.to_string();
    let mut arguments = Vec::new();

    for (name, value) in parameters {
        let placeholder = format!("{{{}}}", name);
        if !command.contains(&placeholder) {
            continue;
        }
        let variable = format!("{}{}", ARGUMENT_PREFIX, arguments.len());
        let reference = if cfg!(target_os = "windows") {
            format!("\"%{}%\"", variable)
        } else {
            format!("\"${}\"", variable)
        };
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        command = command.replace(&placeholder, &reference);
        arguments.push((variable, text));
    }

    (command, arguments)
}

/// Interprets command output as JSON, falling back to raw text.
fn parse_stdout(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| json!({ "stdout": trimmed }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn test_render_command_placeholders() {
        let (rendered, arguments) = render_command(
            "fetch {city} --days {days} {missing}",
            &params(json!({"city": "Porto", "days": 3})),
        );
        assert_eq!(
            rendered,
            "fetch \"$CHAINRUNNER_ARG_0\" --days \"$CHAINRUNNER_ARG_1\" {missing}"
        );
        assert_eq!(
            arguments,
            vec![
                ("CHAINRUNNER_ARG_0".to_string(), "Porto".to_string()),
                ("CHAINRUNNER_ARG_1".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_stdout_json_and_text() {
        assert_eq!(parse_stdout("{\"value\": 42}\n"), json!({"value": 42}));
        assert_eq!(parse_stdout("hello\n"), json!({"stdout": "hello"}));
        assert_eq!(parse_stdout("   "), json!({}));
    }

    #[tokio::test]
    async fn test_dry_run_echoes_parameters() {
        let result = DryRunInvoker
            .invoke(&CapabilityRef::new("s", "t"), &params(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(result["capability"], "s/t");
        assert_eq!(result["parameters"]["x"], 1);
        assert_eq!(result["dry_run"], true);
    }

    #[tokio::test]
    async fn test_process_invoker_unknown_capability() {
        let invoker = ProcessInvoker::new(Arc::new(StaticCatalog::new()));
        let result = invoker
            .invoke(&CapabilityRef::new("nope", "nothing"), &Map::new())
            .await;
        assert!(matches!(result, Err(InvocationError::UnknownCapability(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_invoker_parses_json_stdout() {
        let mut catalog = StaticCatalog::new();
        catalog.insert("math", "answer", "echo '{\"value\": {n}}'");
        let invoker = ProcessInvoker::new(Arc::new(catalog));

        let result = invoker
            .invoke(&CapabilityRef::new("math", "answer"), &params(json!({"n": 42})))
            .await
            .unwrap();
        assert_eq!(result, json!({"value": 42}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_invoker_reads_stdin() {
        let mut catalog = StaticCatalog::new();
        catalog.insert("io", "cat", "cat");
        let invoker = ProcessInvoker::new(Arc::new(catalog));

        let result = invoker
            .invoke(&CapabilityRef::new("io", "cat"), &params(json!({"k": "v"})))
            .await
            .unwrap();
        assert_eq!(result, json!({"k": "v"}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_invoker_streams_large_payload() {
        let mut catalog = StaticCatalog::new();
        catalog.insert("io", "cat", "cat");
        let invoker = ProcessInvoker::new(Arc::new(catalog));
        let blob = "x".repeat(512 * 1024);

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            invoker.invoke(&CapabilityRef::new("io", "cat"), &params(json!({"blob": blob}))),
        )
        .await
        .expect("invocation did not finish")
        .unwrap();

        assert_eq!(result["blob"].as_str().unwrap().len(), 512 * 1024);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_invoker_keeps_values_literal() {
        let mut catalog = StaticCatalog::new();
        catalog.insert("sys", "args", "printf '%s\\n' {value} | wc -l; echo {value}");
        let invoker = ProcessInvoker::new(Arc::new(catalog));

        let result = invoker
            .invoke(
                &CapabilityRef::new("sys", "args"),
                &params(json!({"value": "x; echo injected"})),
            )
            .await
            .unwrap();

        let stdout = result["stdout"].as_str().unwrap();
        let lines: Vec<&str> = stdout.lines().map(str::trim).collect();
        assert_eq!(lines, vec!["1", "x; echo injected"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_invoker_reports_failure() {
        let mut catalog = StaticCatalog::new();
        catalog.insert("sys", "fail", "echo broken >&2; exit 3");
        let invoker = ProcessInvoker::new(Arc::new(catalog));

        let err = invoker
            .invoke(&CapabilityRef::new("sys", "fail"), &Map::new())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit code 3"));
        assert!(message.contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_invoker_working_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("marker.txt"), "found").unwrap();

        let mut catalog = StaticCatalog::new();
        catalog.insert("fs", "read", "cat marker.txt");
        let mut invoker = ProcessInvoker::new(Arc::new(catalog));
        invoker.set_working_dir(temp_dir.path());

        let result = invoker
            .invoke(&CapabilityRef::new("fs", "read"), &Map::new())
            .await
            .unwrap();
        assert_eq!(result, json!({"stdout": "found"}));
    }
}
