//! Provisioner that delegates each operation to an external command.
//!
//! The command receives the operation as a JSON object on stdin, with an
//! `action` field of `create`, `update` or `destroy`, and prints the computed
//! outputs as a JSON object on stdout. Exit status 75 marks a failure as
//! retryable; any other non-zero status is permanent.

use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ApplyRequest, Outputs, ResourceProvisioner};
use crate::error::ResourceApplyError;

/// Exit status an engine uses to report a transient failure.
pub const EX_TEMPFAIL: i32 = 75;

/// Runs a configured program once per operation.
#[derive(Debug, Clone)]
pub struct ExternalCommandProvisioner {
    program: String,
    args: Vec<String>,
}

#[derive(Serialize)]
struct Invocation<'a> {
    action: &'static str,
    #[serde(flatten)]
    request: &'a ApplyRequest,
}

impl ExternalCommandProvisioner {
    /// Creates a provisioner running `program` with fixed `args`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Creates a provisioner from a command line split into words.
    ///
    /// Returns `None` for an empty command line.
    #[must_use]
    pub fn from_command_line(words: &[String]) -> Option<Self> {
        let (program, args) = words.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    /// The program this provisioner runs.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    async fn invoke(&self, action: &'static str, request: &ApplyRequest) -> Result<String, ResourceApplyError> {
        let payload = serde_json::to_vec(&Invocation { action, request })
            .map_err(|e| ResourceApplyError::permanent(format!("Failed to encode request: {e}")))?;

        debug!("Running {} {action} for {}", self.program, request.address);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("TERRASTACK_ACTION", action)
            .env("TERRASTACK_ADDRESS", request.address.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ResourceApplyError::permanent(format!("Failed to spawn {}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ResourceApplyError::permanent("Failed to open engine stdin"))?;
        let write = async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        };

        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output.map_err(|e| ResourceApplyError::retryable(format!("Failed waiting for engine: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let code = output.status.code();
            warn!("{} {action} for {} exited with {code:?}", self.program, request.address);
            let message = format!(
                "{} {action} exited with status {}: {stderr}",
                self.program,
                code.map_or_else(|| String::from("signal"), |c| c.to_string())
            );
            return Err(if code == Some(EX_TEMPFAIL) {
                ResourceApplyError::retryable(message)
            } else {
                ResourceApplyError::permanent(message)
            });
        }

        // A command that exits successfully without reading its input is fine.
        if let Err(e) = written {
            debug!("Engine did not consume its input: {e}");
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn parse_outputs(stdout: &str) -> Result<Outputs, ResourceApplyError> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Outputs::new());
        }
        serde_json::from_str(trimmed)
            .map_err(|e| ResourceApplyError::permanent(format!("Engine printed invalid outputs: {e}")))
    }
}

#[async_trait]
impl ResourceProvisioner for ExternalCommandProvisioner {
    async fn create(&self, request: &ApplyRequest) -> Result<Outputs, ResourceApplyError> {
        Self::parse_outputs(&self.invoke("create", request).await?)
    }

    async fn update(&self, request: &ApplyRequest) -> Result<Outputs, ResourceApplyError> {
        Self::parse_outputs(&self.invoke("update", request).await?)
    }

    async fn destroy(&self, request: &ApplyRequest) -> Result<(), ResourceApplyError> {
        self.invoke("destroy", request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceAddress;
    use crate::planner::OperationKind;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn shell(script: &str) -> ExternalCommandProvisioner {
        ExternalCommandProvisioner::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn request() -> ApplyRequest {
        ApplyRequest {
            address: ResourceAddress::new("net", "vpc"),
            resource_type: "aws_vpc".to_string(),
            kind: OperationKind::Create,
            attributes: BTreeMap::from([("cidrBlock".to_string(), json!("10.0.0.0/16"))]),
            prior: None,
        }
    }

    #[tokio::test]
    async fn test_outputs_parsed_from_stdout() {
        let engine = shell(r#"cat > /dev/null; echo '{"id": "vpc-123"}'"#);
        let outputs = engine.create(&request()).await.unwrap();
        assert_eq!(outputs["id"], json!("vpc-123"));
    }

    #[tokio::test]
    async fn test_request_sent_on_stdin() {
        let engine = shell(r#"input=$(cat); printf '{"echo": %s}' "$input""#);
        let outputs = engine.update(&request()).await.unwrap();
        assert_eq!(outputs["echo"]["action"], json!("update"));
        assert_eq!(outputs["echo"]["address"], json!("net/vpc"));
        assert_eq!(outputs["echo"]["attributes"]["cidrBlock"], json!("10.0.0.0/16"));
    }

    #[tokio::test]
    async fn test_empty_stdout_is_no_outputs() {
        let engine = shell("cat > /dev/null");
        assert!(engine.create(&request()).await.unwrap().is_empty());
        engine.destroy(&request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_tempfail_is_retryable() {
        let err = shell("cat > /dev/null; echo throttled >&2; exit 75")
            .create(&request())
            .await
            .unwrap_err();
        assert!(err.retryable);
        assert!(err.message.contains("throttled"));
    }

    #[tokio::test]
    async fn test_other_failures_are_permanent() {
        let err = shell("cat > /dev/null; exit 1").create(&request()).await.unwrap_err();
        assert!(!err.retryable);

        let err = ExternalCommandProvisioner::new("/nonexistent/terrastack-engine", vec![])
            .create(&request())
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }

    #[test]
    fn test_from_command_line() {
        assert!(ExternalCommandProvisioner::from_command_line(&[]).is_none());
        let engine =
            ExternalCommandProvisioner::from_command_line(&["./engine".to_string(), "--dry".to_string()]).unwrap();
        assert_eq!(engine.program(), "./engine");
    }
}
