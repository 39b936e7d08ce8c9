//! CommandDelegate - 設定されたシェルコマンドを delegate として実行
//!
//! # プロトコル
//! - stdin: タスク JSON
//! - env: `WARDEN_TASK_ID`, `WARDEN_TASK_PHASE`, `WARDEN_PAYLOAD_REF`
//! - stdout の最後の空でない行: `DelegateOutput` JSON
//!
//! 非ゼロ終了や結果行がない場合は delegate 自体の失敗（breaker に数える）。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use warden_core::domain::{DelegateOutput, Task};
use warden_core::ports::Delegate;
use warden_core::CoreError;

pub struct CommandDelegate {
    name: String,
    command: String,
    timeout: Option<Duration>,
}

impl CommandDelegate {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Delegate for CommandDelegate {
    async fn execute(&self, task: &Task) -> Result<DelegateOutput, CoreError> {
        let input = serde_json::to_vec(task)?;
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("WARDEN_TASK_ID", task.id.to_string())
            .env("WARDEN_TASK_PHASE", task.phase.as_str())
            .env("WARDEN_PAYLOAD_REF", &task.payload_ref)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(delegate = %self.name, task_id = %task.id, pid = ?child.id(), "delegate started");

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&input).await {
                Ok(()) => {}
                // the command does not read its input
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e.into()),
            }
        }

        let run = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| CoreError::Timeout(format!("delegate `{}`", self.name)))??,
            None => run.await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::Delegate(format!(
                "`{}` exited with {}: {}",
                self.name,
                output.status,
                tail(&stderr, 512)
            )));
        }
        parse_result(&self.name, &stdout)
    }
}

/// The last non-empty stdout line as a [`DelegateOutput`].
fn parse_result(name: &str, stdout: &str) -> Result<DelegateOutput, CoreError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| CoreError::Delegate(format!("`{name}` printed no result line")))?;
    serde_json::from_str(line)
        .map_err(|e| CoreError::Delegate(format!("`{name}` result line is not valid output: {e}")))
}

fn tail(s: &str, max: usize) -> &str {
    let s = s.trim_end();
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
