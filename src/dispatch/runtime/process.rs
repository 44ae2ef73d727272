//! Process Runtime Implementation
//! 进程运行时实现
//!
//! One interpreter subprocess per invocation. A short wrapper script loads the
//! function's entrypoint, calls `handler(event, context)` and prints the JSON result
//! on a single sentinel-prefixed line. Failures go to stderr with a non-zero exit.
//! 每次调用启动一个解释器子进程。包装脚本加载函数入口，调用 `handler(event, context)`，
//! 并在一行带哨兵前缀的输出中打印 JSON 结果；失败时写入 stderr 并以非零状态退出。

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Invocation, RuntimeKind, RuntimeStrategy};
use crate::config::ExecutorConfig;
use crate::dispatch::invocation::{ExecutionContext, ExecutionFailure, LogBuffer, LogLevel};
use crate::dispatch::registry::FunctionStore;

/// Interpreter subprocess runtime / 解释器子进程运行时
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    kind: RuntimeKind,
    interpreter: String,
    store: FunctionStore,
    env_whitelist: Vec<String>,
    sentinel: String,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Stopped,
}

/// Output collected from stdout / 从 stdout 收集的输出
#[derive(Debug, Default)]
struct StdoutCapture {
    sentinel_payload: Option<String>,
    raw: String,
}

impl ProcessRuntime {
    pub fn new(kind: RuntimeKind, store: FunctionStore, config: &ExecutorConfig) -> Self {
        let interpreter = match kind {
            RuntimeKind::Python => config.python_bin.clone(),
            RuntimeKind::Node => config.node_bin.clone(),
            RuntimeKind::Ruby => config.ruby_bin.clone(),
            RuntimeKind::Native => String::new(),
        };
        Self {
            kind,
            interpreter,
            store,
            env_whitelist: config.env_whitelist.clone(),
            sentinel: config.result_sentinel.clone(),
        }
    }

    fn wrapper_file(&self) -> &'static str {
        match self.kind {
            RuntimeKind::Node => "wrapper.js",
            RuntimeKind::Ruby => "wrapper.rb",
            RuntimeKind::Python | RuntimeKind::Native => "wrapper.py",
        }
    }

    /// Generate the wrapper script / 生成包装脚本
    pub fn wrapper_script(
        &self,
        entrypoint: &Path,
        event: &Value,
        context: &ExecutionContext,
    ) -> Result<String, ExecutionFailure> {
        let encode = |e: serde_json::Error| {
            ExecutionFailure::spawn(format!("Failed to encode wrapper input: {}", e))
        };
        let event_json = serde_json::to_string(event).map_err(encode)?;
        let context_json = serde_json::to_string(context).map_err(encode)?;
        let entry = entrypoint.to_string_lossy();

        let script = match self.kind {
            RuntimeKind::Ruby => format!(
                r##"require 'json'
begin
  load {entry}
  event = JSON.parse({event})
  context = JSON.parse({context})
  result = handler(event, context)
  $stdout.flush
  puts {sentinel} + JSON.generate(result)
rescue Exception => e
  $stderr.puts "#{{e.class}}: #{{e.message}}"
  exit 1
end
"##,
                entry = ruby_literal(&entry),
                event = ruby_literal(&event_json),
                context = ruby_literal(&context_json),
                sentinel = ruby_literal(&self.sentinel),
            ),
            RuntimeKind::Node => format!(
                r#"(async () => {{
  try {{
    const mod = require({entry});
    const handler = typeof mod === 'function' ? mod : (mod.handler || mod.default);
    const event = JSON.parse({event});
    const context = JSON.parse({context});
    const result = await handler(event, context);
    process.stdout.write({sentinel} + JSON.stringify(result === undefined ? null : result) + '\n');
  }} catch (err) {{
    process.stderr.write(String(err && err.stack ? err.stack : err) + '\n');
    process.exit(1);
  }}
}})();
"#,
                entry = json_literal(&entry)?,
                event = json_literal(&event_json)?,
                context = json_literal(&context_json)?,
                sentinel = json_literal(&self.sentinel)?,
            ),
            RuntimeKind::Python | RuntimeKind::Native => format!(
                r#"import importlib.util
import json
import sys
import traceback

try:
    spec = importlib.util.spec_from_file_location("edge_handler", {entry})
    module = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(module)
    event = json.loads({event})
    context = json.loads({context})
    result = module.handler(event, context)
    sys.stdout.flush()
    print({sentinel} + json.dumps(result), flush=True)
except BaseException:
    traceback.print_exc()
    sys.exit(1)
"#,
                entry = json_literal(&entry)?,
                event = json_literal(&event_json)?,
                context = json_literal(&context_json)?,
                sentinel = json_literal(&self.sentinel)?,
            ),
        };
        Ok(script)
    }

    /// Build the interpreter command / 构建解释器命令
    fn build_command(&self, wrapper: &Path, workdir: &Path, context: &ExecutionContext) -> Command {
        let mut command = Command::new(&self.interpreter);
        command.arg(wrapper);
        command.current_dir(workdir);

        // Set environment variables / 设置环境变量
        command.env_clear();

        // Add whitelisted environment variables / 添加白名单环境变量
        for env_var in &self.env_whitelist {
            if let Ok(value) = std::env::var(env_var) {
                command.env(env_var, value);
            }
        }

        // Add function environment variables / 添加函数环境变量
        for (key, value) in &context.env {
            command.env(key, value);
        }
        command.env("EDGE_REQUEST_ID", &context.request_id);
        command.env("EDGE_FUNCTION_ID", &context.function_id);

        // Configure stdio / 配置标准输入输出
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        // Own process group so the whole tree can be killed / 独立进程组，便于终止整个进程树
        #[cfg(unix)]
        {
            #[allow(unused_imports)]
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command
    }

    fn capture_stdout<R>(&self, stream: R, logs: LogBuffer) -> JoinHandle<StdoutCapture>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sentinel = self.sentinel.clone();
        tokio::spawn(async move {
            let mut capture = StdoutCapture::default();
            read_lines(stream, |line| {
                if let Some(payload) = line.strip_prefix(sentinel.as_str()) {
                    capture.sentinel_payload = Some(payload.to_string());
                    return;
                }
                capture.raw.push_str(&line);
                capture.raw.push('\n');
                logs.push(LogLevel::Info, line);
            })
            .await;
            capture
        })
    }

    fn capture_stderr<R>(stream: R, logs: LogBuffer) -> JoinHandle<String>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut raw = String::new();
            read_lines(stream, |line| {
                raw.push_str(&line);
                raw.push('\n');
                logs.push(LogLevel::Error, line);
            })
            .await;
            raw
        })
    }
}

/// Consecutive read errors tolerated before a stream is given up
/// 放弃读取前允许的连续读取错误次数
const MAX_READ_ERRORS: usize = 8;

/// Read a child stream to EOF, one lossily decoded line at a time
/// 读取子进程输出流直至 EOF，逐行进行有损解码
///
/// The pipe keeps being drained after undecodable bytes or transient read errors, so
/// the child never blocks on, or dies from, a full or closed pipe.
/// 遇到无法解码的字节或暂时性读取错误时继续读取，避免子进程因管道满或关闭而阻塞或退出。
async fn read_lines<R, F>(stream: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut errors = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                errors = 0;
                on_line(decode_line(&buf));
            }
            Err(e) => {
                errors += 1;
                debug!(error = %e, errors, "Error reading child output");
                if errors >= MAX_READ_ERRORS {
                    warn!(error = %e, "Giving up on child output stream");
                    break;
                }
            }
        }
    }
}

/// Strip the line terminator and replace invalid UTF-8 / 去除行结束符并替换非法 UTF-8
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Kills the process group when dropped, unless disarmed after a clean exit
/// 被丢弃时终止进程组，除非在正常退出后解除
///
/// Covers a caller dropping the invocation future mid-run; `kill_on_drop` alone only
/// reaches the group leader.
/// 覆盖调用方在运行中丢弃调用 future 的情况；`kill_on_drop` 只能终止进程组组长。
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!(pgid, "Killing process group of abandoned invocation");
            kill_group(pgid);
        }
    }
}

/// Kill the tree and stop the readers; output captured so far stays in the log buffer
/// 终止进程树并停止读取任务；已捕获的输出保留在日志缓冲区中
async fn abort_after_kill(
    child: &mut Child,
    pgid: Option<u32>,
    stdout: &Option<JoinHandle<StdoutCapture>>,
    stderr: &Option<JoinHandle<String>>,
) {
    kill_process_tree(child, pgid).await;
    if let Some(task) = stdout {
        task.abort();
    }
    if let Some(task) = stderr {
        task.abort();
    }
}

/// JSON string literal, valid in both Python and JavaScript source
/// JSON 字符串字面量，在 Python 与 JavaScript 源码中均合法
fn json_literal(text: &str) -> Result<String, ExecutionFailure> {
    serde_json::to_string(text)
        .map_err(|e| ExecutionFailure::spawn(format!("Failed to encode wrapper input: {}", e)))
}

/// Single-quoted Ruby literal / Ruby 单引号字面量
fn ruby_literal(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Kill process and its children / 终止进程及其子进程
///
/// `pgid` is the leader's pid captured at spawn; it stays valid for the group after the
/// leader has been reaped.
async fn kill_process_tree(child: &mut Child, pgid: Option<u32>) {
    if let Some(pgid) = pgid {
        kill_group(pgid);
    }

    if let Err(e) = child.kill().await {
        debug!(error = %e, "Child already exited");
    }
}

/// SIGKILL a process group / 向进程组发送 SIGKILL
#[cfg(unix)]
fn kill_group(pgid: u32) {
    // SAFETY: signalling a process group we created; no memory is touched
    unsafe {
        libc::killpg(pgid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

fn parse_result(capture: StdoutCapture) -> Value {
    match capture.sentinel_payload {
        Some(payload) => serde_json::from_str(&payload)
            .unwrap_or_else(|_| Value::String(payload.trim().to_string())),
        None => Value::String(capture.raw.trim().to_string()),
    }
}

#[async_trait]
impl RuntimeStrategy for ProcessRuntime {
    fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    async fn run(&self, invocation: Invocation) -> Result<Value, ExecutionFailure> {
        let started = Instant::now();
        let context = &invocation.context;

        let entrypoint = self
            .store
            .entrypoint(&context.function_id, &context.version, self.kind)
            .ok_or_else(|| {
                ExecutionFailure::spawn(format!("Runtime {} has no entrypoint", self.kind))
            })?;
        if !tokio::fs::try_exists(&entrypoint).await.unwrap_or(false) {
            return Err(ExecutionFailure::spawn(format!(
                "Entrypoint not found: {}",
                entrypoint.display()
            )));
        }
        let workdir = entrypoint
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.store.root().to_path_buf());

        // Removed when dropped, on every exit path / 在任何退出路径上被丢弃时删除
        let scratch = tempfile::Builder::new()
            .prefix("edge-dispatch-")
            .tempdir()
            .map_err(|e| ExecutionFailure::spawn(format!("Failed to create wrapper dir: {}", e)))?;
        let wrapper = scratch.path().join(self.wrapper_file());
        let script = self.wrapper_script(&entrypoint, &invocation.event, context)?;
        tokio::fs::write(&wrapper, script)
            .await
            .map_err(|e| ExecutionFailure::spawn(format!("Failed to write wrapper: {}", e)))?;

        let mut child = self
            .build_command(&wrapper, &workdir, context)
            .spawn()
            .map_err(|e| {
                ExecutionFailure::spawn(format!("Failed to spawn {}: {}", self.interpreter, e))
            })?;
        let pgid = child.id();
        let mut group = ProcessGroupGuard { pgid };
        debug!(
            request_id = %context.request_id,
            runtime = %self.kind,
            pid = ?pgid,
            "Spawned interpreter"
        );

        let stdout = child
            .stdout
            .take()
            .map(|s| self.capture_stdout(s, invocation.logs.clone()));
        let stderr = child
            .stderr
            .take()
            .map(|s| Self::capture_stderr(s, invocation.logs.clone()));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(invocation.timeout) => Outcome::TimedOut,
            _ = invocation.cancel.cancelled() => Outcome::Stopped,
        };

        let status = match outcome {
            Outcome::TimedOut => {
                abort_after_kill(&mut child, pgid, &stdout, &stderr).await;
                warn!(
                    request_id = %context.request_id,
                    timeout_ms = invocation.timeout.as_millis() as u64,
                    "Execution timed out, process group killed"
                );
                return Err(ExecutionFailure::timeout(invocation.timeout.as_millis() as u64));
            }
            Outcome::Stopped => {
                abort_after_kill(&mut child, pgid, &stdout, &stderr).await;
                debug!(request_id = %context.request_id, "Execution stopped");
                return Err(ExecutionFailure::cancelled());
            }
            Outcome::Exited(Err(e)) => {
                kill_process_tree(&mut child, pgid).await;
                return Err(ExecutionFailure::runtime(format!(
                    "Failed to wait for {}: {}",
                    self.interpreter, e
                )));
            }
            Outcome::Exited(Ok(status)) => status,
        };

        // Descendants may still hold the pipes; drain within what is left of the deadline
        let remaining = invocation
            .timeout
            .saturating_sub(started.elapsed())
            .max(Duration::from_millis(50));
        let drained = tokio::time::timeout(remaining, async {
            let out = match stdout {
                Some(task) => task.await.unwrap_or_default(),
                None => StdoutCapture::default(),
            };
            let err = match stderr {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            (out, err)
        })
        .await;

        let (out, err) = match drained {
            Ok(streams) => {
                // Both pipes closed; nothing of the invocation is left running
                group.disarm();
                streams
            }
            Err(_) => {
                kill_process_tree(&mut child, pgid).await;
                return Err(ExecutionFailure::timeout(invocation.timeout.as_millis() as u64));
            }
        };

        if status.success() {
            Ok(parse_result(out))
        } else {
            let stderr = err.trim();
            let message = if stderr.is_empty() {
                format!("Process exited with {}", status)
            } else {
                stderr.to_string()
            };
            Err(ExecutionFailure::runtime(message))
        }
    }
}
