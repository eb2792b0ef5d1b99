//! Drives a coding-agent subprocess over a line-delimited JSON-RPC 2.0
//! dialect (the Agent Client Protocol family: `gemini --experimental-acp`,
//! `codex --mode acp`, and a local `claude` CLI speaking the same wire
//! shape). This is the one component where a hung or chatty child process
//! can wedge the whole pipeline, so every blocking read is bounded.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use specq_types::AgentRun;

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const PROTOCOL_VERSION: &str = "2024-acp-1";

/// Capability port: run one turn of a coding agent in `cwd` and report
/// what happened. Never fails outward — a missing executable or a
/// protocol error becomes `AgentRun { success: false, .. }`.
pub trait Agent {
    fn run(&self, prompt: &str, cwd: &Path, system_prompt: Option<&str>) -> AgentRun;
}

impl Agent for Box<dyn Agent> {
    fn run(&self, prompt: &str, cwd: &Path, system_prompt: Option<&str>) -> AgentRun {
        (**self).run(prompt, cwd, system_prompt)
    }
}

/// One ACP-speaking subprocess, identified by its program name and a
/// fixed argument template.
pub struct AcpAgent {
    program: String,
    args: Vec<String>,
    auto_approve_permissions: bool,
    initialize_timeout: Duration,
    shutdown_timeout: Duration,
}

impl AcpAgent {
    pub fn gemini(model: Option<&str>) -> Self {
        Self::new("gemini", "--experimental-acp", model)
    }

    pub fn codex(model: Option<&str>) -> Self {
        let mut args = vec!["--mode".to_string(), "acp".to_string()];
        if let Some(m) = model {
            args.push("--model".to_string());
            args.push(m.to_string());
        }
        Self {
            program: "codex".to_string(),
            args,
            auto_approve_permissions: true,
            initialize_timeout: INITIALIZE_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }

    /// A local `claude` CLI driven over the same stdio-ACP transport as
    /// `gemini`/`codex` — no separate wire protocol, just a different
    /// program on `PATH`.
    pub fn claude_code(model: Option<&str>) -> Self {
        let mut args = Vec::new();
        if let Some(m) = model {
            args.push("--model".to_string());
            args.push(m.to_string());
        }
        Self {
            program: "claude".to_string(),
            args,
            auto_approve_permissions: true,
            initialize_timeout: INITIALIZE_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }

    fn new(program: &str, mode_flag: &str, model: Option<&str>) -> Self {
        let mut args = vec![mode_flag.to_string()];
        if let Some(m) = model {
            args.push("--model".to_string());
            args.push(m.to_string());
        }
        Self {
            program: program.to_string(),
            args,
            auto_approve_permissions: true,
            initialize_timeout: INITIALIZE_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeouts(mut self, initialize: Duration, shutdown: Duration) -> Self {
        self.initialize_timeout = initialize;
        self.shutdown_timeout = shutdown;
        self
    }

    fn try_run(
        &self,
        prompt: &str,
        cwd: &Path,
        system_prompt: Option<&str>,
    ) -> Result<AgentRun, String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                format!(
                    "failed to launch `{}`: {e} (install it and put it on PATH)",
                    self.program
                )
            })?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stderr_drain = thread::spawn(move || {
            let mut sink = Vec::new();
            let _ = BufReader::new(stderr).read_to_end(&mut sink);
        });

        let (tx, rx) = mpsc::channel::<String>();
        let reader = thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(l) => {
                        if tx.send(l).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let drive_result = self.drive_protocol(&mut stdin, &rx, prompt, system_prompt);

        drop(stdin);
        let exit_status = wait_with_timeout(&mut child, self.shutdown_timeout);
        let _ = reader.join();
        let _ = stderr_drain.join();

        let partial = drive_result?;

        let exit_code = exit_status.and_then(|s| s.code());
        let success = match exit_code {
            Some(code) if code != 0 && !partial.done_received => false,
            _ => true,
        };

        Ok(AgentRun {
            success,
            output: if success {
                partial.output
            } else {
                format!(
                    "{} exited with code {} before completion",
                    self.program,
                    exit_code.map(|c| c.to_string()).unwrap_or_else(|| "?".into())
                )
            },
            turns: partial.turns,
            tokens_in: partial.tokens_in,
            tokens_out: partial.tokens_out,
            duration_sec: 0.0,
        })
    }

    fn drive_protocol(
        &self,
        stdin: &mut impl Write,
        rx: &Receiver<String>,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<PartialRun, String> {
        send(
            stdin,
            &json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "specq"},
                },
            }),
        )?;

        let deadline = Instant::now() + self.initialize_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err("timed out waiting for initialize response".to_string());
            }
            let line = match rx.recv_timeout(remaining) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => {
                    return Err("timed out waiting for initialize response".to_string())
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err("child exited before responding to initialize".to_string())
                }
            };
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue; // tolerate banner text on the first line
            };
            if value.get("id").and_then(Value::as_i64) == Some(1) {
                if let Some(error) = value.get("error") {
                    return Err(format!("initialize failed: {error}"));
                }
                break;
            }
        }

        send(stdin, &json!({"jsonrpc": "2.0", "method": "initialized"}))?;

        let mut input = Vec::new();
        if let Some(sys) = system_prompt {
            input.push(json!({
                "role": "system",
                "content": [{"type": "text", "text": sys}],
            }));
        }
        input.push(json!({
            "role": "user",
            "content": [{"type": "text", "text": prompt}],
        }));
        const RUN_ID: i64 = 2;
        send(
            stdin,
            &json!({
                "jsonrpc": "2.0",
                "id": RUN_ID,
                "method": "agents/run",
                "params": {"input": input},
            }),
        )?;

        let mut partial = PartialRun::default();
        loop {
            let line = match rx.recv() {
                Ok(line) => line,
                Err(_) => break, // EOF before agents/done: soft exit
            };
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue;
            };

            if let Some(method) = value.get("method").and_then(Value::as_str) {
                match method {
                    "permissions/requested" if self.auto_approve_permissions => {
                        if let Some(req_id) = value
                            .pointer("/params/permissionsRequestId")
                            .cloned()
                        {
                            send(
                                stdin,
                                &json!({
                                    "jsonrpc": "2.0",
                                    "method": "permissions/granted",
                                    "params": {"permissionsRequestId": req_id},
                                }),
                            )?;
                        }
                    }
                    "permissions/requested" => {}
                    "agents/textDelta" => {
                        if value.pointer("/params/delta/type").and_then(Value::as_str)
                            == Some("text")
                        {
                            if let Some(text) =
                                value.pointer("/params/delta/text").and_then(Value::as_str)
                            {
                                partial.output.push_str(text);
                            }
                        }
                    }
                    "agents/turnDone" => partial.turns += 1,
                    "agents/done" => {
                        partial.done_received = true;
                        break;
                    }
                    _ => {}
                }
                continue;
            }

            if value.get("id").and_then(Value::as_i64) == Some(RUN_ID) {
                if let Some(error) = value.get("error") {
                    let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
                    let message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    return Err(format!("agent run failed ({code}): {message}"));
                }
                if let Some(result) = value.get("result") {
                    if partial.output.is_empty() {
                        partial.output = extract_text(result);
                    }
                    let (tokens_in, tokens_out) = extract_usage(result);
                    partial.tokens_in = tokens_in;
                    partial.tokens_out = tokens_out;
                }
            }
        }

        Ok(partial)
    }
}

impl Agent for AcpAgent {
    fn run(&self, prompt: &str, cwd: &Path, system_prompt: Option<&str>) -> AgentRun {
        let start = Instant::now();
        let mut run = match self.try_run(prompt, cwd, system_prompt) {
            Ok(run) => run,
            Err(message) => AgentRun {
                success: false,
                output: message,
                turns: 0,
                tokens_in: 0,
                tokens_out: 0,
                duration_sec: 0.0,
            },
        };
        run.duration_sec = start.elapsed().as_secs_f64();
        run
    }
}

#[derive(Default)]
struct PartialRun {
    output: String,
    turns: u32,
    tokens_in: u64,
    tokens_out: u64,
    done_received: bool,
}

fn send(stdin: &mut impl Write, value: &Value) -> Result<(), String> {
    writeln!(stdin, "{value}").map_err(|e| format!("failed writing to child stdin: {e}"))?;
    stdin
        .flush()
        .map_err(|e| format!("failed flushing child stdin: {e}"))
}

fn extract_text(result: &Value) -> String {
    let Some(entries) = result.get("output").and_then(Value::as_array) else {
        return String::new();
    };
    entries
        .iter()
        .filter_map(|entry| entry.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("")
}

fn extract_usage(result: &Value) -> (u64, u64) {
    let usage = result.get("usage");
    let input = usage
        .and_then(|u| u.get("input_tokens").or_else(|| u.get("tokens_in")))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output = usage
        .and_then(|u| u.get("output_tokens").or_else(|| u.get("tokens_out")))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    (input, output)
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    return child.wait().ok();
                }
                thread::sleep(Duration::from_millis(25));
            }
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[cfg(unix)]
    fn write_fake_agent(dir: &Path, name: &str, script: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[cfg(windows)]
    fn write_fake_agent(dir: &Path, name: &str, script: &str) -> std::path::PathBuf {
        let path = dir.join(format!("{name}.cmd"));
        fs::write(&path, format!("@echo off\r\n{script}\r\n")).unwrap();
        path
    }

    fn prepend_to_path(bin_dir: &Path) -> String {
        let old = std::env::var("PATH").unwrap_or_default();
        format!("{}{}{}", bin_dir.display(), if cfg!(windows) { ";" } else { ":" }, old)
    }

    #[cfg(unix)]
    const HAPPY_PATH_SCRIPT: &str = r#"
read -r _line1
echo '{"jsonrpc":"2.0","id":1,"result":{}}'
read -r _line2
read -r _line3
echo '{"jsonrpc":"2.0","method":"agents/textDelta","params":{"delta":{"type":"text","text":"Hello"}}}'
echo '{"jsonrpc":"2.0","method":"agents/textDelta","params":{"delta":{"type":"text","text":" world"}}}'
echo '{"jsonrpc":"2.0","method":"agents/turnDone"}'
echo '{"jsonrpc":"2.0","method":"agents/done"}'
"#;

    #[test]
    #[cfg(unix)]
    fn happy_path_accumulates_text_deltas_and_turns() {
        let dir = tempdir().unwrap();
        write_fake_agent(dir.path(), "fakeagent", HAPPY_PATH_SCRIPT);
        let path = prepend_to_path(dir.path());
        temp_env::with_var("PATH", Some(path), || {
            let agent = AcpAgent {
                program: "fakeagent".to_string(),
                args: vec![],
                auto_approve_permissions: true,
                initialize_timeout: Duration::from_secs(5),
                shutdown_timeout: Duration::from_secs(5),
            };
            let run = agent.run("do the thing", dir.path(), None);
            assert!(run.success);
            assert_eq!(run.output, "Hello world");
            assert_eq!(run.turns, 1);
        });
    }

    #[test]
    fn missing_executable_reports_install_hint() {
        let agent = AcpAgent {
            program: "specq-definitely-not-a-real-binary".to_string(),
            args: vec![],
            auto_approve_permissions: true,
            initialize_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
        };
        let dir = tempdir().unwrap();
        let run = agent.run("hi", dir.path(), None);
        assert!(!run.success);
        assert!(run.output.contains("PATH"));
    }

    #[test]
    #[cfg(unix)]
    fn initialize_error_response_fails_run() {
        let dir = tempdir().unwrap();
        let script = r#"
read -r _line1
echo '{"jsonrpc":"2.0","id":1,"error":{"code":-1,"message":"bad client"}}'
"#;
        write_fake_agent(dir.path(), "fakeagent", script);
        let path = prepend_to_path(dir.path());
        temp_env::with_var("PATH", Some(path), || {
            let agent = AcpAgent {
                program: "fakeagent".to_string(),
                args: vec![],
                auto_approve_permissions: true,
                initialize_timeout: Duration::from_secs(5),
                shutdown_timeout: Duration::from_secs(5),
            };
            let run = agent.run("hi", dir.path(), None);
            assert!(!run.success);
            assert!(run.output.contains("bad client"));
        });
    }

    #[test]
    #[cfg(unix)]
    fn permission_grant_echoes_permissions_request_id_field() {
        let dir = tempdir().unwrap();
        let script = r#"
read -r _line1
echo '{"jsonrpc":"2.0","id":1,"result":{}}'
read -r _line2
read -r _line3
echo '{"jsonrpc":"2.0","method":"permissions/requested","params":{"permissionsRequestId":"req-1"}}'
read -r grant
case "$grant" in
  *permissionsRequestId*req-1*) echo '{"jsonrpc":"2.0","method":"agents/textDelta","params":{"delta":{"type":"text","text":"granted"}}}' ;;
  *) echo '{"jsonrpc":"2.0","method":"agents/textDelta","params":{"delta":{"type":"text","text":"denied"}}}' ;;
esac
echo '{"jsonrpc":"2.0","method":"agents/done"}'
"#;
        write_fake_agent(dir.path(), "fakeagent", script);
        let path = prepend_to_path(dir.path());
        temp_env::with_var("PATH", Some(path), || {
            let agent = AcpAgent {
                program: "fakeagent".to_string(),
                args: vec![],
                auto_approve_permissions: true,
                initialize_timeout: Duration::from_secs(5),
                shutdown_timeout: Duration::from_secs(5),
            };
            let run = agent.run("hi", dir.path(), None);
            assert!(run.success);
            assert_eq!(run.output, "granted");
        });
    }

    #[test]
    #[cfg(unix)]
    fn result_only_response_extracts_text_from_nested_output_content() {
        let dir = tempdir().unwrap();
        let script = r#"
read -r _line1
echo '{"jsonrpc":"2.0","id":1,"result":{}}'
read -r _line2
read -r _line3
echo '{"jsonrpc":"2.0","id":2,"result":{"output":[{"content":[{"type":"text","text":"Hello"},{"type":"text","text":" world"}]}]}}'
echo '{"jsonrpc":"2.0","method":"agents/done"}'
"#;
        write_fake_agent(dir.path(), "fakeagent", script);
        let path = prepend_to_path(dir.path());
        temp_env::with_var("PATH", Some(path), || {
            let agent = AcpAgent {
                program: "fakeagent".to_string(),
                args: vec![],
                auto_approve_permissions: true,
                initialize_timeout: Duration::from_secs(5),
                shutdown_timeout: Duration::from_secs(5),
            };
            let run = agent.run("hi", dir.path(), None);
            assert!(run.success);
            assert_eq!(run.output, "Hello world");
        });
    }

    #[test]
    #[cfg(unix)]
    fn eof_without_done_but_zero_exit_is_success() {
        let dir = tempdir().unwrap();
        let script = r#"
read -r _line1
echo '{"jsonrpc":"2.0","id":1,"result":{}}'
read -r _line2
read -r _line3
echo '{"jsonrpc":"2.0","method":"agents/textDelta","params":{"delta":{"type":"text","text":"partial"}}}'
"#;
        write_fake_agent(dir.path(), "fakeagent", script);
        let path = prepend_to_path(dir.path());
        temp_env::with_var("PATH", Some(path), || {
            let agent = AcpAgent {
                program: "fakeagent".to_string(),
                args: vec![],
                auto_approve_permissions: true,
                initialize_timeout: Duration::from_secs(5),
                shutdown_timeout: Duration::from_secs(5),
            };
            let run = agent.run("hi", dir.path(), None);
            assert!(run.success);
            assert_eq!(run.output, "partial");
        });
    }

    #[test]
    #[cfg(unix)]
    fn nonzero_exit_without_done_is_failure() {
        let dir = tempdir().unwrap();
        let script = r#"
read -r _line1
echo '{"jsonrpc":"2.0","id":1,"result":{}}'
read -r _line2
read -r _line3
exit 7
"#;
        write_fake_agent(dir.path(), "fakeagent", script);
        let path = prepend_to_path(dir.path());
        temp_env::with_var("PATH", Some(path), || {
            let agent = AcpAgent {
                program: "fakeagent".to_string(),
                args: vec![],
                auto_approve_permissions: true,
                initialize_timeout: Duration::from_secs(5),
                shutdown_timeout: Duration::from_secs(5),
            };
            let run = agent.run("hi", dir.path(), None);
            assert!(!run.success);
        });
    }

    #[test]
    fn gemini_codex_claude_code_constructors_set_program_and_model_flag() {
        let g = AcpAgent::gemini(Some("gemini-2.5-pro")).with_timeouts(
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert_eq!(g.program, "gemini");
        assert!(g.args.contains(&"--experimental-acp".to_string()));
        assert!(g.args.contains(&"gemini-2.5-pro".to_string()));

        let c = AcpAgent::codex(None);
        assert_eq!(c.program, "codex");
        assert_eq!(c.args, vec!["--mode".to_string(), "acp".to_string()]);

        let cc = AcpAgent::claude_code(Some("opus"));
        assert_eq!(cc.program, "claude");
        assert!(cc.args.contains(&"opus".to_string()));
    }
}
