use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;
use wait_timeout::ChildExt;

use crate::exception::{ExcKind, SimpleError};
use crate::polyglot::callback::{CallbackHost, CALL_SENTINEL};
use crate::polyglot::payload::{self, Payload};

/// Outcome of a foreign process run.
#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// JSON text following the result sentinel, if the wrapper emitted one.
    pub result_json: Option<String>,
}

enum IoEvent {
    Line(String),
    Eof,
}

fn spawn(cmd: &mut Command) -> Result<Child, SimpleError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            SimpleError::new(
                ExcKind::PolyglotError,
                format!("failed to launch `{:?}`: {err}", cmd.get_program()),
            )
        })
}

fn reap(mut child: Child, remaining: Duration) -> (Option<i32>, bool) {
    match child.wait_timeout(remaining) {
        Ok(Some(status)) => (status.code(), false),
        Ok(None) | Err(_) => {
            // exceeded the budget: terminate forcibly
            let _ = child.kill();
            let _ = child.wait();
            (None, true)
        }
    }
}

/// Runs a command to completion, collecting stdout and stderr, enforcing
/// the timeout by killing the process.
pub fn run_simple(
    mut cmd: Command,
    stdin_data: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<ProcessOutput, SimpleError> {
    let mut child = spawn(&mut cmd)?;
    let mut stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let writer = stdin_data.map(|data| {
        let mut pipe = stdin.take();
        thread::spawn(move || {
            if let Some(pipe) = pipe.as_mut() {
                let _ = pipe.write_all(&data);
            }
        })
    });
    drop(stdin);

    let out_reader = stdout.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });
    let err_reader = stderr.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });

    let (status, timed_out) = reap(child, timeout);
    if let Some(handle) = writer {
        let _ = handle.join();
    }
    let stdout = out_reader
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default();
    let stderr = err_reader
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default();

    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        timed_out,
        result_json: None,
    })
}

/// Runs an interpreted-language wrapper that speaks the line protocol:
/// ordinary stdout lines pass through, `__NAAB_CALL__{json}` lines request
/// a host callback (answered on the child's stdin), and
/// `<result_sentinel>{json}` carries the block's return value.
pub fn run_protocol(
    mut cmd: Command,
    result_sentinel: &str,
    timeout: Duration,
    host: &mut dyn CallbackHost,
) -> Result<ProcessOutput, SimpleError> {
    let mut child = spawn(&mut cmd)?;
    let mut stdin = child.stdin.take();
    let stdout = child.stdout.take().ok_or_else(|| {
        SimpleError::new(ExcKind::PolyglotError, "child stdout unavailable")
    })?;
    let stderr = child.stderr.take();

    let (tx, rx) = mpsc::channel();
    let reader = thread::spawn(move || {
        let lines = BufReader::new(stdout).lines();
        for line in lines {
            let Ok(line) = line else { break };
            if tx.send(IoEvent::Line(line)).is_err() {
                return;
            }
        }
        let _ = tx.send(IoEvent::Eof);
    });
    let err_reader = stderr.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });

    let deadline = Instant::now() + timeout;
    let mut output = ProcessOutput::default();
    let mut timed_out = false;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            timed_out = true;
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok(IoEvent::Line(line)) => {
                // user output without a trailing newline can leave a
                // sentinel glued to the same line; split on it anywhere
                if let Some(pos) = line.find(CALL_SENTINEL) {
                    output.stdout.push_str(&line[..pos]);
                    handle_call(&line[pos + CALL_SENTINEL.len()..], stdin.as_mut(), host);
                } else if let Some(pos) = line.find(result_sentinel) {
                    output.stdout.push_str(&line[..pos]);
                    output.result_json = Some(line[pos + result_sentinel.len()..].to_owned());
                } else {
                    output.passthrough_line(&line);
                }
            }
            Ok(IoEvent::Eof) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                timed_out = true;
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    if timed_out {
        let _ = child.kill();
    }
    let remaining = if timed_out {
        Duration::from_secs(0)
    } else {
        deadline.saturating_duration_since(Instant::now())
    };
    let (status, reap_timed_out) = reap(child, remaining.max(Duration::from_millis(100)));
    output.status = status;
    output.timed_out = timed_out || reap_timed_out;
    drop(stdin);
    let _ = reader.join();
    output.stderr = err_reader
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default();
    Ok(output)
}

impl ProcessOutput {
    fn passthrough_line(&mut self, line: &str) {
        self.stdout.push_str(line);
        self.stdout.push('\n');
    }
}

fn handle_call(
    request: &str,
    stdin: Option<&mut std::process::ChildStdin>,
    host: &mut dyn CallbackHost,
) {
    let reply = match serde_json::from_str::<serde_json::Value>(request) {
        Ok(json) => {
            let id = json
                .get("id")
                .and_then(serde_json::Value::as_u64)
                .and_then(|id| u32::try_from(id).ok());
            let args: Vec<Payload> = json
                .get("args")
                .and_then(serde_json::Value::as_array)
                .map(|items| items.iter().map(|j| payload::from_json(j, "host")).collect())
                .unwrap_or_default();
            match id {
                Some(id) => match host.invoke(id, args) {
                    Ok(value) => serde_json::json!({ "value": payload::to_json(&value) }),
                    Err(message) => serde_json::json!({ "error": message }),
                },
                None => serde_json::json!({ "error": "malformed callback request" }),
            }
        }
        Err(err) => serde_json::json!({ "error": format!("malformed callback request: {err}") }),
    };
    let Some(stdin) = stdin else {
        warn!("callback reply dropped: child stdin closed");
        return;
    };
    let mut line = reply.to_string();
    line.push('\n');
    if stdin.write_all(line.as_bytes()).and_then(|()| stdin.flush()).is_err() {
        warn!("callback reply dropped: child stdin write failed");
    }
}
