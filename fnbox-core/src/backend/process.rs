// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Host-side sandbox driver processes.
//!
//! Both backends drive their sandbox through a local CLI (`docker start -ai`,
//! `ops pkg load`). The driver runs in its own process group so that
//! termination reaches everything it spawned.

use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::bootstrap::{BOOT_MARKER, RESULT_MARKER};
use super::{ProcessSlot, RawOutput, Termination};

/// Run `command` to completion, capturing its output.
///
/// `stdin_payload` is written and the pipe closed; without one stdin is
/// `/dev/null`. Each stream keeps at most `max_output_bytes`; bootstrap
/// marker lines are always kept. The pid is published in `slot` while the
/// process runs.
pub async fn run(
    mut command: Command,
    stdin_payload: Option<Vec<u8>>,
    slot: &ProcessSlot,
    max_output_bytes: usize,
) -> io::Result<RawOutput> {
    command
        .stdin(if stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = command.spawn()?;
    let pid = child.id();
    if let Some(pid) = pid {
        slot.set(pid);
    }

    tracing::debug!(pid = ?pid, "Spawned sandbox driver");

    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("driver stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("driver stderr not captured"))?;

    let feed = async move {
        if let (Some(mut pipe), Some(payload)) = (stdin, stdin_payload) {
            // The handler may exit without reading its input
            if let Err(e) = pipe.write_all(&payload).await {
                tracing::debug!(error = %e, "Driver stdin closed early");
            }
            let _ = pipe.shutdown().await;
        }
    };

    let (_, (out, boot_latency, out_truncated), (err, err_truncated)) = tokio::join!(
        feed,
        read_stdout(stdout, started, max_output_bytes),
        read_capped(stderr, max_output_bytes),
    );

    let status = child.wait().await;
    slot.clear();
    let status = status?;

    Ok(RawOutput {
        stdout: String::from_utf8_lossy(&out).into_owned(),
        stderr: String::from_utf8_lossy(&err).into_owned(),
        exit_code: status.code(),
        boot_latency,
        elapsed: started.elapsed(),
        truncated: out_truncated || err_truncated,
    })
}

/// Captured stdout with bootstrap markers always retained.
struct StdoutCapture {
    buf: Vec<u8>,
    boot: Option<Duration>,
    truncated: bool,
    started: Instant,
    max: usize,
}

impl StdoutCapture {
    fn line(&mut self, line: &[u8]) {
        if self.boot.is_none() && starts_with(line, BOOT_MARKER) {
            self.boot = Some(self.started.elapsed());
        }

        let is_marker = starts_with(line, BOOT_MARKER) || starts_with(line, RESULT_MARKER);
        if self.buf.len() + line.len() <= self.max || (is_marker && line.len() <= self.max) {
            self.buf.extend_from_slice(line);
        } else {
            self.truncated = true;
        }
    }
}

/// Read stdout line by line, noting when the boot marker appears.
///
/// At most `max` bytes of a single line are held; the rest of an overlong
/// line is dropped up to its newline.
async fn read_stdout<R: AsyncRead + Unpin>(
    mut stream: R,
    started: Instant,
    max: usize,
) -> (Vec<u8>, Option<Duration>, bool) {
    let mut capture = StdoutCapture {
        buf: Vec::new(),
        boot: None,
        truncated: false,
        started,
        max,
    };
    let mut chunk = [0u8; 8192];
    let mut line = Vec::new();
    let mut overlong = false;

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "Driver stdout read failed");
                break;
            }
        };

        let mut rest = &chunk[..n];
        while !rest.is_empty() {
            let (piece, ends_line) = match rest.iter().position(|&b| b == b'\n') {
                Some(i) => (&rest[..=i], true),
                None => (rest, false),
            };
            rest = &rest[piece.len()..];

            if !overlong {
                let room = max - line.len();
                if piece.len() > room {
                    line.extend_from_slice(&piece[..room]);
                    // The prefix still tells whether the boot marker arrived
                    if capture.boot.is_none() && starts_with(&line, BOOT_MARKER) {
                        capture.boot = Some(started.elapsed());
                    }
                    capture.truncated = true;
                    overlong = true;
                    line.clear();
                } else {
                    line.extend_from_slice(piece);
                }
            }

            if ends_line {
                if !overlong {
                    capture.line(&line);
                }
                line.clear();
                overlong = false;
            }
        }
    }

    if !line.is_empty() && !overlong {
        capture.line(&line);
    }

    (capture.buf, capture.boot, capture.truncated)
}

async fn read_capped<R: AsyncRead + Unpin>(mut stream: R, max: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = max.saturating_sub(buf.len());
                if n > room {
                    truncated = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                tracing::debug!(error = %e, "Driver stderr read failed");
                break;
            }
        }
    }

    (buf, truncated)
}

/// Consoles may prefix lines with carriage returns or spaces.
fn starts_with(line: &[u8], marker: &str) -> bool {
    let trimmed = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&line[..0], |start| &line[start..]);
    trimmed.starts_with(marker.as_bytes())
}

/// Signal the driver's process group. Returns false if nothing was running.
pub fn signal_group(slot: &ProcessSlot, mode: Termination) -> bool {
    let Some(pid) = slot.get() else {
        return false;
    };

    let signal = match mode {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };

    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => {
            tracing::debug!(pid = pid, signal = %signal, "Signalled driver process group");
            true
        }
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(pid = pid, signal = %signal, error = %e, "Failed to signal driver");
            false
        }
    }
}
