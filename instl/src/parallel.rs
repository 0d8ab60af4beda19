// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Parallel runner (component H): runs a flat list of opaque sub-commands,
//! partitioned by the `wait` barrier, with process-group tree-kill on
//! abort-file disappearance or a terminating signal.

use std::{
    os::unix::process::{CommandExt, ExitStatusExt},
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
    sync::Arc,
    time::Duration,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use thiserror::Error;

/// Exit status when a sub-process could not even be launched.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = 31;

/// Map a failed [`run`] into the process exit code it should produce.
pub fn exit_code_for_error(error: &Error) -> i32 {
    match error {
        Error::Launch(..) | Error::Wait(_) => LAUNCH_FAILURE_EXIT_CODE,
        Error::Aborted => signal_exit_code(),
    }
}

/// A single shell or argv command in the flat command list.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub shell: bool,
}

/// An element of the flat command list: a command, or the `wait` barrier.
#[derive(Debug, Clone)]
pub enum Token {
    Cmd(CommandSpec),
    Wait,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to launch {0:?}: {1}")]
    Launch(CommandSpec, std::io::Error),
    #[error("waiting for child failed: {0}")]
    Wait(std::io::Error),
    #[error("aborted: abort file vanished or a terminating signal was delivered")]
    Aborted,
}

/// Outcome of one partition: every command's exit status, in launch order.
#[derive(Debug)]
struct PartitionResult {
    exit_codes: Vec<i32>,
}

/// Shared registry of currently-running process groups, consulted by the
/// abort-file watcher and signal handlers to perform a tree-kill.
#[derive(Default)]
struct Tracker {
    pgids: std::sync::Mutex<Vec<i32>>,
    aborted: AtomicBool,
    /// Set once [`run`] returns, so the monitor thread can stop polling.
    done: AtomicBool,
}

impl Tracker {
    fn track(&self, pgid: i32) {
        self.pgids.lock().unwrap().push(pgid);
    }

    fn untrack(&self, pgid: i32) {
        self.pgids.lock().unwrap().retain(|&p| p != pgid);
    }

    fn killall(&self) {
        for pgid in self.pgids.lock().unwrap().drain(..) {
            let _ = kill(Pid::from_raw(-pgid), Signal::SIGTERM);
        }
    }
}

static RECEIVED_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signum: nix::libc::c_int) {
    RECEIVED_SIGNAL.store(signum, Ordering::SeqCst);
}

/// Partition `tokens` on [`Token::Wait`] and run each partition to
/// completion before starting the next. Returns the first failing
/// partition's max child exit code, or `0` if every command exited zero.
pub fn run(tokens: &[Token], abort_file: Option<PathBuf>) -> Result<i32, Error> {
    let tracker = Arc::new(Tracker::default());
    let _signal_guards = install_signal_handlers();

    let watcher = spawn_monitor(abort_file, tracker.clone());

    let partitions = partition(tokens);
    let mut final_code = 0;

    'partitions: for partition in partitions {
        let result = run_partition(&partition, &tracker)?;
        for code in result.exit_codes {
            if code != 0 {
                final_code = code;
                break 'partitions;
            }
        }
        if tracker.aborted.load(Ordering::SeqCst) {
            final_code = signal_exit_code();
            break;
        }
    }

    tracker.done.store(true, Ordering::SeqCst);
    watcher.join().ok();

    if tracker.aborted.load(Ordering::SeqCst) {
        return Err(Error::Aborted);
    }
    Ok(final_code)
}

fn partition(tokens: &[Token]) -> Vec<Vec<CommandSpec>> {
    let mut partitions = vec![Vec::new()];
    for token in tokens {
        match token {
            Token::Cmd(spec) => partitions.last_mut().unwrap().push(spec.clone()),
            Token::Wait => partitions.push(Vec::new()),
        }
    }
    partitions.retain(|p| !p.is_empty());
    partitions
}

fn run_partition(commands: &[CommandSpec], tracker: &Arc<Tracker>) -> Result<PartitionResult, Error> {
    let mut children: Vec<(Child, i32)> = Vec::with_capacity(commands.len());

    for spec in commands {
        let mut command = build_command(spec);
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }
        let child = command.spawn().map_err(|e| Error::Launch(spec.clone(), e))?;
        let pgid = child.id() as i32;
        tracker.track(pgid);
        children.push((child, pgid));
    }

    let mut exit_codes = Vec::with_capacity(children.len());
    for (mut child, pgid) in children {
        let status = child.wait().map_err(Error::Wait)?;
        tracker.untrack(pgid);
        if tracker.aborted.load(Ordering::SeqCst) {
            break;
        }
        exit_codes.push(status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0)));
    }

    Ok(PartitionResult { exit_codes })
}

fn build_command(spec: &CommandSpec) -> Command {
    if spec.shell {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(&spec.program);
        command.stdout(Stdio::piped());
        command
    } else {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        command.stdout(Stdio::piped());
        command
    }
}

/// Poll at 1 Hz for either the configured abort file vanishing or a
/// terminating signal having been recorded, and tree-kill on either. When
/// `abort_file` is set this takes over stdout draining duties too (per the
/// source, the two share one monitor thread); a real stdout drain is left
/// to the caller's own child-handling, this only owns the abort decision.
fn spawn_monitor(abort_file: Option<PathBuf>, tracker: Arc<Tracker>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let watch_file = abort_file.filter(|p| p.exists());
        loop {
            if tracker.done.load(Ordering::SeqCst) {
                return;
            }
            if RECEIVED_SIGNAL.load(Ordering::SeqCst) != 0 {
                tracker.aborted.store(true, Ordering::SeqCst);
                tracker.killall();
                return;
            }
            if let Some(path) = &watch_file {
                if !path.exists() {
                    tracker.aborted.store(true, Ordering::SeqCst);
                    tracker.killall();
                    return;
                }
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    })
}

fn signal_exit_code() -> i32 {
    let signum = RECEIVED_SIGNAL.load(Ordering::SeqCst);
    if signum != 0 {
        128 + signum
    } else {
        1
    }
}

/// Install handlers for the signals the parallel runner must react to by
/// tree-killing its tracked children before the process exits. Returns a
/// guard restoring the previous handlers on drop.
fn install_signal_handlers() -> crate::signal::Guard {
    use nix::sys::signal::Signal::*;
    crate::signal::install(
        [SIGABRT, SIGFPE, SIGILL, SIGINT, SIGSEGV, SIGTERM],
        record_signal,
    )
    .expect("install signal handlers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_split_on_wait() {
        let tokens = vec![
            Token::Cmd(CommandSpec { program: "true".into(), args: vec![], shell: false }),
            Token::Cmd(CommandSpec { program: "true".into(), args: vec![], shell: false }),
            Token::Wait,
            Token::Cmd(CommandSpec { program: "true".into(), args: vec![], shell: false }),
        ];
        let partitions = partition(&tokens);
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].len(), 2);
        assert_eq!(partitions[1].len(), 1);
    }

    #[test]
    fn successful_partition_run_returns_zero() {
        let tokens = vec![Token::Cmd(CommandSpec { program: "true".into(), args: vec![], shell: false })];
        let code = run(&tokens, None).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn failing_command_stops_before_next_partition() {
        let tokens = vec![
            Token::Cmd(CommandSpec { program: "false".into(), args: vec![], shell: false }),
            Token::Wait,
            Token::Cmd(CommandSpec { program: "touch".into(), args: vec!["/tmp/instl-parallel-test-marker-should-not-exist".into()], shell: false }),
        ];
        let marker = std::path::Path::new("/tmp/instl-parallel-test-marker-should-not-exist");
        let _ = std::fs::remove_file(marker);
        let code = run(&tokens, None).unwrap();
        assert_ne!(code, 0);
        assert!(!marker.exists());
    }
}
