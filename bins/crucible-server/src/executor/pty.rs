/// PTY supervision loop - the hot path
///
/// **Core Responsibility:**
/// Run one sandboxed command attached to a fresh pseudoterminal, streaming
/// every output chunk to a callback, feeding queued input bytes back to the
/// terminal, and enforcing the wall-clock limit with a group kill.
///
/// **Loop shape (one tick ≈ the poll interval):**
/// 1. Reap check: if the child exited, leave the loop.
/// 2. Deadline check: wall-clock breach or an upstream cancel flag sends
///    SIGTERM to the process group, waits a grace interval, then SIGKILL.
/// 3. Poll the master side; read up to one chunk and invoke the callback.
/// 4. Drain a bounded number of input entries onto the master side.
///
/// The child runs in its own session so the whole process group can be
/// signalled; stderr is merged into the stream by the terminal itself.
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::Termios;
use nix::unistd::Pid;
use tracing::debug;

use crucible_common::config::Settings;

use super::ExecutorError;

/// Fixed initial terminal window.
const TERM_ROWS: u16 = 24;
const TERM_COLS: u16 = 80;

/// How long a SIGTERM'd group gets before SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// How long to keep draining the master after the child exits.
const DRAIN_DEADLINE: Duration = Duration::from_millis(200);

/// Input entries forwarded per tick; keeps one chatty client from starving
/// the output side of the loop.
const MAX_INPUT_PER_TICK: usize = 32;

/// Exit code reported for a wall-clock kill.
pub const TIMEOUT_EXIT_CODE: i32 = -9;

pub struct PtyOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
    pub output: Vec<u8>,
    pub execution_time: f64,
}

/// Run `argv` under a fresh PTY inside `workdir` until exit, timeout, or
/// cancellation. Blocks the calling thread for the whole run.
pub fn supervise(
    argv: &[String],
    workdir: &Path,
    settings: &Settings,
    mut on_output: impl FnMut(&[u8]),
    input: &Receiver<Vec<u8>>,
    cancel: &Arc<AtomicBool>,
) -> Result<PtyOutcome, ExecutorError> {
    let winsize = Winsize {
        ws_row: TERM_ROWS,
        ws_col: TERM_COLS,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = openpty(Some(&winsize), None::<&Termios>).map_err(ExecutorError::Pty)?;

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .current_dir(workdir)
        .stdin(Stdio::from(
            pty.slave.try_clone().map_err(ExecutorError::Workspace)?,
        ))
        .stdout(Stdio::from(
            pty.slave.try_clone().map_err(ExecutorError::Workspace)?,
        ))
        .stderr(Stdio::from(pty.slave));

    // New session: makes the child the leader of its own process group and
    // lets the slave become its controlling terminal.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            // Best-effort; the child still has the slave on fds 0-2.
            libc::ioctl(0, libc::TIOCSCTTY as _, 0);
            Ok(())
        });
    }

    let start = Instant::now();
    let mut child = command.spawn().map_err(ExecutorError::Spawn)?;
    let pgid = Pid::from_raw(child.id() as i32);

    let mut master = File::from(pty.master);
    set_nonblocking(&master)?;

    let poll_interval = PollTimeout::from(settings.pty_poll_interval_ms.min(1000) as u16);
    let timeout = Duration::from_secs(settings.execution_timeout_secs);
    let mut chunk = vec![0u8; settings.pty_chunk_bytes.max(1)];
    let mut captured: Vec<u8> = Vec::new();
    let mut eof = false;
    let mut timed_out = false;

    let status = loop {
        if let Some(status) = child.try_wait().map_err(ExecutorError::Supervision)? {
            break status;
        }

        if start.elapsed() >= timeout {
            timed_out = true;
            break terminate_group(&mut child, pgid)?;
        }
        if cancel.load(Ordering::Relaxed) {
            debug!("Cancellation flag observed, stopping process group");
            break terminate_group(&mut child, pgid)?;
        }

        if !eof {
            eof = pump_output(
                &mut master,
                &mut chunk,
                &mut captured,
                &mut on_output,
                poll_interval,
            )?;
        } else {
            thread::sleep(Duration::from_millis(settings.pty_poll_interval_ms));
        }

        drain_input(input, &mut master);
    };

    // The child may have exited with output still buffered on the master.
    let drain_until = Instant::now() + DRAIN_DEADLINE;
    while !eof && Instant::now() < drain_until {
        eof = pump_output(
            &mut master,
            &mut chunk,
            &mut captured,
            &mut on_output,
            poll_interval,
        )?;
    }

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        exit_code_of(status)
    };

    Ok(PtyOutcome {
        exit_code,
        timed_out,
        output: captured,
        execution_time: start.elapsed().as_secs_f64(),
    })
}

/// One poll-and-read step. Returns true once the slave side is gone.
fn pump_output(
    master: &mut File,
    chunk: &mut [u8],
    captured: &mut Vec<u8>,
    on_output: &mut impl FnMut(&[u8]),
    interval: PollTimeout,
) -> Result<bool, ExecutorError> {
    let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
    let ready = match poll(&mut fds, interval) {
        Ok(n) => n,
        Err(nix::errno::Errno::EINTR) => return Ok(false),
        Err(e) => {
            return Err(ExecutorError::Supervision(io::Error::from_raw_os_error(
                e as i32,
            )))
        }
    };
    if ready == 0 {
        return Ok(false);
    }

    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
    if !revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
        return Ok(false);
    }

    match master.read(chunk) {
        Ok(0) => Ok(true),
        Ok(n) => {
            captured.extend_from_slice(&chunk[..n]);
            on_output(&chunk[..n]);
            Ok(false)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            Ok(revents.contains(PollFlags::POLLHUP))
        }
        // EIO from a PTY master means every slave descriptor is closed.
        Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(true),
        Err(e) => Err(ExecutorError::Supervision(e)),
    }
}

fn drain_input(input: &Receiver<Vec<u8>>, master: &mut File) {
    for _ in 0..MAX_INPUT_PER_TICK {
        match input.try_recv() {
            Ok(bytes) => {
                if master.write_all(&bytes).is_err() {
                    break;
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
}

/// SIGTERM the group, give it a grace interval, then SIGKILL and reap.
fn terminate_group(child: &mut Child, pgid: Pid) -> Result<ExitStatus, ExecutorError> {
    let _ = killpg(pgid, Signal::SIGTERM);
    let deadline = Instant::now() + KILL_GRACE;
    loop {
        if let Some(status) = child.try_wait().map_err(ExecutorError::Supervision)? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let _ = killpg(pgid, Signal::SIGKILL);
    child.wait().map_err(ExecutorError::Supervision)
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(1))
}

fn set_nonblocking(master: &File) -> Result<(), ExecutorError> {
    use std::os::fd::AsRawFd;
    let fd = master.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(ExecutorError::Supervision(io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(ExecutorError::Supervision(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn test_settings() -> Settings {
        Settings::default()
    }

    fn run_sh(
        script: &str,
        settings: &Settings,
        input: Receiver<Vec<u8>>,
        cancel: Arc<AtomicBool>,
    ) -> (PtyOutcome, Vec<u8>) {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ];
        let workdir = tempfile::tempdir().unwrap();
        let mut streamed = Vec::new();
        let outcome = supervise(
            &argv,
            workdir.path(),
            settings,
            |chunk| streamed.extend_from_slice(chunk),
            &input,
            &cancel,
        )
        .unwrap();
        (outcome, streamed)
    }

    #[test]
    fn test_captures_output_and_exit_code() {
        let (_, input) = mpsc::channel();
        let (outcome, streamed) =
            run_sh("echo hello", &test_settings(), input, Arc::default());

        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.timed_out);
        // The PTY cooks \n into \r\n.
        let text = String::from_utf8_lossy(&outcome.output).into_owned();
        assert!(text.contains("hello"));
        assert_eq!(outcome.output, streamed, "callback must see the same bytes");
    }

    #[test]
    fn test_nonzero_exit_code_reported() {
        let (_, input) = mpsc::channel();
        let (outcome, _) = run_sh("exit 3", &test_settings(), input, Arc::default());
        assert_eq!(outcome.exit_code, 3);
    }

    #[test]
    fn test_stderr_merged_into_stream() {
        let (_, input) = mpsc::channel();
        let (outcome, _) = run_sh("echo oops 1>&2", &test_settings(), input, Arc::default());
        assert!(String::from_utf8_lossy(&outcome.output).contains("oops"));
    }

    #[test]
    fn test_input_reaches_the_child() {
        let (tx, input) = mpsc::channel();
        tx.send(b"world\n".to_vec()).unwrap();
        let (outcome, _) = run_sh(
            "read name; echo hello $name",
            &test_settings(),
            input,
            Arc::default(),
        );
        assert_eq!(outcome.exit_code, 0);
        assert!(String::from_utf8_lossy(&outcome.output).contains("hello world"));
    }

    #[test]
    fn test_wall_clock_timeout_kills_the_group() {
        let mut settings = test_settings();
        settings.execution_timeout_secs = 1;
        let (_, input) = mpsc::channel();
        let start = Instant::now();
        let (outcome, _) = run_sh("sleep 30", &settings, input, Arc::default());

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert!(start.elapsed() < Duration::from_secs(5));
        // elapsed ≤ timeout + grace
        assert!(outcome.execution_time <= 1.0 + KILL_GRACE.as_secs_f64() + 0.5);
    }

    #[test]
    fn test_cancel_flag_stops_the_run() {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            flag.store(true, Ordering::Relaxed);
        });
        let (_, input) = mpsc::channel();
        let start = Instant::now();
        let (outcome, _) = run_sh("sleep 30", &test_settings(), input, cancel);

        assert!(!outcome.timed_out);
        assert_ne!(outcome.exit_code, 0);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_slow_writer_streams_before_timeout() {
        let mut settings = test_settings();
        settings.execution_timeout_secs = 2;
        let (_, input) = mpsc::channel();
        let (outcome, streamed) = run_sh(
            "i=0; while :; do echo tick$i; i=$((i+1)); sleep 1; done",
            &settings,
            input,
            Arc::default(),
        );

        assert!(outcome.timed_out);
        assert!(String::from_utf8_lossy(&streamed).contains("tick0"));
    }
}
