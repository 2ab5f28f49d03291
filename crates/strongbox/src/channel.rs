//! Engine subprocess channel
//!
//! One invocation of the encryption engine, driven through a fixed sequence
//! of states:
//!
//! ```text
//! EngineCommand --start--> InputOpen --close_input--> InputClosed
//!     --drain_output--> OutputDrained --wait--> Exited
//! ```
//!
//! Every transition consumes the previous state, so output can only be
//! drained once input has been closed successfully, and the exit status is
//! only collected once output has been drained. A channel dropped before
//! reaching `Exited` kills and reaps its engine.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

const EXEC_BUSY_RETRY_ATTEMPTS: usize = 20;
const EXEC_BUSY_RETRY_DELAY: Duration = Duration::from_millis(10);

/// A configured but not yet started engine invocation
#[derive(Debug, Clone)]
pub struct EngineCommand {
    program: String,
    args: Vec<OsString>,
    capture_output: bool,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            capture_output: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Pipe the engine's standard output back to us instead of discarding it
    pub fn capture_output(mut self) -> Self {
        self.capture_output = true;
        self
    }

    /// Spawn the engine with its pipes already wired up
    pub fn start(self) -> io::Result<EngineChannel<InputOpen>> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(if self.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped());

        let mut child = retry_exec_busy(|| command.spawn())?;
        debug!(engine = %self.program, pid = child.id(), "Engine started");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf).map(|_| buf)
            })
        });

        let process = Process {
            program: self.program,
            child: Some(child),
            stderr,
        };

        let stdin = stdin.ok_or_else(|| io::Error::other("engine input pipe was not opened"))?;
        if self.capture_output && stdout.is_none() {
            return Err(io::Error::other("engine output pipe was not opened"));
        }

        Ok(EngineChannel {
            process,
            state: InputOpen { stdin, stdout },
        })
    }
}

/// Input pipe open for writing
pub struct InputOpen {
    stdin: ChildStdin,
    stdout: Option<ChildStdout>,
}

/// Input pipe closed; the engine has seen EOF
pub struct InputClosed {
    stdout: Option<ChildStdout>,
}

/// Output pipe read to completion
pub struct OutputDrained {
    output: Zeroizing<Vec<u8>>,
}

/// Final result of an invocation
#[derive(Debug)]
pub struct Exited {
    pub status: ExitStatus,
    pub output: Zeroizing<Vec<u8>>,
    pub stderr: String,
}

/// A running engine in state `S`
pub struct EngineChannel<S> {
    process: Process,
    state: S,
}

impl<S> EngineChannel<S> {
    pub fn pid(&self) -> Option<u32> {
        self.process.child.as_ref().map(Child::id)
    }
}

impl EngineChannel<InputOpen> {
    /// Write bytes to the engine's standard input
    pub fn write_input(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.state.stdin.write_all(bytes)?;
        self.state.stdin.flush()
    }

    /// Close standard input, signalling EOF. Close failures are reported.
    pub fn close_input(self) -> io::Result<EngineChannel<InputClosed>> {
        let EngineChannel { process, state } = self;
        close_pipe(state.stdin)?;
        debug!(engine = %process.program, "Engine input closed");

        Ok(EngineChannel {
            process,
            state: InputClosed {
                stdout: state.stdout,
            },
        })
    }
}

impl EngineChannel<InputClosed> {
    /// Read the engine's standard output until it closes it
    pub fn drain_output(self) -> io::Result<EngineChannel<OutputDrained>> {
        let EngineChannel { process, state } = self;

        let mut output = Zeroizing::new(Vec::new());
        if let Some(mut stdout) = state.stdout {
            stdout.read_to_end(&mut output)?;
        }
        debug!(engine = %process.program, bytes = output.len(), "Engine output drained");

        Ok(EngineChannel {
            process,
            state: OutputDrained { output },
        })
    }
}

impl EngineChannel<OutputDrained> {
    /// Reap the engine and collect its exit status and diagnostics
    pub fn wait(mut self) -> io::Result<Exited> {
        let status = match self.process.child.as_mut() {
            Some(child) => child.wait()?,
            None => return Err(io::Error::other("engine was already reaped")),
        };
        self.process.child = None;

        let stderr = self
            .process
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .and_then(Result::ok)
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
            .unwrap_or_default();
        debug!(engine = %self.process.program, %status, "Engine exited");

        Ok(Exited {
            status,
            output: self.state.output,
            stderr,
        })
    }
}

/// The child process plus its stderr collector
struct Process {
    program: String,
    child: Option<Child>,
    stderr: Option<JoinHandle<io::Result<Vec<u8>>>>,
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!(engine = %self.program, pid = child.id(), "Killing abandoned engine");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(unix)]
fn close_pipe(stdin: ChildStdin) -> io::Result<()> {
    use std::os::unix::io::IntoRawFd;

    let fd = stdin.into_raw_fd();
    // SAFETY: `fd` was just released from an owned pipe handle and is closed exactly once.
    if unsafe { libc::close(fd) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn close_pipe(stdin: ChildStdin) -> io::Result<()> {
    drop(stdin);
    Ok(())
}

/// Retry spawning while the executable is still busy being written
pub(crate) fn retry_exec_busy<T, F>(mut operation: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut last_error = None;
    for attempt in 0..EXEC_BUSY_RETRY_ATTEMPTS {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) if is_exec_busy(&error) && attempt + 1 < EXEC_BUSY_RETRY_ATTEMPTS => {
                last_error = Some(error);
                thread::sleep(EXEC_BUSY_RETRY_DELAY);
            }
            Err(error) => return Err(error),
        }
    }

    Err(last_error.unwrap_or_else(|| io::Error::other("command execution failed")))
}

#[cfg(unix)]
fn is_exec_busy(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(not(unix))]
fn is_exec_busy(_error: &io::Error) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_cat_round_trip() {
        let mut channel = EngineCommand::new("cat").capture_output().start().unwrap();
        channel.write_input(b"line one\nline two").unwrap();

        let exited = channel.close_input().unwrap().drain_output().unwrap().wait().unwrap();
        assert!(exited.status.success());
        assert_eq!(exited.output.as_slice(), b"line one\nline two");
    }

    #[test]
    fn test_output_larger_than_pipe_buffer() {
        // The engine only starts writing after EOF on its input
        let payload = vec![b'x'; 64 * 1024 - 1];
        let mut channel = EngineCommand::new("sh")
            .args(["-c", "cat >/dev/null; head -c 1048576 /dev/zero"])
            .capture_output()
            .start()
            .unwrap();
        channel.write_input(&payload).unwrap();

        let exited = channel.close_input().unwrap().drain_output().unwrap().wait().unwrap();
        assert!(exited.status.success());
        assert_eq!(exited.output.len(), 1024 * 1024);
    }

    #[test]
    fn test_output_discarded_without_capture() {
        let mut channel = EngineCommand::new("cat").start().unwrap();
        channel.write_input(b"ignored").unwrap();

        let exited = channel.close_input().unwrap().drain_output().unwrap().wait().unwrap();
        assert!(exited.status.success());
        assert!(exited.output.is_empty());
    }

    #[test]
    fn test_stderr_and_status_collected() {
        let channel = EngineCommand::new("sh")
            .args(["-c", "echo 'engine says no' >&2; exit 3"])
            .start()
            .unwrap();

        let exited = channel.close_input().unwrap().drain_output().unwrap().wait().unwrap();
        assert_eq!(exited.status.code(), Some(3));
        assert_eq!(exited.stderr, "engine says no");
    }

    #[test]
    fn test_missing_program_fails_to_start() {
        let err = EngineCommand::new("strongbox-no-such-engine").start().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_abandoned_channel_is_reaped() {
        let channel = EngineCommand::new("sleep").arg("30").start().unwrap();
        let pid = channel.pid().unwrap();
        drop(channel);

        // kill + wait in Drop leaves no process behind
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
        assert!(!alive);
    }
}
