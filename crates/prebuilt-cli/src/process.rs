//! Child processes: the dependency-resolution command and the real build.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Dependency configs are small; anything larger is truncated.
const MAX_CAPTURED_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run `argv` in `cwd`, capturing stdout and stderr.
pub fn capture(argv: &[String], cwd: &Path, cancel: &CancellationToken) -> io::Result<Captured> {
    let mut child = command(argv, cwd)?
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let Some(stdout) = child.stdout.take() else {
        return Err(io::Error::other("child stdout was not captured"));
    };
    let Some(stderr) = child.stderr.take() else {
        return Err(io::Error::other("child stderr was not captured"));
    };
    let stdout_handle = thread::spawn(move || read_bounded(stdout));
    let stderr_handle = thread::spawn(move || read_bounded(stderr));

    let status = wait(&mut child, cancel)?;
    let stdout = join_reader(stdout_handle)?;
    let stderr = join_reader(stderr_handle)?;
    Ok(Captured {
        status,
        stdout,
        stderr,
    })
}

/// Run `argv` in `cwd` with inherited stdio. Output goes to stderr so stdout
/// stays reserved for the command's own result.
pub fn run_inherited(argv: &[String], cwd: &Path, cancel: &CancellationToken) -> io::Result<ExitStatus> {
    let mut child = command(argv, cwd)?
        .stdin(Stdio::inherit())
        .stdout(io::stderr())
        .stderr(Stdio::inherit())
        .spawn()?;
    wait(&mut child, cancel)
}

fn command(argv: &[String], cwd: &Path) -> io::Result<Command> {
    let Some((program, args)) = argv.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    Ok(cmd)
}

fn wait(child: &mut Child, cancel: &CancellationToken) -> io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            // Already exited is fine.
            let _ = child.kill();
            child.wait()?;
            return Err(io::Error::new(io::ErrorKind::Interrupted, "interrupted"));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn read_bounded(mut reader: impl Read) -> io::Result<String> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        // Keep draining past the limit so the child never blocks on a full pipe.
        let room = MAX_CAPTURED_BYTES.saturating_sub(captured.len());
        captured.extend_from_slice(&buf[..read.min(room)]);
    }
    Ok(String::from_utf8_lossy(&captured).into_owned())
}

fn join_reader(handle: thread::JoinHandle<io::Result<String>>) -> io::Result<String> {
    handle
        .join()
        .map_err(|_| io::Error::other("output reader thread panicked"))?
}
