use std::fs::File;
use std::io;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};

/// Exit code reported for a command that could not be started.
pub const LAUNCH_FAILURE_CODE: i32 = 127;

/// Starts job commands as child processes.
pub trait ProcessLauncher: Send + Sync {
    /// Start `command` with stdout and stderr both appended to `log`.
    fn launch(&self, command: &[String], log: &File) -> io::Result<Box<dyn ChildProcess>>;
}

/// A started command.
#[async_trait]
pub trait ChildProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Exit code if the process has finished. Never blocks.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Block until the process exits.
    async fn wait(&mut self) -> io::Result<i32>;
}

/// Runs commands directly on this host, without a shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLauncher;

impl ProcessLauncher for LocalLauncher {
    fn launch(&self, command: &[String], log: &File) -> io::Result<Box<dyn ChildProcess>> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?))
            .spawn()?;

        tracing::debug!(pid = ?child.id(), command = %command.join(" "), "Process started");
        Ok(Box::new(LocalChild {
            pid: child.id(),
            child,
        }))
    }
}

struct LocalChild {
    pid: Option<u32>,
    child: Child,
}

#[async_trait]
impl ChildProcess for LocalChild {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    async fn wait(&mut self) -> io::Result<i32> {
        Ok(exit_code(self.child.wait().await?))
    }
}

/// Stands in for a command that never started, so it still goes through
/// the normal running -> finished reporting.
#[derive(Debug, Clone, Copy)]
pub struct FailedLaunch {
    code: i32,
}

impl FailedLaunch {
    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

#[async_trait]
impl ChildProcess for FailedLaunch {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(Some(self.code))
    }

    async fn wait(&mut self) -> io::Result<i32> {
        Ok(self.code)
    }
}

/// Exit code, or `128 + signal` for a process killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
