use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

/// Flag the service binary takes to override its listen port.
const PORT_FLAG: &str = "--port";

/// Starts a service process. Split out so the bootstrap state machine can be
/// driven without forking real processes.
pub trait Launcher: Send + Sync {
    /// Launch a detached service process and return its pid. `port` is set
    /// when the caller expects the service on a specific port.
    fn launch(&self, port: Option<u16>) -> std::io::Result<u32>;
}

/// Launches an executable detached from the caller's process group, so the
/// service outlives the process that started it.
#[derive(Debug, Clone)]
pub struct ExecutableLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    log_path: Option<PathBuf>,
}

impl ExecutableLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            log_path: None,
        }
    }

    /// Launcher for the running executable itself.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append the child's stdout and stderr to this file instead of discarding them.
    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    fn command_args(&self, port: Option<u16>) -> Vec<OsString> {
        let mut args = self.args.clone();
        if let Some(port) = port {
            args.push(PORT_FLAG.into());
            args.push(port.to_string().into());
        }
        args
    }

    fn output(&self) -> std::io::Result<(Stdio, Stdio)> {
        let Some(path) = &self.log_path else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let err = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(err)))
    }
}

impl Launcher for ExecutableLauncher {
    fn launch(&self, port: Option<u16>) -> std::io::Result<u32> {
        let (stdout, stderr) = self.output()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(self.command_args(port))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New process group: terminal signals aimed at the caller skip the service
            cmd.process_group(0);
        }

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        debug!("Spawned {} as pid {}", self.program.display(), pid);

        // Reap the child if it exits while we are still around
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        Ok(pid)
    }
}
