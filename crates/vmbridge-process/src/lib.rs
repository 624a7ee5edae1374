//! Spawning and supervising the debuggee JVM.
//!
//! The child is started with a JDWP agent listening on a socket, placed in its
//! own process group, and has its three standard streams pumped to and from a
//! [`Terminal`]. Stderr is additionally teed into a bounded tail buffer so a
//! failed attach can report what the JVM printed before it gave up.

mod terminal;

use std::{
    collections::VecDeque,
    fmt,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

pub use terminal::{CaptureTerminal, NullTerminal, StdioTerminal, Terminal};

/// Everything needed to build the debuggee command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub cwd: PathBuf,
    /// The `java` executable.
    pub java: PathBuf,
    pub classpath: Vec<PathBuf>,
    pub vm_options: Vec<String>,
    /// `host:port` the JDWP agent listens on.
    pub debug_address: String,
    /// Fully qualified name of the execution server main class.
    pub server_class: String,
    /// Run the JVM in interpreted mode (`-Xint`).
    pub interpreted_only: bool,
}

impl LaunchSpec {
    pub fn command(&self) -> CommandSpec {
        let mut args = Vec::new();
        if !self.classpath.is_empty() {
            args.push("-classpath".to_string());
            args.push(join_classpath(&self.classpath));
        }
        if self.interpreted_only {
            args.push("-Xint".to_string());
        }
        args.extend(self.vm_options.iter().cloned());
        args.push(format!(
            "-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,address={}",
            self.debug_address
        ));
        args.push(self.server_class.clone());

        CommandSpec {
            cwd: self.cwd.clone(),
            program: self.java.clone(),
            args,
        }
    }
}

fn join_classpath(entries: &[PathBuf]) -> String {
    let separator = if cfg!(windows) { ";" } else { ":" };
    entries
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

/// A full command invocation (cwd + program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cwd: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(cwd: &Path, program: &Path, args: &[String]) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            program: program.to_path_buf(),
            args: args.to_vec(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Human-readable, not a round-trippable shell snippet.
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('\t') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Options controlling how the child is supervised.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Bytes of stderr retained for diagnostics (the most recent ones).
    pub diagnostic_bytes: usize,
    /// How long to wait after SIGTERM before SIGKILL.
    pub kill_grace: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            diagnostic_bytes: 64 * 1024,
            kill_grace: Duration::from_millis(250),
        }
    }
}

/// Error returned when the child could not be started.
#[derive(Debug)]
pub struct SpawnError {
    pub command: CommandSpec,
    pub source: io::Error,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to run `{}`: {}", self.command, self.source)
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// The most recent bytes written to a stream.
#[derive(Debug, Default)]
struct TailBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    truncated: bool,
}

impl TailBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(8 * 1024)),
            capacity,
            truncated: false,
        }
    }

    fn push(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            self.truncated |= !data.is_empty();
            return;
        }
        let data = if data.len() > self.capacity {
            self.truncated = true;
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        let overflow = (self.bytes.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.truncated = true;
            self.bytes.drain(..overflow);
        }
        self.bytes.extend(data);
    }

    fn snapshot(&self) -> String {
        let (a, b) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// A running debuggee process. Dropping it terminates the process tree.
pub struct DebuggeeProcess {
    child: Child,
    command: CommandSpec,
    stderr_tail: Arc<Mutex<TailBuffer>>,
    output_pumps: Vec<thread::JoinHandle<()>>,
    kill_grace: Duration,
    status: Option<ExitStatus>,
}

impl fmt::Debug for DebuggeeProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebuggeeProcess")
            .field("pid", &self.child.id())
            .field("command", &self.command.to_string())
            .field("status", &self.status)
            .finish()
    }
}

impl DebuggeeProcess {
    /// Spawn `command` and start the stdio pumps.
    pub fn spawn(
        command: &CommandSpec,
        terminal: Arc<dyn Terminal>,
        opts: SpawnOptions,
    ) -> Result<Self, SpawnError> {
        let spawn_error = |source: io::Error| SpawnError {
            command: command.clone(),
            source,
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so termination reaches anything the JVM forks.
        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;

            cmd.pre_exec(|| {
                // SAFETY: `setpgid` is async-signal-safe and does not allocate.
                // This is executed after `fork` in the child process.
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(&spawn_error)?;
        tracing::debug!(
            target: "vmbridge.process",
            pid = child.id(),
            command = %command,
            "spawned debuggee"
        );

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_error(io::Error::other(
                "child stdio was not captured",
            )));
        };

        let stderr_tail = Arc::new(Mutex::new(TailBuffer::with_capacity(
            opts.diagnostic_bytes,
        )));

        let mut output_pumps = Vec::with_capacity(2);
        let stdout_sink = terminal.stdout_sink();
        output_pumps.extend(spawn_pump("stdout", move || {
            pump(stdout, stdout_sink, |_| {})
        }));

        let stderr_sink = terminal.stderr_sink();
        let tail = stderr_tail.clone();
        output_pumps.extend(spawn_pump("stderr", move || {
            pump(stderr, stderr_sink, |chunk| tail.lock().push(chunk))
        }));

        // The input pump may block on the terminal forever; it is never joined.
        if let Some(source) = terminal.stdin_source() {
            let _ = spawn_pump("stdin", move || pump_stdin(source, stdin));
        } else {
            drop(stdin);
        }

        Ok(Self {
            child,
            command: command.clone(),
            stderr_tail,
            output_pumps,
            kill_grace: opts.kill_grace,
            status: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    /// The most recent stderr output, lossily decoded.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock();
        let mut text = tail.snapshot();
        if tail.truncated {
            text.insert_str(0, "[...]\n");
        }
        text
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.status = status;
            self.join_output_pumps();
        }
        Ok(status)
    }

    /// Block until the child exits on its own.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.status = Some(status);
        self.join_output_pumps();
        Ok(status)
    }

    /// Terminate the whole process tree. Safe to call more than once.
    pub fn terminate(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }
        let status = terminate_process_tree(&mut self.child, self.kill_grace)?;
        tracing::debug!(
            target: "vmbridge.process",
            pid = self.child.id(),
            %status,
            "terminated debuggee"
        );
        self.status = Some(status);
        self.join_output_pumps();
        Ok(status)
    }

    fn join_output_pumps(&mut self) {
        for handle in self.output_pumps.drain(..) {
            if handle.join().is_err() {
                tracing::debug!(target: "vmbridge.process", "output pump panicked");
            }
        }
    }
}

impl Drop for DebuggeeProcess {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            tracing::debug!(
                target: "vmbridge.process",
                error = %err,
                "failed to terminate debuggee on drop"
            );
        }
    }
}

fn spawn_pump(
    stream: &'static str,
    f: impl FnOnce() -> io::Result<()> + Send + 'static,
) -> Option<thread::JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name(format!("vmbridge-pump-{stream}"))
        .spawn(move || {
            if let Err(err) = f() {
                tracing::debug!(target: "vmbridge.process", stream, error = %err, "stdio pump stopped");
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::error!(target: "vmbridge.process", stream, error = %err, "failed to start stdio pump");
            None
        }
    }
}

fn pump(
    mut reader: impl Read,
    mut sink: Box<dyn Write + Send>,
    mut observe: impl FnMut(&[u8]),
) -> io::Result<()> {
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        observe(&buf[..n]);
        sink.write_all(&buf[..n])?;
        sink.flush()?;
    }
    Ok(())
}

fn pump_stdin(mut source: Box<dyn Read + Send>, mut stdin: ChildStdin) -> io::Result<()> {
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        stdin.write_all(&buf[..n])?;
        stdin.flush()?;
    }
    // Dropping `stdin` closes the pipe so the child sees EOF.
    Ok(())
}

fn terminate_process_tree(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        let pid = child.id() as i32;
        // Negative pid targets the process group, which we set to the child's pid via
        // `setpgid(0, 0)` in `pre_exec`.
        unsafe {
            let _ = libc::kill(-pid, libc::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(25));
        }

        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
        }
        child.wait()
    }

    #[cfg(windows)]
    {
        let _ = grace;
        // `Child::kill()` only terminates the immediate process; `taskkill /T` takes the tree.
        let pid = child.id().to_string();
        let _ = Command::new("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        let _ = child.kill();
        child.wait()
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = grace;
        let _ = child.kill();
        child.wait()
    }
}
