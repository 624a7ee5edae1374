use std::{
    io::{self, Cursor, Read, Write},
    sync::Arc,
};

use parking_lot::Mutex;

/// Where the debuggee's standard streams go.
///
/// Each method is called once per spawned process; the returned handles are
/// moved onto the pump threads.
pub trait Terminal: Send + Sync {
    /// Receives everything the child writes to stdout.
    fn stdout_sink(&self) -> Box<dyn Write + Send>;
    /// Receives everything the child writes to stderr.
    fn stderr_sink(&self) -> Box<dyn Write + Send>;
    /// Bytes fed to the child's stdin. `None` closes stdin immediately.
    fn stdin_source(&self) -> Option<Box<dyn Read + Send>>;
}

/// Discards output and gives the child an empty stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTerminal;

impl Terminal for NullTerminal {
    fn stdout_sink(&self) -> Box<dyn Write + Send> {
        Box::new(io::sink())
    }

    fn stderr_sink(&self) -> Box<dyn Write + Send> {
        Box::new(io::sink())
    }

    fn stdin_source(&self) -> Option<Box<dyn Read + Send>> {
        None
    }
}

/// Forwards to the controlling process's own stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioTerminal {
    /// Forward our stdin to the child. Off by default so a CLI run does not
    /// leave a thread blocked on the user's terminal.
    pub forward_stdin: bool,
}

impl Terminal for StdioTerminal {
    fn stdout_sink(&self) -> Box<dyn Write + Send> {
        Box::new(io::stdout())
    }

    fn stderr_sink(&self) -> Box<dyn Write + Send> {
        Box::new(io::stderr())
    }

    fn stdin_source(&self) -> Option<Box<dyn Read + Send>> {
        self.forward_stdin
            .then(|| Box::new(io::stdin()) as Box<dyn Read + Send>)
    }
}

/// Collects output in memory and replays a fixed input. Useful in tests and
/// for embedding the controller where output is shown later.
#[derive(Debug, Default, Clone)]
pub struct CaptureTerminal {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
    input: Option<Vec<u8>>,
}

impl CaptureTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(input: impl Into<Vec<u8>>) -> Self {
        Self {
            input: Some(input.into()),
            ..Self::default()
        }
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout.lock()).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock()).into_owned()
    }
}

struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Terminal for CaptureTerminal {
    fn stdout_sink(&self) -> Box<dyn Write + Send> {
        Box::new(SharedBuffer(self.stdout.clone()))
    }

    fn stderr_sink(&self) -> Box<dyn Write + Send> {
        Box::new(SharedBuffer(self.stderr.clone()))
    }

    fn stdin_source(&self) -> Option<Box<dyn Read + Send>> {
        self.input
            .clone()
            .map(|input| Box::new(Cursor::new(input)) as Box<dyn Read + Send>)
    }
}
