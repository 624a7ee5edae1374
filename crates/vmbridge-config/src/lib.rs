//! Configuration for the debuggee controller and the process-wide tracing setup.
//!
//! Every table and key is optional; anything left out falls back to the
//! defaults documented on each field. Unknown keys are rejected so typos do
//! not silently fall back to a default.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Once},
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    fmt::MakeWriter,
    layer::SubscriberExt,
    Layer,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub launch: LaunchConfig,
    pub server: ServerConfig,
    pub rendezvous: RendezvousConfig,
    pub jdwp: JdwpConfig,
    pub logging: LoggingConfig,
}

/// How the debuggee JVM is started and attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    /// The `java` executable.
    pub java: PathBuf,
    /// Classpath of the execution server runtime.
    pub classpath: Vec<PathBuf>,
    /// Extra JVM options, placed before the JDWP agent option.
    pub vm_options: Vec<String>,
    pub debug_host: String,
    pub debug_port: u16,
    /// Attach attempts before the launch is declared failed.
    pub attach_attempts: u32,
    pub attach_backoff_ms: u64,
    /// Bytes of child stderr kept for launch-failure diagnostics.
    pub diagnostic_bytes: usize,
    /// Run the JVM with `-Xint`.
    pub interpreted_only: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            java: PathBuf::from("java"),
            classpath: Vec::new(),
            vm_options: Vec::new(),
            debug_host: "127.0.0.1".to_string(),
            debug_port: 8000,
            attach_attempts: 10,
            attach_backoff_ms: 500,
            diagnostic_bytes: 64 * 1024,
            interpreted_only: true,
        }
    }
}

impl LaunchConfig {
    /// `host:port` for the JDWP agent.
    pub fn debug_address(&self) -> String {
        format!("{}:{}", self.debug_host, self.debug_port)
    }

    pub fn attach_backoff(&self) -> Duration {
        Duration::from_millis(self.attach_backoff_ms)
    }
}

/// Names making up the contract with the execution server running inside the debuggee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub class: String,
    pub started_method: String,
    pub suspend_method: String,
    pub exit_marker_method: String,
    /// Static field on the server class holding the pre-built exit exception.
    pub exit_exception_field: String,
    pub exit_exception_class: String,
    pub main_thread: String,
    pub worker_thread: String,
    /// Classes whose name starts with this are generated shell wrappers.
    pub shell_class_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            class: "vmbridge.runtime.ExecServer".to_string(),
            started_method: "vmStarted".to_string(),
            suspend_method: "vmSuspend".to_string(),
            exit_marker_method: "exitMarker".to_string(),
            exit_exception_field: "exitException".to_string(),
            exit_exception_class: "vmbridge.runtime.ExitException".to_string(),
            main_thread: "main".to_string(),
            worker_thread: "vmbridge-worker".to_string(),
            shell_class_prefix: "__SHELL".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RendezvousConfig {
    /// Slice for condition-variable waits; each slice re-checks for disconnection.
    pub wait_slice_ms: u64,
    /// Upper bound for a single rendezvous wait. Unset means wait for as long as it takes.
    pub timeout_ms: Option<u64>,
    /// Upper bound for `wait_for_startup`.
    pub startup_timeout_ms: Option<u64>,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            wait_slice_ms: 50,
            timeout_ms: None,
            startup_timeout_ms: None,
        }
    }
}

impl RendezvousConfig {
    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms.max(1))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JdwpConfig {
    pub handshake_timeout_ms: u64,
    /// Reply timeout for ordinary commands. Method invocations never time out.
    pub reply_timeout_ms: u64,
}

impl Default for JdwpConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            reply_timeout_ms: 10_000,
        }
    }
}

impl JdwpConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path. If the file cannot be opened,
    /// file logging is disabled while other sinks remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            // Anything else is treated as an `EnvFilter` directive string.
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: `level`, with `RUST_LOG` merged on top when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Keep the message only; the default `Display` embeds a source snippet.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl BridgeConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

struct MutexFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for MutexFileMakeWriter {
    type Writer = MutexFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        MutexFileWriter {
            guard: self.file.lock(),
        }
    }
}

struct MutexFileWriter<'a> {
    guard: parking_lot::MutexGuard<'a, std::fs::File>,
}

impl Write for MutexFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Installs the global `tracing` subscriber.
///
/// Safe to call multiple times; only the first call has an effect.
pub fn init_tracing_with_config(logging: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = logging.env_filter();

        let file_path = logging.file.clone();
        let file = file_path
            .as_ref()
            .and_then(|path| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .ok()
            })
            .map(|file| Arc::new(Mutex::new(file)));
        let file_open_failed = file_path.is_some() && file.is_none();

        let mut make_writer: Option<BoxMakeWriter> = None;
        if logging.stderr {
            // `cargo test` only captures output written through the stdlib print macros.
            make_writer = Some(if cfg!(debug_assertions) {
                BoxMakeWriter::new(tracing_subscriber::fmt::writer::TestWriter::with_stderr)
            } else {
                BoxMakeWriter::new(std::io::stderr)
            });
        }
        if let Some(file) = file {
            let file_writer = MutexFileMakeWriter { file };
            make_writer = Some(match make_writer {
                Some(existing) => BoxMakeWriter::new(existing.and(file_writer)),
                None => BoxMakeWriter::new(file_writer),
            });
        }
        let make_writer = make_writer.unwrap_or_else(|| BoxMakeWriter::new(std::io::sink));

        let layer: Box<dyn Layer<_> + Send + Sync> = if logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() && file_open_failed {
            if let Some(path) = file_path.as_ref() {
                tracing::warn!(
                    target: "vmbridge.config",
                    path = %path.display(),
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
}
