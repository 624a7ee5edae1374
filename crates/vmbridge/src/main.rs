use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{
    path::PathBuf,
    sync::{mpsc, Arc, Weak},
    thread,
};
use vmbridge::{
    transport::ThreadRef, BridgeError, DebuggerOwner, ExitStatus, RunOutcome, VmController,
};
use vmbridge_config::BridgeConfig;
use vmbridge_process::StdioTerminal;

#[derive(Parser)]
#[command(name = "vmbridge", version, about = "Launch a JVM execution server and drive it over JDWP")]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `VMBRIDGE_CONFIG` is used as a fallback. When neither are
    /// provided built-in defaults are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a shell class in a fresh debuggee and report how it ended
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Binary name of the shell class to run
    shell_class: String,
    /// User classpath entry for the new class loader (repeatable)
    #[arg(long = "classpath")]
    classpath: Vec<PathBuf>,
    /// Stop at `Class:line`, print the stack, then continue (repeatable)
    #[arg(long = "breakpoint", value_parser = parse_breakpoint)]
    breakpoints: Vec<(String, u32)>,
    /// Working directory of the debuggee (defaults to current directory)
    #[arg(long, default_value = ".")]
    cwd: PathBuf,
    /// Emit JSON suitable for scripting
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config);
    vmbridge_config::init_tracing_with_config(&config.logging);

    let exit_code = match cli.command {
        Command::Run(args) => match run(&config, args) {
            Ok(code) => code,
            Err(err) => {
                if let Some(BridgeError::Launch { diagnostics, .. }) = err.downcast_ref() {
                    if !diagnostics.is_empty() {
                        eprintln!("{diagnostics}");
                    }
                }
                eprintln!("{err:#}");
                2
            }
        },
    };

    std::process::exit(exit_code);
}

fn load_config(cli_path: Option<PathBuf>) -> BridgeConfig {
    let path = cli_path.or_else(|| std::env::var_os("VMBRIDGE_CONFIG").map(PathBuf::from));
    let Some(path) = path else {
        return BridgeConfig::default();
    };

    match BridgeConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "vmbridge: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            BridgeConfig::default()
        }
    }
}

fn run(config: &BridgeConfig, args: RunArgs) -> Result<i32> {
    let (hits_tx, hits_rx) = mpsc::channel();
    let owner = Arc::new(CliOwner {
        hits: parking_lot::Mutex::new(hits_tx),
    });

    let controller = Arc::new(
        VmController::launch(config, &args.cwd, Arc::new(StdioTerminal::default()), owner)
            .context("failed to start debuggee")?,
    );
    let reporter = spawn_reporter(Arc::downgrade(&controller), hits_rx)?;

    let outcome = drive(&controller, &args);
    controller.close();
    drop(controller);
    if reporter.join().is_err() {
        tracing::error!(target: "vmbridge.controller", "breakpoint reporter panicked");
    }
    let outcome = outcome?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }

    Ok(match outcome.status {
        ExitStatus::NormalExit | ExitStatus::ForcedExit => 0,
        ExitStatus::Exception => 1,
        ExitStatus::Terminated => 2,
    })
}

fn drive(controller: &VmController, args: &RunArgs) -> Result<RunOutcome> {
    controller
        .wait_for_startup()
        .context("execution server did not start")?;
    controller
        .new_class_loader(&args.classpath)
        .context("failed to create class loader")?;
    for (class, line) in &args.breakpoints {
        controller
            .set_breakpoint(class, *line)
            .with_context(|| format!("failed to set breakpoint at {class}:{line}"))?;
    }
    controller
        .run_shell_class(&args.shell_class)
        .with_context(|| format!("failed to run {}", args.shell_class))
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome.status {
        ExitStatus::NormalExit => println!("finished normally"),
        ExitStatus::ForcedExit => println!("exited"),
        ExitStatus::Terminated => println!("debuggee terminated"),
        ExitStatus::Exception => println!("uncaught exception"),
    }
    let Some(exception) = &outcome.exception else {
        return;
    };
    match &exception.message {
        Some(message) => println!("{}: {message}", exception.class_name),
        None => println!("{}", exception.class_name),
    }
    for frame in &exception.stack {
        println!("    at {}", format_frame(frame));
    }
}

fn format_frame(frame: &vmbridge::transport::StackFrameDescriptor) -> String {
    let source = frame.source_file.as_deref().unwrap_or("Unknown Source");
    match frame.line {
        Some(line) => format!("{}.{}({source}:{line})", frame.class_name, frame.method_name),
        None => format!("{}.{}({source})", frame.class_name, frame.method_name),
    }
}

fn parse_breakpoint(value: &str) -> Result<(String, u32), String> {
    let (class, line) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected Class:line, got {value:?}"))?;
    if class.is_empty() {
        return Err(format!("missing class name in {value:?}"));
    }
    let line = line
        .parse::<u32>()
        .map_err(|err| format!("invalid line in {value:?}: {err}"))?;
    Ok((class.to_string(), line))
}

/// Hands breakpoint hits to the reporter thread so the dispatcher never
/// blocks on the terminal.
struct CliOwner {
    hits: parking_lot::Mutex<mpsc::Sender<ThreadRef>>,
}

impl DebuggerOwner for CliOwner {
    fn breakpoint_hit(&self, thread: ThreadRef) {
        // The reporter is gone once the controller is closed.
        let _ = self.hits.lock().send(thread);
    }
}

fn spawn_reporter(
    controller: Weak<VmController>,
    hits: mpsc::Receiver<ThreadRef>,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("vmbridge-reporter".to_string())
        .spawn(move || {
            for thread in hits {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                eprintln!("breakpoint hit in thread {:#x}", thread.0);
                match controller.thread_stack(thread) {
                    Ok(frames) => {
                        for frame in &frames {
                            eprintln!("    at {}", format_frame(frame));
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: "vmbridge.controller", error = %err, "could not read stack")
                    }
                }
                if let Err(err) = controller.resume_thread(thread) {
                    tracing::warn!(target: "vmbridge.controller", error = %err, "could not resume thread");
                }
            }
        })
        .context("failed to start breakpoint reporter")
}
