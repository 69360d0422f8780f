use std::{
    env,
    io::{self, BufRead, Write},
    ops::ControlFlow,
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

use clap::Parser;
use replbridge::{
    FileBuffer, FileSource, MemoryBuffer, MiniFactory, ProcessSpawner, SessionConfig, SessionController, SharedBuffer,
    SourceProvider, StdTranscript, ThreadSpawner, WorkerSpawner, serve_stdio,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Interactive execution session with an isolated interpreter worker.
#[derive(Debug, Parser)]
#[command(name = "replbridge", version, about)]
struct Args {
    /// Script to run in a fresh interpreter before the interactive session.
    file: Option<PathBuf>,

    /// Serve the worker protocol on stdin/stdout (used by `--process`).
    #[arg(long, hide = true)]
    worker: bool,

    /// Host the worker in a child process instead of a thread.
    #[arg(long)]
    process: bool,

    /// JSON session config file.
    #[arg(long, env = "REPLBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Give up on a runtime input request after this many milliseconds.
    #[arg(long)]
    input_timeout_ms: Option<u64>,

    /// Package to preload while booting (repeatable).
    #[arg(long = "package", value_name = "NAME")]
    packages: Vec<String>,
}

type Controller = SessionController<StdTranscript>;

fn main() -> ExitCode {
    // stdout may carry protocol frames, so logs always go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();
    if args.worker {
        return match serve_stdio(Arc::new(MiniFactory::new())) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!(%err, "worker loop failed");
                ExitCode::FAILURE
            }
        };
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let mut controller = match build_controller(&args, config) {
        Ok(controller) => controller,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(path) = &args.file {
        let source = FileSource::new(path);
        if !controller.config().is_runnable(source.name()) {
            eprintln!("error: {} is not a runnable file", source.name());
            return ExitCode::FAILURE;
        }
        match controller.run_source(&source) {
            Ok(()) => settle(&mut controller),
            Err(err) => controller.report(&err),
        }
    } else if let Err(err) = controller.start() {
        controller.report(&err);
    }

    interactive(&mut controller);
    if let Some(err) = controller.teardown() {
        tracing::debug!(%err, "abandoned pending request on exit");
    }
    ExitCode::SUCCESS
}

fn load_config(args: &Args) -> Result<SessionConfig, replbridge::ConfigError> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_json_file(path)?,
        None => SessionConfig::new(),
    };
    if let Some(limit) = args.input_timeout_ms {
        config = config.input_timeout_ms(limit);
    }
    for package in &args.packages {
        config = config.package(package.clone());
    }
    Ok(config)
}

fn build_controller(args: &Args, config: SessionConfig) -> Result<Controller, Box<dyn std::error::Error>> {
    let (spawner, buffer): (Box<dyn WorkerSpawner>, Arc<dyn SharedBuffer>) = if args.process {
        let buffer = FileBuffer::temporary()?.with_poll_interval(config.poll_interval());
        let spawner = ProcessSpawner::new(env::current_exe()?).arg("--worker");
        (Box::new(spawner), Arc::new(buffer))
    } else {
        let spawner = ThreadSpawner::new(Arc::new(MiniFactory::new()));
        (Box::new(spawner), Arc::new(MemoryBuffer::new()))
    };
    Ok(SessionController::new(config, spawner, buffer, StdTranscript))
}

/// Reads lines until stdin closes or the user quits.
fn interactive(controller: &mut Controller) {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        let prompt = if controller.is_awaiting_input() {
            ""
        } else if controller.statements().is_empty() {
            ">>> "
        } else {
            "... "
        };
        print!("{prompt}");
        let _ = io::stdout().flush();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                eprintln!("error: {err}");
                break;
            }
            None => break,
        };

        let at_top_level = !controller.is_awaiting_input() && controller.statements().is_empty();
        if let Some(command) = line.trim().strip_prefix(':').filter(|_| at_top_level) {
            if run_command(controller, command.trim()).is_break() {
                break;
            }
            continue;
        }

        match controller.handle_line(&line) {
            Ok(_) => settle(controller),
            Err(err) => controller.report(&err),
        }
    }
}

/// Pumps worker events until the session is idle or asks for input.
fn settle(controller: &mut Controller) {
    if let Err(err) = controller.wait(None) {
        controller.report(&err);
    }
}

fn run_command(controller: &mut Controller, command: &str) -> ControlFlow<()> {
    match command {
        "quit" | "exit" | "q" => return ControlFlow::Break(()),
        "restart" => {
            if let Err(err) = controller.restart() {
                controller.report(&err);
            }
        }
        "clear" => controller.clear_console(),
        "history" => {
            for (index, entry) in controller.history().entries().iter().enumerate() {
                println!("{:>4}  {entry}", index + 1);
            }
        }
        "state" => println!("{}", controller.state()),
        other => eprintln!("unknown command ':{other}' (try :restart, :clear, :history, :state, :quit)"),
    }
    ControlFlow::Continue(())
}
