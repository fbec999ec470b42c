use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use stacksight::analysis::{ControlFlowFile, StaticModel};
use stacksight::config::LiveConfig;
use stacksight::debugger::PtraceBackend;
use stacksight::errors::{LiveError, Result};
use stacksight::memorymap::{process_name_for, ProcfsLocator};
use stacksight::orchestrator::Orchestrator;
use stacksight::surface::DisassemblySurface;
use stacksight::ui::cli::{CliPresenter, CliUi};

use clap::Parser;
use tracing::{debug, info};

/// Live registers, stack and backtrace of a debugged program
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The program to debug, looked up in PATH if it is not a file
    executable: PathBuf,

    /// Precomputed return sites of the program, as JSON
    #[clap(short = 'f', long)]
    control_flow: Option<PathBuf>,

    /// File the debugged process was started from, if it differs from the program
    #[clap(short, long)]
    attach_file: Option<PathBuf>,

    /// Terminal the program reads and writes
    #[clap(short, long)]
    tty: Option<PathBuf>,

    /// Configuration file, as JSON
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Print the code that ran from the stack when quitting
    #[clap(long)]
    stack_code: bool,

    /// More log output, repeat for even more
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Arguments for the program
    #[clap(last = true)]
    arguments: Vec<String>,
}

fn main() -> Result<()> {
    human_panic::setup_panic!();
    let args = Args::parse();
    setup_logger(args.verbose);
    debug!("set up the logger");

    let executable = if args.executable.is_file() {
        args.executable.clone()
    } else {
        which::which(&args.executable).map_err(|_| {
            LiveError::ExecutableDoesNotExist(args.executable.to_string_lossy().to_string())
        })?
    };
    let config = match &args.config {
        Some(path) => LiveConfig::load(path)?,
        None => LiveConfig::default(),
    };

    let mut model = StaticModel::from_elf(&executable)?;
    if let Some(path) = &args.control_flow {
        model.merge_control_flow(ControlFlowFile::load(path)?)?;
    }

    let backend = PtraceBackend::build(&executable, &config)?;
    let mut orchestrator = Orchestrator::new(
        backend,
        CliPresenter::new(),
        Box::new(model),
        Box::new(ProcfsLocator::new()),
        config,
    );
    if args.attach_file.is_some() {
        orchestrator.set_process_name(process_name_for(&executable, args.attach_file.as_deref()));
    }
    let surface = Rc::new(RefCell::new(DisassemblySurface::new()));
    orchestrator.attach_secondary_surface(Box::new(surface.clone()));

    if !orchestrator.enable(args.tty.as_deref()) {
        return Err(LiveError::ConnectionFailed);
    }
    if !args.arguments.is_empty() {
        orchestrator.set_arguments(&args.arguments);
    }
    info!("debugging {}, type 'run' to start", executable.display());

    let mut ui = CliUi::build()?;
    loop {
        let action = ui.next_action()?;
        if !orchestrator.handle(action) {
            break;
        }
    }

    if args.stack_code {
        print!("{}", surface.borrow());
    }
    Ok(())
}

fn setup_logger(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    // construct a subscriber that prints formatted traces to stdout
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .without_time()
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("could not setup logger");
}
