use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::exit;

use stacksight::addr::Addr;
use stacksight::analysis::{ControlFlowFile, StaticModel};
use stacksight::client::ExecOp;
use stacksight::config::LiveConfig;
use stacksight::debugger::PtraceBackend;
use stacksight::errors::{LiveError, Result};
use stacksight::memorymap::ProcfsLocator;
use stacksight::orchestrator::Orchestrator;
use stacksight::ui::json::{Input, JsonPresenter};
use stacksight::ui::Action;

use clap::Parser;
use tracing::{error, trace};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about,
    help_template = r#"{about-section}
{usage-heading} {usage}
{all-args}{tab}

{name}: v{version}
Authors: {author-with-newline}
"#
)]
/// stacksight server - JSON interface to the live views
///
/// Reads one JSON action per line from standard input and writes every view update as one
/// line of JSON to standard output. Logs go to standard error.
struct Args {
    /// The program to debug
    executable: Option<PathBuf>,

    #[arg(short = 'f', long)]
    /// Precomputed return sites of the program, as JSON
    control_flow: Option<PathBuf>,

    #[arg(short, long)]
    /// Configuration file, as JSON
    config: Option<PathBuf>,

    #[arg(long)]
    /// Print example JSON actions and exit
    ///
    /// Displays sample JSON structures for sending actions to the server
    example_actions: bool,
}

fn main() -> Result<()> {
    human_panic::setup_panic!();
    setup_logger();

    let args = Args::parse();

    if args.example_actions {
        example_actions();
        exit(0);
    }
    let Some(executable) = args.executable else {
        error!("no program to debug was given");
        exit(2);
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
        JsonPresenter::new(std::io::stdout()),
        Box::new(model),
        Box::new(ProcfsLocator::new()),
        config,
    );
    if !orchestrator.enable(None) {
        return Err(LiveError::ConnectionFailed);
    }

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let input = match Input::parse(&line) {
            Ok(i) => i,
            Err(e) => {
                error!("could not understand the input: {e}");
                continue;
            }
        };
        if !orchestrator.handle(input.action) {
            break;
        }
    }

    Ok(())
}

fn example_actions() {
    let actions: &[Action] = &[
        Action::Exec(ExecOp::Run),
        Action::Exec(ExecOp::StepOver),
        Action::Exec(ExecOp::StepOut),
        Action::Exec(ExecOp::Continue),
        Action::SetBreakpoint(Addr::from(4198694u64)),
        Action::SetTty(Path::new("/dev/pts/3").into()),
        Action::SetArguments(vec!["-la".to_string(), "/etc".to_string()]),
        Action::Refresh,
        Action::Poll,
        Action::Quit,
    ];

    for a in actions {
        println!(
            "{}",
            serde_json::to_string(&Input { action: a.clone() }).unwrap()
        )
    }
}

fn setup_logger() {
    // stdout belongs to the JSON output
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .without_time()
        .with_file(false)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("could not setup logger");
    trace!("set up the logger");
}
