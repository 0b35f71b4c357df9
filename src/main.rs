/// a68 driver: parse, optionally pre-compile, interpret, and wire the
/// monitor. Exit status propagates the run status; a force-quit from the
/// monitor carries its own code.

use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser as ClapParser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use a68::clauses::RunOutcome;
use a68::conf::Conf;
use a68::diagnostics;
use a68::front;
use a68::genie::Genie;
use a68::monitor;

// Deeply recursive programs need more than the default main stack.
const STACK_SIZE: usize = 64 * 1024 * 1024;

#[derive(ClapParser)]
#[command(
    name = "a68",
    version,
    about = "Algol 68 interpreter with an optimising dispatch cache and an interactive monitor"
)]
struct Cli {
    /// Program file
    file: Option<PathBuf>,

    /// List the documented runtime options and exit
    #[arg(long)]
    options: bool,

    /// Re-enter the monitor at a failing node instead of exiting
    #[arg(long)]
    debug: bool,

    /// Dump the frame stack before exiting on a runtime error
    #[arg(long)]
    backtrace: bool,

    /// Drop initialisation checks from generated evaluation threads
    #[arg(long)]
    no_check: bool,

    /// Optimisation level for the code generator
    #[arg(short = 'O', default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=3))]
    optimise: u8,

    /// Heap limit in slots
    #[arg(long)]
    heap: Option<usize>,

    /// Frame stack limit in slots
    #[arg(long)]
    frame: Option<usize>,

    /// Expression stack limit in slots
    #[arg(long)]
    expr: Option<usize>,

    /// Seed for the random-number generator (0 coerces to 1)
    #[arg(long)]
    seed: Option<u32>,

    /// Set a breakpoint at this line before running
    #[arg(long)]
    breakpoint: Option<u32>,

    /// Read monitor commands from a file instead of the terminal
    #[arg(long)]
    monitor_script: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let worker = std::thread::Builder::new()
        .name("a68-genie".into())
        .stack_size(STACK_SIZE)
        .spawn(move || run(cli))
        .expect("failed to spawn the interpreter thread");
    match worker.join() {
        Ok(code) => code,
        Err(_) => {
            eprintln!("a68: internal error (panic in the interpreter thread)");
            ExitCode::from(70)
        }
    }
}

fn run(cli: Cli) -> ExitCode {
    if cli.options {
        for p in a68::conf::ALL_PROPS {
            println!("{:<14} [{}] default {}", p.name, p.category, p.default);
            println!("    {}", p.description);
        }
        return ExitCode::SUCCESS;
    }
    let file = match &cli.file {
        Some(f) => f.clone(),
        None => {
            eprintln!("a68: a program file is required");
            return ExitCode::from(64);
        }
    };
    let source = match std::fs::read_to_string(&file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("a68: cannot read '{}': {}", file.display(), e);
            return ExitCode::from(66);
        }
    };

    let tree = match front::parse_program(&source) {
        Ok(t) => t,
        Err(e) => {
            let report = miette::Report::new(e);
            eprintln!("{:?}", report);
            return ExitCode::from(65);
        }
    };

    let mut conf = Conf::default();
    conf.debug = cli.debug;
    conf.backtrace = cli.backtrace;
    conf.check_init = !cli.no_check;
    conf.opt_level = cli.optimise;
    conf.seed = cli.seed;
    if let Some(h) = cli.heap {
        conf.heap_limit = h;
    }
    if let Some(f) = cli.frame {
        conf.frame_stack_limit = f;
    }
    if let Some(x) = cli.expr {
        conf.expr_stack_limit = x;
    }

    let mut genie = Genie::new(tree, conf);

    // Persisted RNG state, refreshed on exit.
    let state_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let _ = genie.rng.get_rng_state(&state_dir);

    if let Some(script) = &cli.monitor_script {
        match std::fs::File::open(script).into_diagnostic() {
            Ok(f) => genie.monitor.set_input(Box::new(BufReader::new(f))),
            Err(e) => {
                eprintln!("a68: cannot read monitor script: {:?}", e);
                return ExitCode::from(66);
            }
        }
    }
    if let Some(line) = cli.breakpoint {
        let hits = monitor::set_line_breakpoint(&mut genie, line, None);
        if hits == 0 {
            eprintln!("a68: no unit at line {}", line);
        }
    }

    let outcome = genie.run();
    let _ = genie.rng.put_rng_state(&state_dir);

    match outcome {
        RunOutcome::Exited { status, .. } => {
            ExitCode::from(u8::try_from(status.clamp(0, 255)).unwrap_or(1))
        }
        RunOutcome::Failed { error, node } => {
            diagnostics::report(&mut genie, &error, node);
            if genie.conf.backtrace {
                diagnostics::backtrace(&mut genie);
            }
            ExitCode::from(1)
        }
    }
}
