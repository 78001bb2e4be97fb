use std::io::{self, BufWriter, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::debug;

use quill::diagnostic::{self, ansi::AnsiRenderer, Diagnostic};
use quill::vm::{self, GcPolicy, Machine, MachineConfig};

#[derive(Parser, Debug)]
#[command(name = "quill", version)]
#[command(about = "Compile and run quill programs on the stack VM")]
struct Cli {
    /// Program to run
    #[arg(required_unless_present = "eval", conflicts_with = "eval")]
    file: Option<PathBuf>,

    /// Run inline source instead of a file
    #[arg(short = 'e', long = "eval", value_name = "SOURCE")]
    eval: Option<String>,

    /// Print an intermediate form instead of running
    #[arg(long, value_enum)]
    emit: Option<Emit>,

    /// Input is a JSON syntax tree rather than source text
    #[arg(long)]
    ast: bool,

    /// Report diagnostics as JSON
    #[arg(long)]
    json: bool,

    /// Collect after this many heap allocations
    #[arg(long, value_name = "N", conflicts_with = "gc_stress")]
    gc_threshold: Option<usize>,

    /// Collect before every instruction
    #[arg(long)]
    gc_stress: bool,

    /// Maximum call stack depth
    #[arg(long, value_name = "N")]
    max_call_depth: Option<usize>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Emit {
    /// Syntax tree as JSON
    Ast,
    /// Instruction listing and function table
    Code,
}

impl Cli {
    fn machine_config(&self) -> MachineConfig {
        let mut config = MachineConfig::new();
        if self.gc_stress {
            config.gc = GcPolicy::EveryInstruction;
        } else if let Some(n) = self.gc_threshold {
            config.gc = GcPolicy::Threshold(n);
        }
        if let Some(depth) = self.max_call_depth {
            config.max_call_depth = depth;
        }
        config
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_env("QUILL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn report(d: &Diagnostic, json: bool) {
    if json {
        eprintln!("{}", diagnostic::json::render(d));
    } else {
        let renderer = AnsiRenderer { use_color: io::stderr().is_terminal() };
        eprint!("{}", renderer.render(d));
    }
}

fn load_input(cli: &Cli) -> Result<String, Diagnostic> {
    if let Some(source) = &cli.eval {
        return Ok(source.clone());
    }
    let path = cli.file.as_ref().ok_or_else(|| Diagnostic::error("no input given").with_code("QL-I001"))?;
    debug!(path = %path.display(), "reading program");
    std::fs::read_to_string(path)
        .map_err(|e| Diagnostic::error(format!("cannot read {}: {}", path.display(), e)).with_code("QL-I002"))
}

fn run(cli: &Cli) -> Result<(), Diagnostic> {
    let text = load_input(cli)?;

    let parsed = if cli.ast { quill::parse_ast_json(&text) } else { quill::parse_source(&text) };
    let program = parsed.map_err(|e| {
        let d = Diagnostic::from(&e);
        if cli.ast || d.label.is_none() {
            return d;
        }
        let d = d.with_source(text.clone());
        match &cli.file {
            Some(path) => d.with_origin(path.display().to_string()),
            None => d,
        }
    })?;

    if cli.emit == Some(Emit::Ast) {
        let json = serde_json::to_string_pretty(&program)
            .map_err(|e| Diagnostic::error(format!("cannot serialize syntax tree: {}", e)))?;
        println!("{}", json);
        return Ok(());
    }

    let compiled = vm::compile(&program).map_err(|e| Diagnostic::from(&e))?;
    debug!(functions = compiled.functions.len(), instructions = compiled.code.len(), "compiled program");

    if cli.emit == Some(Emit::Code) {
        if compiled.function_address("main").is_none() {
            report(&Diagnostic::warning("program has no 'main' function").with_code("QL-W001"), cli.json);
        }
        print!("{}", compiled.listing());
        return Ok(());
    }

    let out = BufWriter::new(io::stdout().lock());
    let mut machine = Machine::new(&compiled, cli.machine_config(), out);
    match machine.run() {
        Ok(_) => Ok(()),
        Err(e) => Err(Diagnostic::from(&e).with_backtrace(machine.backtrace())),
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(d) => {
            report(&d, cli.json);
            ExitCode::FAILURE
        }
    }
}
