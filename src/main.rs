use std::fs::File;
use std::io::BufWriter;
use std::process::exit;

use anyhow::Context;
use tracing::error;
use tracing_subscriber::EnvFilter;

use steplog::target::Ptraced;
use steplog::tracer::Tracer;

/// Exit code for every tracer-side failure, target exit codes pass through
/// untouched.
const EXIT_FAILURE: i32 = 1;

#[derive(argh::FromArgs)]
/// trace a program one instruction at a time into a register-delta log
struct Arguments {
    #[argh(option, short = 'o', default = r#"String::from("steplog.out")"#)]
    /// where to write the trace
    output: String,

    #[argh(switch)]
    /// leave instruction bytes out of the records
    no_insn: bool,

    #[argh(positional, greedy)]
    /// the program to trace and its arguments
    command: Vec<String>,
}

fn main() {
    let args: Arguments = argh::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if args.command.is_empty() {
        eprintln!("Usage: steplog [-o FILE] [--no-insn] utility [argument ...]");
        exit(EXIT_FAILURE);
    }

    match run(args) {
        Ok(code) => exit(code),
        Err(err) => {
            error!("{err:#}");
            exit(EXIT_FAILURE);
        }
    }
}

fn run(args: Arguments) -> anyhow::Result<i32> {
    let out = File::create(&args.output)
        .with_context(|| format!("creating {} failed", args.output))?;
    let target = Ptraced::spawn(&args.command)?;

    let mut tracer = Tracer {
        target,
        out: BufWriter::new(out),
        capture_insn: !args.no_insn,
    };
    Ok(tracer.run()?)
}
