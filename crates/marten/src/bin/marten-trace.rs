// marten-trace: parse device step-trace files into a per-step CSV.
//
//   marten-trace ./profiler_output --skip-first-step
//   marten-trace ./profiler_output --inference --output fp.csv

use std::path::PathBuf;

use clap::Parser;

use marten::profiler::step_trace::DEFAULT_OUTPUT_FILE;
use marten::profiler::StepTraceParser;

#[derive(Parser)]
#[command(name = "marten-trace")]
#[command(version, about = "Summarise step-trace files as per-iteration timings")]
struct Cli {
    /// Directory holding ts_track.data* files (or a data/ subdirectory)
    dir: PathBuf,

    /// Output CSV [default: <dir>/step_trace_raw_0_detail_time.csv]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Drop the first (warm-up) step
    #[arg(long)]
    skip_first_step: bool,

    /// Trace comes from an inference run (no backward pass)
    #[arg(long)]
    inference: bool,

    /// Log filter when MARTEN_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> marten::Result<()> {
    let cli = Cli::parse();
    marten::logging::init(&cli.log_level);

    let mut parser = StepTraceParser::new()
        .skip_first_step(cli.skip_first_step)
        .inference(cli.inference);
    let steps = parser.parse_dir(&cli.dir)?;

    let output = cli.output.unwrap_or_else(|| cli.dir.join(DEFAULT_OUTPUT_FILE));
    parser.write_csv(&output)?;

    println!("{steps} steps parsed, written to {}", output.display());
    Ok(())
}
