use std::{
    io::{BufWriter, Write, stdout},
    path::{Path, PathBuf},
};

use anyhow::{Error, anyhow};
use clap::Parser;
use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config as LogConfig, Root},
    encode::pattern::PatternEncoder,
};
use race_analysis::RefinementRequest;
use race_detection::{ThreadId, std_format::StdFormatEncoder};
use racegrind::Config;

#[derive(Parser)]
struct Cli {
    /// Program to analyze, in JSON form
    program: PathBuf,

    /// JSON file with analysis settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Writes the full JSON report to this file
    #[arg(short, long)]
    report: Option<PathBuf>,

    #[arg(long)]
    widening_threshold: Option<usize>,

    /// Declares a branch condition of a thread infeasible, as `thread:condition`
    #[arg(long, value_parser = parse_refinement)]
    refine: Vec<RefinementRequest>,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// log4rs configuration file, replaces `--log-level`
    #[arg(long)]
    log_config: Option<PathBuf>,
}

fn parse_refinement(arg: &str) -> Result<RefinementRequest, Error> {
    let (thread, condition) = arg
        .split_once(':')
        .ok_or_else(|| anyhow!("expected `thread:condition`, got `{}`", arg))?;
    Ok(RefinementRequest::new(ThreadId::new(thread.trim())).infeasible(condition.trim()))
}

fn init_logging(level: LevelFilter, config: Option<&Path>) -> Result<(), Error> {
    if let Some(path) = config {
        return log4rs::init_file(path, Default::default());
    }

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{h({l:<5})} {t} - {m}{n}")))
        .build();
    let config = LogConfig::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))?;
    log4rs::init_config(config)?;

    Ok(())
}

fn main() -> Result<(), Error> {
    let args = Cli::parse();
    init_logging(args.log_level, args.log_config.as_deref())?;

    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(threshold) = args.widening_threshold {
        config.widening_threshold = threshold;
    }

    let program = racegrind::load_program(&args.program)?;
    let analysis = racegrind::analyze(program, &config, args.refine)?;
    let races = analysis.races();

    let mut output = BufWriter::new(stdout().lock());
    let mut encoder = StdFormatEncoder::new();
    encoder.encode(analysis.store(), &races, &mut output)?;
    output.flush()?;

    if let Some(path) = args.report {
        std::fs::write(&path, analysis.report().to_json()?)?;
        log::info!("Report written to {}", path.display());
    }

    Ok(())
}
