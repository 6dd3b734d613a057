use std::{fs::File, io::BufReader, path::Path};

use anyhow::{Context, Error};
use race_analysis::{Analysis, Program, RefinementRequest};

pub use race_analysis;
pub use race_detection;

/// Settings of an analysis run.
pub mod config;

pub use config::Config;

/// Reads and validates a program in JSON form.
pub fn load_program<P: AsRef<Path>>(path: P) -> Result<Program, Error> {
    let path = path.as_ref();
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("cannot open program {}", path.display()))?,
    );
    Program::from_json(reader).with_context(|| format!("invalid program {}", path.display()))
}

/// Runs the analysis of `program` to its fixpoint, then applies every
/// refinement in order.
///
/// # Examples
/// ```no_run
/// # use anyhow::Error;
/// # fn main() -> Result<(), Error> {
/// use racegrind::{Config, race_analysis::RefinementRequest, race_detection::ThreadId};
///
/// let program = racegrind::load_program("program.json")?;
/// let refinement = RefinementRequest::new(ThreadId::new("t2")).infeasible("d == 1");
/// let analysis = racegrind::analyze(program, &Config::from_env()?, vec![refinement])?;
///
/// for race in analysis.races() {
///     println!("{}: {} / {}", race.location, race.first, race.second);
/// }
/// # Ok(())
/// # }
/// ```
pub fn analyze(
    program: Program,
    config: &Config,
    refinements: Vec<RefinementRequest>,
) -> Result<Analysis, Error> {
    let mut analysis = Analysis::new(program, config.options())?;
    analysis.run()?;

    for request in refinements {
        analysis.refine(request)?;
    }

    Ok(analysis)
}

/// Convenience wrapper around [`load_program`] and [`analyze`].
pub fn analyze_file<P: AsRef<Path>>(path: P, config: &Config) -> Result<Analysis, Error> {
    analyze(load_program(path)?, config, Vec::new())
}
