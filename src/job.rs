use crate::{
    alignment::Alignment,
    config::Config,
    constraint::write_constraint,
    error::PipelineError,
    merge::{merge_trees, merge_with_reference, TreeSource},
    raxml::Raxml,
    report::{read_report, SignificanceCall, SignificanceResult},
};
use anyhow::{anyhow, Result};
use log::{debug, info};
use rayon::prelude::*;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Where an alignment's pipeline is (or stopped)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preparing,
    Normalizing,
    SearchingBest,
    SearchingConstrained,
    Merging,
    Testing,
    Parsing,
    SiteLikelihoods,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Stage::Preparing => "preparing working directory",
            Stage::Normalizing => "normalizing constraints",
            Stage::SearchingBest => "searching best tree",
            Stage::SearchingConstrained => "searching constrained trees",
            Stage::Merging => "merging trees",
            Stage::Testing => "testing significance",
            Stage::Parsing => "parsing report",
            Stage::SiteLikelihoods => "computing site likelihoods",
            Stage::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// A pipeline error and the stage it stopped at
#[derive(Error, Debug)]
#[error("{source} (while {stage})")]
pub struct JobError {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

pub type JobResult<T> = Result<T, JobError>;

// --------------------------------------------------
fn at<T>(stage: Stage, res: Result<T, PipelineError>) -> JobResult<T> {
    res.map_err(|source| JobError { stage, source })
}

/// Shared, read-only inputs for every job
#[derive(Debug)]
pub struct JobContext<'a> {
    pub config: &'a Config,
    pub raxml: &'a Raxml,
    pub outdir: &'a Path,
    pub site_likelihoods: bool,
}

/// Everything one alignment's pipeline produced
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentResult {
    pub alignment: String,
    pub working_dir: PathBuf,
    pub best_tree: PathBuf,
    pub report: PathBuf,
    pub results: Vec<SignificanceResult>,
    pub site_likelihoods: Option<PathBuf>,
}

// --------------------------------------------------
/// Run every alignment's pipeline on a pool of `workers` threads and wait
/// for all of them. Results are keyed by alignment name.
pub fn run_jobs(
    alignments: &[Alignment],
    ctx: &JobContext,
    workers: usize,
) -> Result<BTreeMap<String, JobResult<AlignmentResult>>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| anyhow!("Cannot start {workers} workers: {e}"))?;

    Ok(pool.install(|| {
        alignments
            .par_iter()
            .map(|alignment| {
                (alignment.name.clone(), run_alignment(alignment, ctx))
            })
            .collect()
    }))
}

// --------------------------------------------------
/// One alignment's full pipeline inside `<outdir>/<alignment name>`
pub fn run_alignment(
    alignment: &Alignment,
    ctx: &JobContext,
) -> JobResult<AlignmentResult> {
    let name = &alignment.name;
    info!("{name}: starting");

    // Own directory and copy of the alignment
    let working_dir = ctx.outdir.join(name);
    at(Stage::Preparing, fs::create_dir(&working_dir).map_err(Into::into))?;
    let working_alignment = working_dir.join(alignment.file_name());
    at(
        Stage::Preparing,
        fs::copy(&alignment.path, &working_alignment).map_err(Into::into),
    )?;

    debug!("{name}: {}", Stage::Normalizing);
    let mut constraints = vec![];
    for (constraint_name, newick) in &ctx.config.constraints {
        let path = at(
            Stage::Normalizing,
            write_constraint(&working_dir, constraint_name, newick, alignment),
        )?;
        constraints.push((constraint_name, path));
    }

    debug!("{name}: {}", Stage::SearchingBest);
    let best_tree = at(
        Stage::SearchingBest,
        ctx.raxml.best_tree(&working_dir, &working_alignment, name),
    )?;

    debug!("{name}: {}", Stage::SearchingConstrained);
    let mut constrained = vec![];
    for (constraint_name, constraint) in &constraints {
        let tree = at(
            Stage::SearchingConstrained,
            ctx.raxml.constrained_tree(
                &working_dir,
                &working_alignment,
                name,
                constraint_name,
                constraint,
            ),
        )?;
        constrained.push(TreeSource::new(constraint_name, &tree));
    }

    debug!("{name}: {}", Stage::Merging);
    let (merged, tree_map) = at(
        Stage::Merging,
        merge_trees(
            &constrained,
            &working_dir.join(format!("{name}.MERGED.constraint.tre")),
        ),
    )?;

    debug!("{name}: {}", Stage::Testing);
    let report = at(
        Stage::Testing,
        ctx.raxml.significance_test(
            &working_dir,
            &working_alignment,
            name,
            &best_tree,
            &merged,
        ),
    )?;

    debug!("{name}: {}", Stage::Parsing);
    let results = at(Stage::Parsing, read_report(&report, &tree_map))?;
    let worse = results
        .iter()
        .filter(|res| res.tests.iter().any(SignificanceCall::is_worse))
        .count();
    info!(
        "{name}: {worse} of {} constraint trees significantly worse",
        results.len()
    );

    let site_likelihoods = if ctx.site_likelihoods {
        debug!("{name}: {}", Stage::SiteLikelihoods);
        let (all_trees, _) = at(
            Stage::SiteLikelihoods,
            merge_with_reference(
                &tree_map,
                TreeSource::new("best", &best_tree),
                &working_dir.join(format!("{name}.MERGED.all.tre")),
            ),
        )?;
        Some(at(
            Stage::SiteLikelihoods,
            ctx.raxml.site_likelihoods(
                &working_dir,
                &working_alignment,
                name,
                &all_trees,
            ),
        )?)
    } else {
        None
    };

    info!("{name}: {}", Stage::Done);
    Ok(AlignmentResult {
        alignment: alignment.file_name(),
        working_dir,
        best_tree,
        report,
        results,
        site_likelihoods,
    })
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::{at, run_alignment, JobContext, JobError, Stage};
    use crate::{
        alignment::Alignment, config::Config, error::PipelineError,
        raxml::Raxml,
    };
    use anyhow::Result;
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;
    use std::{fs, path::PathBuf};
    use tempfile::tempdir;

    #[test]
    fn test_job_error() {
        let res: Result<(), JobError> = at(
            Stage::Testing,
            Err(PipelineError::Subprocess {
                program: "raxmlHPC-SSE3".to_string(),
                stderr: "Error, you must specify a model".to_string(),
            }),
        );
        let err = res.unwrap_err();
        assert_eq!(err.stage, Stage::Testing);
        assert_eq!(
            err.to_string(),
            "raxmlHPC-SSE3 failed: Error, you must specify a model \
            (while testing significance)"
        );
    }

    #[test]
    fn test_existing_working_dir() -> Result<()> {
        let outdir = tempdir()?;
        fs::create_dir(outdir.path().join("uce-10"))?;

        let config = Config {
            orders: IndexMap::new(),
            constraints: IndexMap::from([(
                "c".to_string(),
                "(danio_rerio,cyprinus_carpio,arapaima_gigas);".to_string(),
            )]),
        };
        let raxml = Raxml::locate("true", 1)?;
        let ctx = JobContext {
            config: &config,
            raxml: &raxml,
            outdir: outdir.path(),
            site_likelihoods: false,
        };
        let alignment = Alignment::read(&PathBuf::from(
            "tests/inputs/alignments/uce-10.phylip",
        ))?;

        match run_alignment(&alignment, &ctx) {
            Err(err) => {
                assert_eq!(err.stage, Stage::Preparing);
                assert!(matches!(err.source, PipelineError::Io(_)));
                assert!(err
                    .to_string()
                    .ends_with("(while preparing working directory)"));
            }
            Ok(_) => panic!("expected the working directory to clash"),
        }
        Ok(())
    }
}
