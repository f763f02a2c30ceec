pub mod alignment;
pub mod config;
pub mod constraint;
pub mod error;
pub mod job;
pub mod merge;
pub mod raxml;
pub mod report;
pub mod tree;

use crate::{
    alignment::{check_taxon_groups, find_alignments, Alignment},
    config::Config,
    error::PipelineError,
    job::{run_jobs, AlignmentResult, JobContext, JobError},
    raxml::{Raxml, DEFAULT_RAXML},
};
use anyhow::{anyhow, bail, Result};
use clap::{builder::PossibleValue, Parser, ValueEnum};
use csv::WriterBuilder;
use indexmap::IndexMap;
use itertools::Itertools;
use log::{error, info, warn};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashSet},
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

/// Test constraint trees against ML trees with RAxML
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// YAML (or TOML) config with taxon groups and constraints
    #[arg(long, value_name = "CONFIG", value_parser = expand_path)]
    pub config: PathBuf,

    /// Directory of PHYLIP alignments
    #[arg(long, value_name = "ALIGNMENTS", value_parser = expand_path)]
    pub alignments: PathBuf,

    /// Output directory
    #[arg(short, long, value_name = "OUTPUT", value_parser = expand_path)]
    pub output: PathBuf,

    /// Replace the output directory if it exists
    #[arg(long)]
    pub force: bool,

    /// Number of alignments to run at once
    #[arg(
        long,
        value_name = "CORES",
        default_value = "1",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub cores: u16,

    /// Number of RAxML search replicates
    #[arg(
        long,
        value_name = "SEARCHES",
        default_value = "20",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub searches: u32,

    /// RAxML executable
    #[arg(long, value_name = "RAXML", default_value = DEFAULT_RAXML)]
    pub raxml: String,

    /// Also compute per-site log likelihoods for all trees
    #[arg(long)]
    pub site_likelihoods: bool,

    /// Log level
    #[arg(short, long)]
    pub log: Option<LogLevel>,

    /// Log file, default STDERR
    #[arg(long, value_name = "LOGFILE", value_parser = expand_path)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum LogLevel {
    Info,
    Debug,
}

impl ValueEnum for LogLevel {
    fn value_variants<'a>() -> &'a [Self] {
        &[LogLevel::Info, LogLevel::Debug]
    }

    fn to_possible_value<'a>(&self) -> Option<PossibleValue> {
        Some(match self {
            LogLevel::Info => PossibleValue::new("info"),
            LogLevel::Debug => PossibleValue::new("debug"),
        })
    }
}

/// One alternative tree of one alignment, flattened for the TSV output
#[derive(Debug, Serialize)]
struct ResultRow<'a> {
    alignment: &'a str,
    tree: &'a str,
    likelihood: f64,
    delta: f64,
    sd: f64,
    test_1: String,
    test_2: String,
    test_3: String,
}

// --------------------------------------------------
pub fn run(args: Args) -> Result<()> {
    let start = Instant::now();
    let mut logger = env_logger::Builder::new();
    logger.filter_level(match args.log {
        Some(LogLevel::Debug) => log::LevelFilter::Debug,
        Some(LogLevel::Info) => log::LevelFilter::Info,
        _ => log::LevelFilter::Warn,
    });
    if let Some(log_file) = &args.log_file {
        logger.target(env_logger::Target::Pipe(Box::new(BufWriter::new(
            File::create(log_file)
                .map_err(|e| anyhow!("{}: {e}", log_file.display()))?,
        ))));
    }
    logger.init();

    info!("args = {args:#?}");

    let workers = args.cores as usize;
    let max_workers = num_cpus::get();
    if workers > max_workers {
        bail!("--cores {workers} exceeds the {max_workers} available CPUs");
    }

    let config = Config::from_path(&args.config)?;
    let raxml = Raxml::locate(&args.raxml, args.searches as usize)?;
    info!("Using {}", raxml.program().display());

    let candidates = find_alignments(&args.alignments)?;
    info!("Found {} alignments", candidates.len());
    let (alignments, mut failed) = select_alignments(&candidates, &config.orders)?;
    if alignments.is_empty() {
        bail!(
            r#"No usable alignments in "{}""#,
            args.alignments.display()
        );
    }

    let outdir = prepare_outdir(&args.output, args.force)?;
    let ctx = JobContext {
        config: &config,
        raxml: &raxml,
        outdir: &outdir,
        site_likelihoods: args.site_likelihoods,
    };

    info!("Running {} alignments on {workers} workers", alignments.len());
    let mut finished = vec![];
    for (name, outcome) in run_jobs(&alignments, &ctx, workers)? {
        match outcome {
            Ok(result) => finished.push(result),
            Err(JobError { stage, source }) => {
                error!("{name} failed while {stage}: {source}");
                failed.push((name, source.to_string()));
            }
        }
    }

    write_results(&outdir, &finished)?;

    if !failed.is_empty() {
        bail!(
            "{} alignment{} failed: {}",
            failed.len(),
            if failed.len() == 1 { "" } else { "s" },
            failed.iter().map(|(name, err)| format!("{name} ({err})")).join(", ")
        );
    }

    println!(
        r#"Finished {} alignments in {} seconds, see output in "{}""#,
        finished.len(),
        start.elapsed().as_secs(),
        outdir.display()
    );

    Ok(())
}

// --------------------------------------------------
/// Read each alignment and keep those with every taxon group represented.
/// Alignments missing a group are dropped with a warning; alignments that
/// cannot be read are returned as failures.
pub fn select_alignments(
    paths: &[PathBuf],
    groups: &IndexMap<String, Vec<String>>,
) -> Result<(Vec<Alignment>, Vec<(String, String)>)> {
    let mut valid = vec![];
    let mut failed = vec![];
    let mut names = HashSet::new();

    for path in paths {
        let outcome = Alignment::read(path).and_then(|alignment| {
            check_taxon_groups(&alignment, groups).map(|_| alignment)
        });

        match outcome {
            Ok(alignment) => {
                if !names.insert(alignment.name.clone()) {
                    bail!(
                        r#"More than one alignment is named "{}""#,
                        alignment.name
                    );
                }
                valid.push(alignment);
            }
            Err(PipelineError::Group { group, alignment }) => {
                warn!(r#"Dropped {alignment} due to missing taxa from "{group}""#);
            }
            Err(e) => {
                error!("{}: {e}", path.display());
                failed.push((path.display().to_string(), e.to_string()));
            }
        }
    }

    Ok((valid, failed))
}

// --------------------------------------------------
/// Create the output directory, or replace an existing non-empty one when
/// `force` is set. Returns the absolute path.
pub fn prepare_outdir(outdir: &Path, force: bool) -> Result<PathBuf> {
    if outdir.exists() {
        let is_empty =
            outdir.is_dir() && fs::read_dir(outdir)?.next().is_none();
        if !is_empty {
            if !force {
                bail!(
                    r#"Output directory "{}" exists, use --force to replace it"#,
                    outdir.display()
                );
            }
            info!(r#"Removing "{}""#, outdir.display());
            if outdir.is_dir() {
                fs::remove_dir_all(outdir)?;
            } else {
                fs::remove_file(outdir)?;
            }
        }
    }

    fs::create_dir_all(outdir)
        .map_err(|e| anyhow!("Cannot create {}: {e}", outdir.display()))?;
    Ok(outdir.canonicalize()?)
}

// --------------------------------------------------
/// Write `results.tsv` and `results.json` into `outdir`
pub fn write_results(outdir: &Path, results: &[AlignmentResult]) -> Result<()> {
    let tsv_path = outdir.join("results.tsv");
    let mut wtr = WriterBuilder::new()
        .has_headers(true)
        .delimiter(b'\t')
        .from_path(&tsv_path)?;

    for result in results {
        for sig in &result.results {
            wtr.serialize(ResultRow {
                alignment: &result.alignment,
                tree: &sig.tree,
                likelihood: sig.likelihood,
                delta: sig.delta,
                sd: sig.sd,
                test_1: sig.tests[0].to_string(),
                test_2: sig.tests[1].to_string(),
                test_3: sig.tests[2].to_string(),
            })?;
        }
    }
    wtr.flush()?;

    let by_alignment: BTreeMap<&str, &AlignmentResult> = results
        .iter()
        .map(|result| (result.alignment.as_str(), result))
        .collect();
    let mut json = BufWriter::new(File::create(outdir.join("results.json"))?);
    serde_json::to_writer_pretty(&mut json, &by_alignment)?;
    writeln!(json)?;

    info!(r#"Wrote results to "{}""#, tsv_path.display());
    Ok(())
}

// --------------------------------------------------
/// Expand a leading `~` to the user's home directory
fn expand_path(path: &str) -> Result<PathBuf, String> {
    match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            let home = homedir::my_home()
                .map_err(|e| e.to_string())?
                .ok_or_else(|| "Cannot find home directory".to_string())?;
            Ok(home.join(rest.trim_start_matches('/')))
        }
        _ => Ok(PathBuf::from(path)),
    }
}
