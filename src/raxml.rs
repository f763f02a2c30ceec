use crate::error::{PipelineError, PipelineResult};
use anyhow::{anyhow, Result};
use glob::{glob, Pattern};
use log::{debug, info};
use rand::Rng;
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

/// Executable looked up on `PATH` by default
pub const DEFAULT_RAXML: &str = "raxmlHPC-SSE3";

/// GTR with gamma-distributed rate heterogeneity
pub const MODEL: &str = "GTRGAMMA";

/// Per-replicate scratch files RAxML leaves for a multi-search run
const SCRATCH_PREFIXES: &[&str] =
    &["RAxML_log", "RAxML_parsimonyTree", "RAxML_result"];

/// Runs RAxML in one of its tree-search or test modes.
///
/// Every invocation runs inside an explicit working directory and
/// communicates only through files RAxML names after the `-n` run name.
#[derive(Debug, Clone)]
pub struct Raxml {
    program: PathBuf,
    searches: usize,
}

impl Raxml {
    // --------------------------------------------------
    pub fn new(program: &Path, searches: usize) -> Self {
        Raxml {
            program: program.to_path_buf(),
            searches,
        }
    }

    // --------------------------------------------------
    /// Find `name` on `PATH` (or as a path) and make it absolute so it
    /// still works from the per-alignment working directories
    pub fn locate(name: &str, searches: usize) -> Result<Self> {
        let program = which::which(name)
            .map_err(|e| anyhow!(r#"Cannot find "{name}": {e}"#))?;
        let program = std::path::absolute(&program)?;
        Ok(Self::new(&program, searches))
    }

    // --------------------------------------------------
    pub fn program(&self) -> &Path {
        &self.program
    }

    // --------------------------------------------------
    /// Unconstrained ML search, returns `RAxML_bestTree.<name>.BEST`
    pub fn best_tree(
        &self,
        working_dir: &Path,
        alignment: &Path,
        name: &str,
    ) -> PipelineResult<PathBuf> {
        let run_name = format!("{name}.BEST");
        self.search(working_dir, alignment, &run_name, vec![])
    }

    // --------------------------------------------------
    /// ML search with `constraint` as backbone, returns
    /// `RAxML_bestTree.<name>.<constraint_name>.constraint.BEST`
    pub fn constrained_tree(
        &self,
        working_dir: &Path,
        alignment: &Path,
        name: &str,
        constraint_name: &str,
        constraint: &Path,
    ) -> PipelineResult<PathBuf> {
        let run_name = format!("{name}.{constraint_name}.constraint.BEST");
        self.search(
            working_dir,
            alignment,
            &run_name,
            vec!["-g".to_string(), path_arg(constraint)],
        )
    }

    // --------------------------------------------------
    /// Test `alternatives` against `best_tree`, returns
    /// `RAxML_info.<name>.constraints.SHTEST`
    pub fn significance_test(
        &self,
        working_dir: &Path,
        alignment: &Path,
        name: &str,
        best_tree: &Path,
        alternatives: &Path,
    ) -> PipelineResult<PathBuf> {
        let run_name = format!("{name}.constraints.SHTEST");
        let args = vec![
            "-f".to_string(),
            "H".to_string(),
            "-m".to_string(),
            MODEL.to_string(),
            "-t".to_string(),
            path_arg(best_tree),
            "-z".to_string(),
            path_arg(alternatives),
            "-s".to_string(),
            path_arg(alignment),
            "-n".to_string(),
            run_name.clone(),
        ];
        self.execute(working_dir, args)?;
        expect_output(
            working_dir,
            &format!("RAxML_info.{run_name}"),
            &self.program,
        )
    }

    // --------------------------------------------------
    /// Per-site log likelihoods for every tree in `trees`, returns
    /// `RAxML_perSiteLLs.<name>.SITELH`
    pub fn site_likelihoods(
        &self,
        working_dir: &Path,
        alignment: &Path,
        name: &str,
        trees: &Path,
    ) -> PipelineResult<PathBuf> {
        let run_name = format!("{name}.SITELH");
        let args = vec![
            "-f".to_string(),
            "g".to_string(),
            "-m".to_string(),
            MODEL.to_string(),
            "-z".to_string(),
            path_arg(trees),
            "-s".to_string(),
            path_arg(alignment),
            "-n".to_string(),
            run_name.clone(),
        ];
        self.execute(working_dir, args)?;
        expect_output(
            working_dir,
            &format!("RAxML_perSiteLLs.{run_name}"),
            &self.program,
        )
    }

    // --------------------------------------------------
    fn search(
        &self,
        working_dir: &Path,
        alignment: &Path,
        run_name: &str,
        extra: Vec<String>,
    ) -> PipelineResult<PathBuf> {
        let args =
            [extra, search_args(alignment, run_name, self.searches)].concat();
        self.execute(working_dir, args)?;
        let best = expect_output(
            working_dir,
            &format!("RAxML_bestTree.{run_name}"),
            &self.program,
        )?;

        let removed = cleanup_run_files(working_dir, run_name)?;
        debug!("Removed {removed} scratch files for {run_name}");
        Ok(best)
    }

    // --------------------------------------------------
    fn execute(
        &self,
        working_dir: &Path,
        mut args: Vec<String>,
    ) -> PipelineResult<()> {
        let working_dir = working_dir.canonicalize()?;
        args.extend_from_slice(&["-w".to_string(), path_arg(&working_dir)]);
        info!(r#"Running "{} {}""#, self.program.display(), args.join(" "));

        let res = Command::new(&self.program)
            .args(&args)
            .current_dir(&working_dir)
            .output()?;

        if !res.status.success() {
            let stderr =
                String::from_utf8_lossy(&res.stderr).trim().to_string();
            let stderr = if stderr.is_empty() {
                // RAxML reports most errors on stdout
                String::from_utf8_lossy(&res.stdout).trim().to_string()
            } else {
                stderr
            };
            return Err(PipelineError::Subprocess {
                program: self.program.display().to_string(),
                stderr,
            });
        }

        Ok(())
    }
}

// --------------------------------------------------
fn search_args(
    alignment: &Path,
    run_name: &str,
    searches: usize,
) -> Vec<String> {
    let seed: u32 = rand::rng().random_range(1..100_000_000);
    vec![
        "-m".to_string(),
        MODEL.to_string(),
        "-p".to_string(),
        seed.to_string(),
        "-s".to_string(),
        path_arg(alignment),
        "-N".to_string(),
        searches.to_string(),
        "-n".to_string(),
        run_name.to_string(),
    ]
}

// --------------------------------------------------
fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

// --------------------------------------------------
fn expect_output(
    working_dir: &Path,
    file_name: &str,
    program: &Path,
) -> PipelineResult<PathBuf> {
    let path = working_dir.join(file_name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(PipelineError::Subprocess {
            program: program.display().to_string(),
            stderr: format!("expected output {} was not created", path.display()),
        })
    }
}

// --------------------------------------------------
/// Delete the `RAxML_{log,parsimonyTree,result}.<run_name>.RUN.*` files of
/// one search, returning how many were removed
pub fn cleanup_run_files(
    working_dir: &Path,
    run_name: &str,
) -> PipelineResult<usize> {
    let dir = Pattern::escape(&working_dir.to_string_lossy());
    let run_name = Pattern::escape(run_name);
    let mut removed = 0;

    for prefix in SCRATCH_PREFIXES {
        let pattern = format!("{dir}/{prefix}.{run_name}.RUN.*");
        let paths = glob(&pattern)
            .map_err(|e| PipelineError::Input(format!("{pattern}: {e}")))?;
        for path in paths {
            let path = path.map_err(|e| PipelineError::Io(e.into()))?;
            fs::remove_file(&path)?;
            removed += 1;
        }
    }

    Ok(removed)
}
