use crate::{
    error::{PipelineError, PipelineResult},
    merge::TreeIndexMap,
};
use anyhow::{anyhow, bail, Result};
use regex::Regex;
use serde::Serialize;
use std::{fmt, fs, path::Path};

/// Outcome of one significance threshold, e.g. "Yes (5%)"
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignificanceCall {
    pub label: String,
    pub confidence: u32,
}

impl SignificanceCall {
    pub fn is_worse(&self) -> bool {
        self.label.eq_ignore_ascii_case("yes")
    }
}

impl fmt::Display for SignificanceCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}%)", self.label, self.confidence)
    }
}

/// One alternative tree compared against the best tree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignificanceResult {
    pub tree: String,
    pub likelihood: f64,
    pub delta: f64,
    pub sd: f64,
    pub tests: [SignificanceCall; 3],
}

// --------------------------------------------------
/// Extract every "Tree: ... Significantly Worse: ..." block from a
/// significance-test report. Text outside the blocks is ignored.
pub fn parse_report(
    text: &str,
    tree_map: &TreeIndexMap,
) -> Result<Vec<SignificanceResult>> {
    let block = Regex::new(
        r"(?x)
        Tree:\s+(\d+)\s+
        Likelihood:\s+(-?\d+\.\d+)\s+
        D\(LH\):\s+(-?\d+\.\d+)\s+
        SD:\s+(\d+\.\d+)\s+
        Significantly\s+Worse:\s+
        (\w+)\s+\((\d+)\s*%\),\s*
        (\w+)\s+\((\d+)\s*%\),\s*
        (\w+)\s+\((\d+)\s*%\)",
    )?;

    let mut results = vec![];
    for caps in block.captures_iter(text) {
        let index: usize = caps[1].parse()?;
        let source = tree_map
            .get(index)
            .ok_or_else(|| anyhow!("tree {index} is not in the tree map"))?;

        let call = |label: usize, pct: usize| -> Result<SignificanceCall> {
            Ok(SignificanceCall {
                label: caps[label].to_string(),
                confidence: caps[pct].parse()?,
            })
        };

        results.push(SignificanceResult {
            tree: source.name.clone(),
            likelihood: caps[2].parse()?,
            delta: caps[3].parse()?,
            sd: caps[4].parse()?,
            tests: [call(5, 6)?, call(7, 8)?, call(9, 10)?],
        });
    }

    if results.is_empty() {
        bail!("no significance-test blocks found");
    }

    if results.len() != tree_map.len() {
        bail!(
            "expected {} significance-test blocks, found {}",
            tree_map.len(),
            results.len()
        );
    }

    Ok(results)
}

// --------------------------------------------------
pub fn read_report(
    path: &Path,
    tree_map: &TreeIndexMap,
) -> PipelineResult<Vec<SignificanceResult>> {
    let text = fs::read_to_string(path)?;
    parse_report(&text, tree_map).map_err(|e| PipelineError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
