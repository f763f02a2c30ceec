use crate::error::{PipelineError, PipelineResult};
use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// Extensions recognized as PHYLIP alignments
pub const ALIGNMENT_EXTENSIONS: &[&str] = &["phylip", "phy"];

/// A relaxed-PHYLIP alignment and the taxa it contains
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    pub path: PathBuf,
    pub name: String,
    pub taxa: BTreeSet<String>,
}

impl Alignment {
    // --------------------------------------------------
    pub fn read(path: &Path) -> PipelineResult<Self> {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .ok_or_else(|| {
                PipelineError::Input(format!(
                    "Cannot get alignment name from {}",
                    path.display()
                ))
            })?;

        Ok(Alignment {
            path: path.to_path_buf(),
            name,
            taxa: read_taxa(path)?,
        })
    }

    // --------------------------------------------------
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| self.name.clone())
    }
}

// --------------------------------------------------
/// Alignment files directly inside `dir`, sorted by path. Symlinks to
/// alignment files count.
pub fn find_alignments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut alignments = vec![];
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry =
            entry.map_err(|e| anyhow!("Cannot read {}: {e}", dir.display()))?;
        let path = entry.path();
        let is_alignment = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| ALIGNMENT_EXTENSIONS.contains(&ext));

        if is_alignment && path.is_file() {
            alignments.push(path.to_path_buf());
        }
    }

    alignments.sort();
    Ok(alignments)
}

// --------------------------------------------------
/// Taxon labels from a relaxed PHYLIP file.
///
/// The header gives the taxon count; each of the next that-many records
/// starts with a label ending at the first whitespace. Interleaved blocks
/// after the first carry no labels and are not read.
pub fn read_taxa(path: &Path) -> PipelineResult<BTreeSet<String>> {
    let parse_err = |reason: String| PipelineError::Parse {
        path: path.to_path_buf(),
        reason,
    };

    let contents = fs::read_to_string(path)?;
    let mut lines = contents.lines().filter(|line| !line.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| parse_err("empty alignment".to_string()))?;
    let num_taxa: usize = match header.split_whitespace().collect::<Vec<_>>()[..]
    {
        [ntax, nchar] => {
            nchar.parse::<usize>().map_err(|_| {
                parse_err(format!(r#"bad header "{header}""#))
            })?;
            ntax.parse()
                .map_err(|_| parse_err(format!(r#"bad header "{header}""#)))?
        }
        _ => return Err(parse_err(format!(r#"bad header "{header}""#))),
    };

    let mut taxa = BTreeSet::new();
    for line in lines.take(num_taxa) {
        let label = line.split_whitespace().next().unwrap_or_default();
        if !taxa.insert(label.to_string()) {
            return Err(parse_err(format!(r#"duplicate taxon "{label}""#)));
        }
    }

    if taxa.len() != num_taxa {
        return Err(parse_err(format!(
            "header declares {num_taxa} taxa, found {}",
            taxa.len()
        )));
    }

    Ok(taxa)
}

// --------------------------------------------------
/// A group is satisfied by any one of its members
pub fn satisfies_group(taxa: &BTreeSet<String>, group: &[String]) -> bool {
    group.iter().any(|taxon| taxa.contains(taxon))
}

// --------------------------------------------------
/// Fails on the first group (in config order) with no member in the alignment
pub fn check_taxon_groups(
    alignment: &Alignment,
    groups: &IndexMap<String, Vec<String>>,
) -> PipelineResult<()> {
    match groups
        .iter()
        .find(|(_, members)| !satisfies_group(&alignment.taxa, members))
    {
        Some((group, _)) => Err(PipelineError::Group {
            group: group.to_string(),
            alignment: alignment.file_name(),
        }),
        None => Ok(()),
    }
}
