use crate::{
    alignment::Alignment,
    error::{PipelineError, PipelineResult},
    tree::Topology,
};
use log::debug;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

/// Fewest taxa a pruned constraint may keep
pub const MIN_CONSTRAINT_TAXA: usize = 3;

// --------------------------------------------------
/// Prune a constraint topology to the alignment's taxa and give every
/// remaining branch with a length a length of 1.0
pub fn normalize_constraint(
    name: &str,
    newick: &str,
    alignment: &Alignment,
) -> PipelineResult<Topology> {
    let mut topology = Topology::parse(newick).map_err(|e| {
        PipelineError::Input(format!(r#"Constraint "{name}": {e}"#))
    })?;

    let keep: BTreeSet<String> = topology
        .leaf_labels()
        .intersection(&alignment.taxa)
        .cloned()
        .collect();

    if keep.len() < MIN_CONSTRAINT_TAXA {
        return Err(PipelineError::Constraint {
            constraint: name.to_string(),
            alignment: alignment.file_name(),
            kept: keep.len(),
        });
    }

    let dropped: Vec<_> =
        topology.leaf_labels().difference(&keep).cloned().collect();
    if !dropped.is_empty() {
        debug!("{}: pruned {dropped:?} from {name}", alignment.name);
    }

    topology.retain_leaves(&keep);
    topology.set_unit_branch_lengths();
    Ok(topology)
}

// --------------------------------------------------
/// Normalize a constraint and write it to
/// `<working_dir>/<alignment>.<name>.constraint.tre`
pub fn write_constraint(
    working_dir: &Path,
    name: &str,
    newick: &str,
    alignment: &Alignment,
) -> PipelineResult<PathBuf> {
    let topology = normalize_constraint(name, newick, alignment)?;
    let path =
        working_dir.join(format!("{}.{name}.constraint.tre", alignment.name));
    fs::write(&path, format!("{}\n", topology.to_newick()))?;
    Ok(path)
}
