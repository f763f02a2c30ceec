use crate::{
    error::{PipelineError, PipelineResult},
    tree::Topology,
};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// Where a tree in a merged file came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeSource {
    /// Constraint name, or "best" for the unconstrained tree
    pub name: String,
    pub path: PathBuf,
}

impl TreeSource {
    pub fn new(name: &str, path: &Path) -> Self {
        TreeSource {
            name: name.to_string(),
            path: path.to_path_buf(),
        }
    }
}

/// Position of each tree in a merged file to its source.
///
/// Positions are assigned in insertion order starting at zero and never
/// change once assigned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeIndexMap(BTreeMap<usize, TreeSource>);

impl TreeIndexMap {
    // --------------------------------------------------
    /// Append a source at the next free position
    pub fn push(&mut self, source: TreeSource) -> usize {
        let index = self.0.keys().next_back().map_or(0, |last| last + 1);
        self.0.insert(index, source);
        index
    }

    pub fn get(&self, index: usize) -> Option<&TreeSource> {
        self.0.get(&index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&usize, &TreeSource)> {
        self.0.iter()
    }
}

// --------------------------------------------------
/// Concatenate single-tree files into one multi-tree file at `outpath`,
/// one tree per line in the order given
pub fn merge_trees(
    sources: &[TreeSource],
    outpath: &Path,
) -> PipelineResult<(PathBuf, TreeIndexMap)> {
    let mut map = TreeIndexMap::default();
    for source in sources {
        map.push(source.clone());
    }

    write_merged(&map, outpath)?;
    Ok((outpath.to_path_buf(), map))
}

// --------------------------------------------------
/// Merge the trees of `map` followed by `reference`, which takes the next
/// position
pub fn merge_with_reference(
    map: &TreeIndexMap,
    reference: TreeSource,
    outpath: &Path,
) -> PipelineResult<(PathBuf, TreeIndexMap)> {
    let mut map = map.clone();
    map.push(reference);
    write_merged(&map, outpath)?;
    Ok((outpath.to_path_buf(), map))
}

// --------------------------------------------------
fn write_merged(map: &TreeIndexMap, outpath: &Path) -> PipelineResult<()> {
    if map.is_empty() {
        return Err(PipelineError::Input(format!(
            "No trees to merge into {}",
            outpath.display()
        )));
    }

    let mut output = BufWriter::new(fs::File::create(outpath)?);
    for (_, source) in map.iter() {
        let tree = read_single_tree(&source.path)?;
        writeln!(output, "{}", tree.to_newick())?;
    }
    output.flush()?;
    Ok(())
}

// --------------------------------------------------
fn read_single_tree(path: &Path) -> PipelineResult<Topology> {
    let parse_err = |reason: String| PipelineError::Parse {
        path: path.to_path_buf(),
        reason,
    };

    let text = fs::read_to_string(path)?;
    let mut trees =
        Topology::parse_all(&text).map_err(|e| parse_err(e.to_string()))?;
    match trees.len() {
        1 => Ok(trees.remove(0)),
        n => Err(parse_err(format!("expected one tree, found {n}"))),
    }
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::{merge_trees, merge_with_reference, TreeIndexMap, TreeSource};
    use crate::error::PipelineError;
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::{fs, path::Path};
    use tempfile::tempdir;

    fn write_tree(dir: &Path, name: &str, newick: &str) -> Result<TreeSource> {
        let path = dir.join(format!("RAxML_bestTree.uce-1.{name}.constraint.BEST"));
        fs::write(&path, format!("{newick}\n"))?;
        Ok(TreeSource::new(name, &path))
    }

    #[test]
    fn test_merge_trees() -> Result<()> {
        let dir = tempdir()?;
        let sources = vec![
            write_tree(dir.path(), "t0", "((a_1:0.1,b_2:0.2):0.3,c_3:0.4);")?,
            write_tree(dir.path(), "t1", "(a_1:0.1,(b_2:0.2,c_3:0.4):0.3);")?,
            write_tree(dir.path(), "t2", "((a_1:0.1,c_3:0.4):0.3,b_2:0.2);")?,
        ];
        let outpath = dir.path().join("uce-1.MERGED.constraint.tre");
        let (merged, map) = merge_trees(&sources, &outpath)?;

        assert_eq!(merged, outpath);
        assert_eq!(map.len(), 3);
        for (i, source) in sources.iter().enumerate() {
            assert_eq!(map.get(i), Some(source));
        }
        assert_eq!(
            fs::read_to_string(&merged)?,
            "((a_1:0.1,b_2:0.2):0.3,c_3:0.4);\n\
            (a_1:0.1,(b_2:0.2,c_3:0.4):0.3);\n\
            ((a_1:0.1,c_3:0.4):0.3,b_2:0.2);\n"
        );
        Ok(())
    }

    #[test]
    fn test_merge_with_reference() -> Result<()> {
        let dir = tempdir()?;
        let sources = vec![
            write_tree(dir.path(), "t0", "(a,b,c);")?,
            write_tree(dir.path(), "t1", "(a,(b,c));")?,
        ];
        let (_, map) =
            merge_trees(&sources, &dir.path().join("merged.tre"))?;

        let best = write_tree(dir.path(), "best", "((a,b),c);")?;
        let (merged, extended) = merge_with_reference(
            &map,
            best.clone(),
            &dir.path().join("merged.all.tre"),
        )?;

        // Existing positions are untouched
        assert_eq!(extended.len(), 3);
        assert_eq!(extended.get(0), map.get(0));
        assert_eq!(extended.get(1), map.get(1));
        assert_eq!(extended.get(2), Some(&best));
        assert_eq!(
            fs::read_to_string(merged)?,
            "(a,b,c);\n(a,(b,c));\n((a,b),c);\n"
        );
        Ok(())
    }

    #[test]
    fn test_merge_rejects_multi_tree_files() -> Result<()> {
        let dir = tempdir()?;
        let sources =
            vec![write_tree(dir.path(), "t0", "(a,b,c);\n(a,(b,c));")?];
        let res = merge_trees(&sources, &dir.path().join("merged.tre"));
        assert!(matches!(res, Err(PipelineError::Parse { .. })));
        Ok(())
    }

    #[test]
    fn test_merge_nothing() -> Result<()> {
        let dir = tempdir()?;
        let outpath = dir.path().join("merged.tre");
        let res = merge_trees(&[], &outpath);
        assert!(matches!(res, Err(PipelineError::Input(_))));
        assert!(!outpath.exists());
        Ok(())
    }

    #[test]
    fn test_index_map_push() {
        let mut map = TreeIndexMap::default();
        assert!(map.is_empty());
        assert_eq!(map.push(TreeSource::new("a", Path::new("a.tre"))), 0);
        assert_eq!(map.push(TreeSource::new("b", Path::new("b.tre"))), 1);
        assert_eq!(map.get(1).map(|s| s.name.as_str()), Some("b"));
        assert_eq!(map.get(2), None);
    }
}
