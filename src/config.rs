use crate::{constraint::MIN_CONSTRAINT_TAXA, tree::Topology};
use anyhow::{anyhow, bail, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::{fs, path::Path};

/// Used in merged-tree file names, so no constraint may take it
const RESERVED_NAME: &str = "MERGED";

/// Taxon groups and constraint topologies for a run.
///
/// Read from YAML, or TOML when the file ends in `.toml`:
///
/// ```yaml
/// orders:
///   clupeiforms: [thryssa_hamiltonii2, chirocentrus_dorab2]
/// constraints:
///   ostariophysi_mono: "((danio_rerio,chanos_chanos2),thryssa_hamiltonii2);"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Group name to the taxa any one of which satisfies the group
    pub orders: IndexMap<String, Vec<String>>,

    /// Constraint name to Newick topology
    pub constraints: IndexMap<String, String>,
}

impl Config {
    // --------------------------------------------------
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read {}: {e}", path.display()))?;

        let config: Config = match path.extension().and_then(|e| e.to_str())
        {
            Some("toml") => toml::from_str(&contents).map_err(|e| {
                anyhow!("Invalid config {}: {e}", path.display())
            })?,
            _ => serde_yaml::from_str(&contents).map_err(|e| {
                anyhow!("Invalid config {}: {e}", path.display())
            })?,
        };

        config.check()?;
        Ok(config)
    }

    // --------------------------------------------------
    fn check(&self) -> Result<()> {
        if self.constraints.is_empty() {
            bail!("Config has no constraints");
        }

        for (name, members) in &self.orders {
            if members.is_empty() {
                bail!(r#"Taxon group "{name}" has no members"#);
            }
        }

        for (name, newick) in &self.constraints {
            if name.is_empty() || name.contains(['/', '\\']) {
                bail!(r#"Constraint name "{name}" is not a usable file name"#);
            }
            if name == RESERVED_NAME {
                bail!(r#"Constraint name "{name}" is reserved"#);
            }

            let topology = Topology::parse(newick)
                .map_err(|e| anyhow!(r#"Constraint "{name}": {e}"#))?;
            let num_taxa = topology.leaf_labels().len();
            if num_taxa < MIN_CONSTRAINT_TAXA {
                bail!(
                    r#"Constraint "{name}" has {num_taxa} taxa, need at least {MIN_CONSTRAINT_TAXA}"#
                );
            }
        }

        Ok(())
    }
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::Config;
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::{fs, path::PathBuf};
    use tempfile::tempdir;

    #[test]
    fn test_from_yaml() -> Result<()> {
        let config = Config::from_path(&PathBuf::from("tests/inputs/config.yaml"))?;
        assert_eq!(
            config.orders.keys().collect::<Vec<_>>(),
            ["clupeiforms", "cypriniforms"]
        );
        assert_eq!(
            config.orders["clupeiforms"],
            ["thryssa_hamiltonii2", "chirocentrus_dorab2", "dorosoma_pentense"]
        );

        // Constraint order follows the file
        assert_eq!(
            config.constraints.keys().collect::<Vec<_>>(),
            ["otocephala", "ostariophysi"]
        );
        Ok(())
    }

    #[test]
    fn test_from_toml() -> Result<()> {
        let config = Config::from_path(&PathBuf::from("tests/inputs/config.toml"))?;
        assert_eq!(config.orders.len(), 2);
        assert_eq!(config.constraints.len(), 2);
        Ok(())
    }

    #[test]
    fn test_bad_configs() -> Result<()> {
        let dir = tempdir()?;

        let path = dir.path().join("empty.yaml");
        fs::write(&path, "orders:\n  a: [x]\nconstraints: {}\n")?;
        let res = Config::from_path(&path);
        assert!(res.is_err());
        assert_eq!(res.unwrap_err().to_string(), "Config has no constraints");

        let path = dir.path().join("unbalanced.yaml");
        fs::write(&path, "orders:\n  a: [x]\nconstraints:\n  bad: \"((a,b),c;\"\n")?;
        let res = Config::from_path(&path);
        assert!(res.is_err());
        assert!(res.unwrap_err().to_string().starts_with(r#"Constraint "bad""#));

        let path = dir.path().join("nogroup.yaml");
        fs::write(&path, "orders:\n  a: []\nconstraints:\n  c: \"(a,b,c);\"\n")?;
        let res = Config::from_path(&path);
        assert!(res.is_err());
        assert_eq!(
            res.unwrap_err().to_string(),
            r#"Taxon group "a" has no members"#
        );

        for (file, newick) in [("blank.yaml", ""), ("single.yaml", "a;")] {
            let path = dir.path().join(file);
            fs::write(
                &path,
                format!("orders:\n  a: [x]\nconstraints:\n  small: \"{newick}\"\n"),
            )?;
            assert!(Config::from_path(&path).is_err());
        }

        let path = dir.path().join("pair.yaml");
        fs::write(&path, "orders:\n  a: [x]\nconstraints:\n  pair: \"(a,b);\"\n")?;
        assert_eq!(
            Config::from_path(&path).unwrap_err().to_string(),
            r#"Constraint "pair" has 2 taxa, need at least 3"#
        );

        // Would overwrite <alignment>.MERGED.constraint.tre
        let path = dir.path().join("reserved.yaml");
        fs::write(&path, "orders:\n  a: [x]\nconstraints:\n  MERGED: \"(a,b,c);\"\n")?;
        assert_eq!(
            Config::from_path(&path).unwrap_err().to_string(),
            r#"Constraint name "MERGED" is reserved"#
        );

        let res = Config::from_path(&dir.path().join("missing.yaml"));
        assert!(res.is_err());
        Ok(())
    }
}
