//! The JSON manifest listing which tables a `sync` run loads.
//!
//! ```json
//! {
//!   "tables": [
//!     { "name": "company_financials", "source": "data/financials.csv" },
//!     { "name": "countries", "source": "data/countries.json" },
//!     {
//!       "name": "exchange_rates",
//!       "columns": [
//!         { "name": "currency", "type": "text" },
//!         { "name": "year", "type": "integer" },
//!         { "name": "rate", "type": "double" }
//!       ],
//!       "key": ["currency", "year"],
//!       "mode": "merge",
//!       "source": "data/rates.json"
//!     }
//!   ]
//! }
//! ```
//!
//! Built-in tables only need a name and a source. Relative source paths are
//! resolved against the manifest's directory. A `.csv` source is read as CSV
//! with a header row, anything else as a JSON array.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use engine::{catalog, FileSource, LoadMode, TableJob};
use serde::Deserialize;
use warehouse::{Column, TableSpec};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub tables: Vec<TableEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableEntry {
    pub name: String,
    #[serde(default)]
    pub columns: Option<Vec<Column>>,
    #[serde(default)]
    pub key: Option<Vec<String>>,
    #[serde(default)]
    pub mode: Option<LoadMode>,
    pub source: PathBuf,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read manifest {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&raw, base).with_context(|| format!("invalid manifest {}", path.display()))
    }

    pub fn parse(raw: &str, base_dir: &Path) -> Result<Self> {
        let mut manifest: Manifest = serde_json::from_str(raw)?;
        if manifest.tables.is_empty() {
            bail!("manifest lists no tables");
        }
        for entry in &mut manifest.tables {
            if entry.source.is_relative() {
                entry.source = base_dir.join(&entry.source);
            }
        }
        Ok(manifest)
    }

    /// One job per entry, in manifest order.
    pub fn jobs(&self) -> Result<Vec<TableJob>> {
        self.tables.iter().map(TableEntry::job).collect()
    }
}

impl TableEntry {
    /// Columns and key from the entry, or from the built-in catalog when
    /// both are omitted.
    pub fn spec(&self) -> Result<TableSpec> {
        match (&self.columns, &self.key) {
            (Some(columns), Some(key)) => {
                Ok(TableSpec::new(self.name.as_str(), columns.clone(), key.iter().cloned())?)
            }
            (None, None) => match catalog::lookup(&self.name) {
                Some(spec) => Ok(spec?),
                None => bail!(
                    "table '{}' is not built in; give its columns and key",
                    self.name
                ),
            },
            _ => bail!("table '{}' must give both columns and key, or neither", self.name),
        }
    }

    pub fn mode(&self) -> LoadMode {
        self.mode.unwrap_or_else(|| catalog::default_mode(&self.name))
    }

    pub fn job(&self) -> Result<TableJob> {
        Ok(TableJob::new(
            self.spec()?,
            self.mode(),
            FileSource::new(&self.source),
        ))
    }
}

#[cfg(test)]
mod tests {
    use engine::RecordSource;
    use warehouse::ColumnKind;

    use super::*;

    #[test]
    fn builtin_tables_need_only_name_and_source() {
        let manifest = Manifest::parse(
            r#"{"tables": [
                {"name": "company_financials", "source": "financials.json"},
                {"name": "countries", "source": "/abs/countries.json"}
            ]}"#,
            Path::new("/data"),
        )
        .unwrap();

        let financials = &manifest.tables[0];
        assert_eq!(financials.source, PathBuf::from("/data/financials.json"));
        assert_eq!(financials.spec().unwrap().key(), ["company", "year"]);
        assert_eq!(financials.mode(), LoadMode::Merge);

        let countries = &manifest.tables[1];
        assert_eq!(countries.source, PathBuf::from("/abs/countries.json"));
        assert_eq!(countries.mode(), LoadMode::TruncateThenLoad);
        assert_eq!(manifest.jobs().unwrap().len(), 2);
    }

    #[test]
    fn custom_table_with_columns_and_key() {
        let manifest = Manifest::parse(
            r#"{"tables": [{
                "name": "exchange_rates",
                "columns": [
                    {"name": "currency", "type": "text"},
                    {"name": "year", "type": "integer"},
                    {"name": "rate", "type": "double"}
                ],
                "key": ["currency", "year"],
                "mode": "truncate_then_load",
                "source": "rates.json"
            }]}"#,
            Path::new("."),
        )
        .unwrap();

        let entry = &manifest.tables[0];
        let spec = entry.spec().unwrap();
        assert_eq!(spec.columns()[2].kind, ColumnKind::Double);
        assert_eq!(entry.mode(), LoadMode::TruncateThenLoad);
    }

    #[test]
    fn unknown_table_without_columns_is_rejected() {
        let manifest = Manifest::parse(
            r#"{"tables": [{"name": "mystery", "source": "m.json"}]}"#,
            Path::new("."),
        )
        .unwrap();
        let err = manifest.jobs().unwrap_err();
        assert!(err.to_string().contains("not built in"));
    }

    #[test]
    fn key_without_columns_is_rejected() {
        let manifest = Manifest::parse(
            r#"{"tables": [{"name": "company_financials", "key": ["company"], "source": "f.json"}]}"#,
            Path::new("."),
        )
        .unwrap();
        assert!(manifest.tables[0].spec().is_err());
    }

    #[test]
    fn bad_custom_key_surfaces_spec_error() {
        let manifest = Manifest::parse(
            r#"{"tables": [{
                "name": "t",
                "columns": [{"name": "a", "type": "text"}],
                "key": ["b"],
                "source": "t.json"
            }]}"#,
            Path::new("."),
        )
        .unwrap();
        assert!(manifest.tables[0].spec().is_err());
    }

    #[test]
    fn csv_sources_are_read_as_csv() {
        let dir = std::env::temp_dir().join(format!("manifest-csv-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("countries.csv"),
            "country_code,country_name\nKOR,\"Korea, Rep.\"\n",
        )
        .unwrap();

        let manifest = Manifest::parse(
            r#"{"tables": [{"name": "countries", "source": "countries.csv"}]}"#,
            &dir,
        )
        .unwrap();
        let records = manifest.tables[0].job().unwrap().source.read().unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].get("country_name"),
            Some(&warehouse::Value::from("Korea, Rep."))
        );
    }

    #[test]
    fn empty_manifest_is_rejected() {
        assert!(Manifest::parse(r#"{"tables": []}"#, Path::new(".")).is_err());
    }
}
