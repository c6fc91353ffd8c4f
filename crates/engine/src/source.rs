//! Where records come from.
//!
//! The orchestrator treats every source as a finite, restartable sequence of
//! records. It does not care whether they came from a file, another database
//! or an API.

use std::path::{Path, PathBuf};

use thiserror::Error;
use warehouse::{Record, Value};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("could not read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{path}' is not a JSON array of flat objects: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("'{path}' is not a well-formed CSV file: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// A finite sequence of records. `read` may be called more than once and
/// yields the same records each time.
pub trait RecordSource: Send + Sync {
    /// Short human-readable origin, used in logs.
    fn describe(&self) -> String;

    fn read(&self) -> Result<Vec<Record>, SourceError>;
}

/// Records already in memory.
impl RecordSource for Vec<Record> {
    fn describe(&self) -> String {
        format!("{} in-memory records", self.len())
    }

    fn read(&self) -> Result<Vec<Record>, SourceError> {
        Ok(self.clone())
    }
}

/// A JSON file holding an array of flat objects, one per record.
///
/// ```json
/// [{"company": "Apple", "year": 2023, "revenue_usd": 383285000000}]
/// ```
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSource for JsonFileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn read(&self) -> Result<Vec<Record>, SourceError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| SourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| SourceError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

/// A CSV file with a header row naming the columns.
///
/// Cells are trimmed. An empty cell is `Null`; a cell whose text is exactly
/// an integer's or a float's canonical form becomes `Int` or `Float`; any
/// other cell stays text, so codes such as `007` survive. Loading coerces
/// the remaining text to each column's kind.
#[derive(Debug, Clone)]
pub struct CsvFileSource {
    path: PathBuf,
    delimiter: u8,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn csv_error(&self, source: csv::Error) -> SourceError {
        SourceError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}

impl RecordSource for CsvFileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn read(&self) -> Result<Vec<Record>, SourceError> {
        let file = std::fs::File::open(&self.path).map_err(|source| SourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_reader(file);

        let headers = reader.headers().map_err(|e| self.csv_error(e))?.clone();
        let mut records = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| self.csv_error(e))?;
            let record: Record = headers
                .iter()
                .zip(row.iter())
                .map(|(column, cell)| (column, csv_cell(cell)))
                .collect();
            records.push(record);
        }
        Ok(records)
    }
}

fn csv_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        if i.to_string() == cell {
            return Value::Int(i);
        }
    }
    if let Ok(f) = cell.parse::<f64>() {
        if f.is_finite() && f.to_string() == cell {
            return Value::Float(f);
        }
    }
    Value::from(cell)
}

/// A record file whose format follows its extension: `.csv` is CSV,
/// anything else JSON.
#[derive(Debug, Clone)]
pub enum FileSource {
    Csv(CsvFileSource),
    Json(JsonFileSource),
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let is_csv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv {
            Self::Csv(CsvFileSource::new(path))
        } else {
            Self::Json(JsonFileSource::new(path))
        }
    }
}

impl RecordSource for FileSource {
    fn describe(&self) -> String {
        match self {
            Self::Csv(source) => source.describe(),
            Self::Json(source) => source.describe(),
        }
    }

    fn read(&self) -> Result<Vec<Record>, SourceError> {
        match self {
            Self::Csv(source) => source.read(),
            Self::Json(source) => source.read(),
        }
    }
}
