//! JSON datasets for the in-memory executor.
//!
//! ```json
//! {
//!   "tables": { "users": [ { "id": 1, "name": "Ann" } ] },
//!   "fixtures": [ { "sql": "SELECT COUNT(*) FROM users", "output": { "kind": "scalar", "value": 1000 } } ]
//! }
//! ```

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use queryshield_core::{mechanisms::Row, InMemoryExecutor, QueryOutput};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("unable to read dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse dataset {path}: {details}")]
    Parse { path: PathBuf, details: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Fixture {
    pub sql: String,
    pub output: QueryOutput,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<Row>>,
    #[serde(default)]
    pub fixtures: Vec<Fixture>,
}

impl Dataset {
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let contents = fs::read_to_string(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|err| DatasetError::Parse {
            path: path.to_path_buf(),
            details: err.to_string(),
        })
    }

    pub fn into_executor(self) -> InMemoryExecutor {
        let mut executor = InMemoryExecutor::new();
        for (name, rows) in self.tables {
            executor.insert_table(&name, rows);
        }
        self.fixtures
            .into_iter()
            .fold(executor, |executor, fixture| {
                executor.with_fixture(&fixture.sql, fixture.output)
            })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use queryshield_core::QueryExecutor;

    use super::*;

    #[test]
    fn loads_tables_and_fixtures() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tables": {{"Users": [{{"ID": 1}}, {{"ID": 2}}]}},
                "fixtures": [{{"sql": "SELECT 1 FROM t", "output": {{"kind": "scalar", "value": 7}}}}]}}"#
        )
        .unwrap();
        let executor = Dataset::load(file.path()).unwrap().into_executor();
        assert_eq!(
            executor.execute("SELECT COUNT(id) FROM users").unwrap(),
            QueryOutput::Scalar(2.0)
        );
        assert_eq!(
            executor.execute("select 1 from t").unwrap(),
            QueryOutput::Scalar(7.0)
        );
    }

    #[test]
    fn reports_missing_and_malformed_files() {
        assert!(matches!(
            Dataset::load(Path::new("/nonexistent/queryshield.json")),
            Err(DatasetError::Io { .. })
        ));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            Dataset::load(file.path()),
            Err(DatasetError::Parse { .. })
        ));
    }
}
