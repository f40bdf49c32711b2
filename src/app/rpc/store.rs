use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::app::rpc::envelope::LoadRequest;

/// Number of header/comment lines that precede the field-name row.
const HEADER_LINES: usize = 6;

#[derive(Debug)]
pub enum StoreError {
    NotFound(PathBuf),
    Io(io::Error),
    Malformed(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(path) => write!(f, "case file not found: {}", path.display()),
            StoreError::Io(err) => write!(f, "case file io error: {err}"),
            StoreError::Malformed(reason) => write!(f, "malformed case file: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The rows of one case file. Decoding a row into a launch request happens elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseSuite {
    pub source: PathBuf,
    pub field_names: Vec<String>,
    pub cases: Vec<Vec<String>>,
}

impl CaseSuite {
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

pub trait CaseStore: Send + Sync {
    fn load(&self, request: &LoadRequest) -> Result<CaseSuite, StoreError>;
}

/// `<root>/<pkg>/<comp>_<strategy>.csv`, shared by the controller (before pushing) and the agent.
pub fn case_file_path(root: &Path, package: &str, component: &str, strategy: &str) -> PathBuf {
    root.join(package).join(format!("{component}_{strategy}.csv"))
}

/// Same layout as [`case_file_path`] for a device path, always `/`-separated.
pub fn remote_case_file_path(root: &str, package: &str, component: &str, strategy: &str) -> String {
    format!(
        "{}/{package}/{component}_{strategy}.csv",
        root.trim_end_matches('/')
    )
}

pub struct CsvCaseStore {
    root: PathBuf,
}

impl CsvCaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl CaseStore for CsvCaseStore {
    fn load(&self, request: &LoadRequest) -> Result<CaseSuite, StoreError> {
        let path = case_file_path(
            &self.root,
            &request.pkg_name,
            &request.comp_name,
            &request.strategy,
        );
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path))
            }
            Err(err) => return Err(StoreError::Io(err)),
        };
        parse_case_csv(&raw, path)
    }
}

pub fn parse_case_csv(raw: &str, source: PathBuf) -> Result<CaseSuite, StoreError> {
    let mut rows = split_records(raw).into_iter().skip(HEADER_LINES);
    let field_names = rows
        .next()
        .ok_or_else(|| StoreError::Malformed("missing field-name row".to_string()))?;
    let cases = rows
        .filter(|row| !(row.len() == 1 && row[0].trim().is_empty()))
        .collect();
    Ok(CaseSuite {
        source,
        field_names,
        cases,
    })
}

/// Splits CSV text into records, honouring quoted fields (which may contain commas,
/// doubled quotes and line breaks).
fn split_records(raw: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = raw.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            ',' if !in_quotes => record.push(std::mem::take(&mut field)),
            '\r' if !in_quotes => {}
            '\n' if !in_quotes => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            other => field.push(other),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}
