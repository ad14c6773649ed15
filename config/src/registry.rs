//! Route-table names registered in the `rt_tables.d` format of iproute2.
//!
//! Each table gets its own `<name>.conf` file holding a single
//! `<id> <name>` line, so tables can be added and removed independently.

use std::{fmt, fs, io, path::Path, str::FromStr};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableEntry {
    pub id: u32,
    pub name: String,
}

impl TableEntry {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn file_name(&self) -> String {
        file_name(&self.name)
    }
}

impl fmt::Display for TableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.name)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseTableEntryError {
    #[error("no table entry found")]
    Empty,

    #[error("invalid table id `{0}`")]
    InvalidId(String),

    #[error("missing table name")]
    MissingName,
}

impl FromStr for TableEntry {
    type Err = ParseTableEntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .ok_or(ParseTableEntryError::Empty)?;

        let mut fields = line.split_whitespace();
        let id = fields.next().ok_or(ParseTableEntryError::Empty)?;
        let id = id
            .parse::<u32>()
            .map_err(|_| ParseTableEntryError::InvalidId(id.to_owned()))?;
        let name = fields.next().ok_or(ParseTableEntryError::MissingName)?;

        Ok(Self::new(id, name))
    }
}

fn file_name(name: &str) -> String {
    format!("{name}.conf")
}

/// Creates or overwrites the registry file for `entry`.
pub fn write(dir: &Path, entry: &TableEntry) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(entry.file_name()), format!("{entry}\n"))
}

/// Returns the entry registered under `name`, if its file exists and parses.
pub fn read(dir: &Path, name: &str) -> io::Result<Option<TableEntry>> {
    match fs::read_to_string(dir.join(file_name(name))) {
        Ok(contents) => Ok(contents.parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Every parsable entry in `dir`. A missing directory holds no entries.
pub fn list(dir: &Path) -> io::Result<Vec<TableEntry>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e),
    };

    let mut tables = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "conf") {
            continue;
        }
        if let Ok(table) = fs::read_to_string(&path)?.parse() {
            tables.push(table);
        }
    }

    tables.sort();
    Ok(tables)
}

/// Removes the registry file for `name`. Returns whether a file was removed.
pub fn remove(dir: &Path, name: &str) -> io::Result<bool> {
    match fs::remove_file(dir.join(file_name(name))) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
