//! Table discovery: turning a source location into table descriptors

use clap::ValueEnum;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{ExportError, Result};
use crate::model::{SourceRef, TableDescriptor};
use crate::selector::TableSelector;
use crate::source::{DelimitedOptions, DumpDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    /// Live PostgreSQL or SQLite database
    Db,
    /// SQL dump file
    Dump,
    /// Delimited text file or directory of files
    Files,
}

/// Parse `table=column` order key assignments
pub fn parse_order_keys<S: AsRef<str>>(assignments: &[S]) -> Result<HashMap<String, String>> {
    assignments
        .iter()
        .map(|assignment| {
            let assignment = assignment.as_ref();
            match assignment.split_once('=') {
                Some((table, column)) if !table.trim().is_empty() && !column.trim().is_empty() => {
                    Ok((table.trim().to_string(), column.trim().to_string()))
                },
                _ => Err(ExportError::Config(format!(
                    "order key '{}' must look like table=column",
                    assignment
                ))),
            }
        })
        .collect()
}

/// Descriptors for the selected tables of a live database
pub async fn plan_database(
    database: &dyn Database,
    selector: &TableSelector,
    order_keys: &HashMap<String, String>,
    output_root: &Path,
) -> Result<Vec<TableDescriptor>> {
    let available = database.list_tables().await?;
    let selected = selector.select(&available)?;

    for table in order_keys.keys() {
        if !selected.contains(table) {
            warn!(table = %table, "Order key given for a table that is not exported");
        }
    }

    info!(discovered = available.len(), selected = selected.len(), "Planned database tables");
    Ok(selected
        .into_iter()
        .map(|table| {
            let source = SourceRef::Query {
                table: table.clone(),
                order_key: order_keys.get(&table).cloned(),
            };
            TableDescriptor::new(table, source, output_root)
        })
        .collect())
}

/// Descriptors for the selected tables of a SQL dump
pub fn plan_dump(
    document: &DumpDocument,
    selector: &TableSelector,
    output_root: &Path,
) -> Result<Vec<TableDescriptor>> {
    let available = document.list_tables();
    let selected = selector.select(&available)?;

    info!(discovered = available.len(), selected = selected.len(), "Planned dump tables");
    Ok(selected
        .into_iter()
        .map(|table| {
            let source = SourceRef::Dump {
                table: table.clone(),
            };
            TableDescriptor::new(table, source, output_root)
        })
        .collect())
}

/// Descriptors for delimited files
///
/// A single file is one table named by its stem. In a directory, each
/// matching file is a table named by its stem, and each subdirectory is a
/// table named by the directory, made of its matching files in name order.
pub async fn plan_files(
    location: &Path,
    options: &DelimitedOptions,
    selector: &TableSelector,
    output_root: &Path,
) -> Result<Vec<TableDescriptor>> {
    let metadata = tokio::fs::metadata(location)
        .await
        .map_err(|e| ExportError::io(location, e))?;

    let mut tables: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

    if metadata.is_file() {
        tables.insert(file_stem(location), vec![location.to_path_buf()]);
    } else {
        for entry in sorted_entries(location).await? {
            if entry.is_dir() {
                let files: Vec<PathBuf> = sorted_entries(&entry)
                    .await?
                    .into_iter()
                    .filter(|p| p.is_file() && options.matches_extension(p))
                    .collect();
                if files.is_empty() {
                    debug!(dir = %entry.display(), "No delimited files in subdirectory");
                    continue;
                }
                insert_unique(&mut tables, file_name(&entry), files)?;
            } else if options.matches_extension(&entry) {
                insert_unique(&mut tables, file_stem(&entry), vec![entry])?;
            }
        }
    }

    let available: Vec<String> = tables.keys().cloned().collect();
    let selected = selector.select(&available)?;

    info!(discovered = available.len(), selected = selected.len(), "Planned file tables");
    Ok(selected
        .into_iter()
        .filter_map(|name| {
            let paths = tables.remove(&name)?;
            Some(TableDescriptor::new(
                name,
                SourceRef::Files { paths },
                output_root,
            ))
        })
        .collect())
}

async fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| ExportError::io(dir, e))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ExportError::io(dir, e))?
    {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

fn insert_unique(
    tables: &mut BTreeMap<String, Vec<PathBuf>>,
    name: String,
    paths: Vec<PathBuf>,
) -> Result<()> {
    if tables.contains_key(&name) {
        return Err(ExportError::Config(format!(
            "more than one input maps to table '{}'",
            name
        )));
    }
    tables.insert(name, paths);
    Ok(())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "table".to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "table".to_string())
}
