//! Star file packaging: split one table into fixed-size groups and merge the
//! per-group results back.
//!
//! # Invariants
//! - Concatenating the split outputs in file order reproduces the input rows
//!   in order, each exactly once.
//! - Output file names are `<prefix><NNN>.star`, counter starting at 1.

use super::table::Table;
use super::StarError;
use log::info;
use std::path::{Path, PathBuf};

/// Default prefix for the vesicle packages fed to the graphs program.
pub const DEFAULT_SPLIT_PREFIX: &str = "graphs_";

/// Reads `in_star` and splits it with [`split_table`].
pub fn split_star_file(
    in_star: impl AsRef<Path>,
    out_dir: impl AsRef<Path>,
    group_size: usize,
    prefix: &str,
) -> Result<Vec<PathBuf>, StarError> {
    let in_star = in_star.as_ref();
    let table = Table::read(in_star)?;
    if table.is_empty() {
        return Err(StarError::EmptyTable(in_star.to_path_buf()));
    }
    split_table(&table, out_dir, group_size, prefix)
}

/// Writes consecutive groups of `group_size` rows to separate files.
///
/// The last file holds the remainder when the row count is not a multiple of
/// `group_size`. Existing files with the same names are overwritten.
pub fn split_table(
    table: &Table,
    out_dir: impl AsRef<Path>,
    group_size: usize,
    prefix: &str,
) -> Result<Vec<PathBuf>, StarError> {
    let out_dir = out_dir.as_ref();
    if group_size == 0 {
        return Err(StarError::InvalidGroupSize(group_size));
    }
    if table.is_empty() {
        return Err(StarError::EmptyTable(out_dir.to_path_buf()));
    }

    let rows: Vec<_> = table.iter().collect();
    let mut out_files = Vec::with_capacity(rows.len().div_ceil(group_size));
    let mut group = Table::new(table.column_names().iter().cloned());
    for (index, chunk) in rows.chunks(group_size).enumerate() {
        group.clear_rows();
        for row in chunk {
            group.append_row(row);
        }
        let out_file = out_dir.join(format!("{prefix}{:03}.star", index + 1));
        group.write(&out_file)?;
        out_files.push(out_file);
    }

    info!(
        "event=star_split module=star status=ok rows={} group_size={} files={}",
        table.len(),
        group_size,
        out_files.len()
    );
    Ok(out_files)
}

/// Concatenates tables sharing one column set, in the given order.
///
/// Column order may differ between inputs; values are matched by label and
/// the first file's declaration order is kept.
pub fn merge_star_files<P: AsRef<Path>>(
    in_stars: &[P],
    out_star: impl AsRef<Path>,
) -> Result<Table, StarError> {
    let out_star = out_star.as_ref();
    let Some(first) = in_stars.first() else {
        return Err(StarError::NoInputs);
    };

    let first = Table::read(first)?;
    let mut merged = Table::new(first.column_names().iter().cloned());
    for row in first.iter() {
        merged.append_row(&row);
    }

    for path in &in_stars[1..] {
        let path = path.as_ref();
        let table = Table::read(path)?;
        let same_columns = table.column_names().len() == merged.column_names().len()
            && merged
                .column_names()
                .iter()
                .all(|column| table.has_column(column));
        if !same_columns {
            return Err(StarError::ColumnMismatch(path.to_path_buf()));
        }
        for row in table.iter() {
            merged.append_row(&row);
        }
    }

    merged.write(out_star)?;
    info!(
        "event=star_merge module=star status=ok files={} rows={}",
        in_stars.len(),
        merged.len()
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::split_table;
    use crate::star::{StarError, Table};

    fn numbered(rows: i64) -> Table {
        let mut table = Table::new(["id", "name"]);
        for id in 0..rows {
            table
                .add_row(vec![id.into(), format!("v_{id}").into()])
                .expect("row width matches");
        }
        table
    }

    #[test]
    fn rejects_zero_group_size() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = split_table(&numbered(3), dir.path(), 0, "g_").expect_err("zero must fail");
        assert!(matches!(err, StarError::InvalidGroupSize(0)));
    }

    #[test]
    fn rejects_empty_table() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = split_table(&numbered(0), dir.path(), 2, "g_").expect_err("empty must fail");
        assert!(matches!(err, StarError::EmptyTable(_)));
    }

    #[test]
    fn names_files_with_three_digit_counter() {
        let dir = tempfile::tempdir().expect("temp dir");
        let files = split_table(&numbered(3), dir.path(), 1, "graphs_").expect("split");
        let names: Vec<_> = files
            .iter()
            .map(|path| path.file_name().expect("file name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["graphs_001.star", "graphs_002.star", "graphs_003.star"]);
    }
}
