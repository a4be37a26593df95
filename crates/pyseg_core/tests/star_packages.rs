use pyseg_core::star::labels::{COORD_X, ROT, SEGMENTATION, TOMOGRAM};
use pyseg_core::star::{merge_star_files, split_star_file, StarError, StarValue, Table};

fn table_with_rows(rows: usize) -> Table {
    let mut table = Table::new([TOMOGRAM, SEGMENTATION, "psSegLabel", COORD_X, ROT]);
    for index in 0..rows {
        table
            .add_row(vec![
                StarValue::from("/data/tomo.mrc"),
                StarValue::from(format!("/data/tomo_tid_{index}_seg.mrc")),
                StarValue::from(index as i64),
                StarValue::from(0.1234567 + index as f64),
                StarValue::from(1e-9 * (index as f64 + 1.0)),
            ])
            .unwrap();
    }
    table
}

fn labels(table: &Table) -> Vec<i64> {
    table
        .iter()
        .map(|row| row.int_or("psSegLabel", -1))
        .collect()
}

#[test]
fn split_then_merge_reproduces_rows_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let in_star = dir.path().join("in.star");
    table_with_rows(7).write(&in_star).unwrap();

    let files = split_star_file(&in_star, dir.path(), 3, "graphs_").unwrap();
    let names: Vec<_> = files
        .iter()
        .map(|file| file.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["graphs_001.star", "graphs_002.star", "graphs_003.star"]);
    assert_eq!(Table::read(&files[2]).unwrap().len(), 1);

    let merged = merge_star_files(&files, dir.path().join("merged.star")).unwrap();
    assert_eq!(labels(&merged), (0..7).collect::<Vec<_>>());
    let reread = Table::read(dir.path().join("merged.star")).unwrap();
    assert_eq!(reread.column_names(), merged.column_names());
    assert_eq!(reread, table_with_rows(7));
}

#[test]
fn exact_multiple_produces_no_remainder_file() {
    let dir = tempfile::tempdir().unwrap();
    let in_star = dir.path().join("in.star");
    table_with_rows(6).write(&in_star).unwrap();

    let files = split_star_file(&in_star, dir.path(), 2, "pkg_").unwrap();
    assert_eq!(files.len(), 3);
    assert!(files
        .iter()
        .all(|file| Table::read(file).unwrap().len() == 2));
}

#[test]
fn empty_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let in_star = dir.path().join("in.star");
    table_with_rows(0).write(&in_star).unwrap();

    let err = split_star_file(&in_star, dir.path(), 2, "pkg_").unwrap_err();
    assert!(matches!(err, StarError::EmptyTable(_)));
}

#[test]
fn merge_rejects_different_columns() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.star");
    let second = dir.path().join("b.star");
    table_with_rows(1).write(&first).unwrap();
    let mut other = Table::new([TOMOGRAM]);
    other.add_row(vec![StarValue::from("/data/x.mrc")]).unwrap();
    other.write(&second).unwrap();

    let err = merge_star_files(&[first, second], dir.path().join("out.star")).unwrap_err();
    assert!(matches!(err, StarError::ColumnMismatch(_)));
}
