use mung::common::Mat;
use mung::dataset::Covariate;
use mung::sim_input::*;

#[test]
fn counts_tsv_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("counts.tsv");
    let file = file.to_str().expect("path");

    let counts = Mat::from_row_slice(2, 3, &[1.0, 0.0, 5.0, 2.0, 3.0, 0.0]);
    let genes: Vec<Box<str>> = vec!["g0".into(), "g1".into(), "g2".into()];

    write_counts_tsv(&counts, &genes, file).expect("write");
    let (back, genes_back) = read_counts_tsv(file).expect("read");

    assert_eq!(genes, genes_back);
    assert_eq!(counts, back);
}

#[test]
fn covariates_tsv_round_trip_keeps_column_kinds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("covars.tsv");
    let file = file.to_str().expect("path");

    let mut table = mung::dataset::CovariateTable::new();
    table
        .add_categorical("cell_type", &["A", "B", "B"])
        .expect("column");
    table
        .add_numeric("pseudotime", &[0.1, 0.5, 0.9])
        .expect("column");

    write_covariates_tsv(&table, file).expect("write");
    let back = read_covariates_tsv(file).expect("read");

    assert_eq!(back.num_cells(), 3);
    assert!(matches!(
        back.column("cell_type"),
        Some(Covariate::Categorical(_))
    ));
    match back.column("pseudotime") {
        Some(Covariate::Numeric(v)) => assert_eq!(v, &vec![0.1, 0.5, 0.9]),
        _ => panic!("pseudotime should read back numeric"),
    }
}

#[test]
fn gzipped_counts_are_read_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("counts.tsv.gz");
    let file = file.to_str().expect("path");

    let counts = Mat::from_row_slice(2, 2, &[4.0, 0.0, 1.0, 9.0]);
    let genes: Vec<Box<str>> = vec!["a".into(), "b".into()];

    write_counts_tsv(&counts, &genes, file).expect("write");
    let (back, _) = read_counts_tsv(file).expect("read");
    assert_eq!(counts, back);
}
