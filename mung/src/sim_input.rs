use crate::common::*;
use crate::dataset::{Covariate, CovariateTable};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

fn is_gzipped(file: &str) -> bool {
    Path::new(file)
        .extension()
        .map(|ext| ext == "gz")
        .unwrap_or(false)
}

pub fn open_buf_reader(file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let inner = File::open(file)?;
    if is_gzipped(file) {
        Ok(Box::new(BufReader::new(GzDecoder::new(inner))))
    } else {
        Ok(Box::new(BufReader::new(inner)))
    }
}

pub fn open_buf_writer(file: &str) -> anyhow::Result<Box<dyn Write>> {
    let inner = File::create(file)?;
    if is_gzipped(file) {
        Ok(Box::new(BufWriter::new(GzEncoder::new(
            inner,
            Compression::default(),
        ))))
    } else {
        Ok(Box::new(BufWriter::new(inner)))
    }
}

/// Read a cells x genes count matrix from a (possibly gzipped) TSV file:
/// one header line of gene names, then one row of counts per cell.
pub fn read_counts_tsv(file: &str) -> anyhow::Result<(Mat, Vec<Box<str>>)> {
    let buf = open_buf_reader(file)?;
    let mut lines = buf.lines();

    let header = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("{} is empty", file))??;
    let genes: Vec<Box<str>> = header.split('\t').map(|x| x.into()).collect();
    let d = genes.len();

    let mut values = vec![];
    let mut n = 0;
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row: Vec<f64> = line
            .split('\t')
            .map(|x| x.trim().parse::<f64>())
            .collect::<Result<_, _>>()?;
        if row.len() != d {
            return Err(anyhow::anyhow!(
                "row {} has {} fields, expected {}",
                n + 1,
                row.len(),
                d
            ));
        }
        values.extend(row);
        n += 1;
    }
    info!("read {} cells x {} genes from {}", n, d, file);
    Ok((Mat::from_row_iterator(n, d, values), genes))
}

/// Read a covariate table: one header line of column names, one row per
/// cell. A column becomes numeric iff every value parses as a float.
pub fn read_covariates_tsv(file: &str) -> anyhow::Result<CovariateTable> {
    let buf = open_buf_reader(file)?;
    let mut lines = buf.lines();

    let header = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("{} is empty", file))??;
    let names: Vec<Box<str>> = header.split('\t').map(|x| x.into()).collect();

    let mut columns: Vec<Vec<Box<str>>> = vec![vec![]; names.len()];
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != names.len() {
            return Err(anyhow::anyhow!(
                "covariate row has {} fields, expected {}",
                fields.len(),
                names.len()
            ));
        }
        for (j, field) in fields.iter().enumerate() {
            columns[j].push(field.trim().into());
        }
    }

    let mut table = CovariateTable::new();
    for (name, raw) in names.iter().zip(columns.into_iter()) {
        let numeric: Option<Vec<f64>> = raw.iter().map(|x| x.parse::<f64>().ok()).collect();
        match numeric {
            Some(values) => table.add_column(name, Covariate::Numeric(values))?,
            None => table.add_column(name, Covariate::Categorical(raw))?,
        }
    }
    info!(
        "read covariates: {} cells, columns {:?}",
        table.num_cells(),
        table.names()
    );
    Ok(table)
}

pub fn write_counts_tsv(counts_nd: &Mat, genes: &[Box<str>], file: &str) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(file)?;
    writeln!(buf, "{}", genes.join("\t"))?;
    for i in 0..counts_nd.nrows() {
        let row: Vec<String> = (0..counts_nd.ncols())
            .map(|j| format!("{}", counts_nd[(i, j)] as u64))
            .collect();
        writeln!(buf, "{}", row.join("\t"))?;
    }
    buf.flush()?;
    Ok(())
}

pub fn write_covariates_tsv(table: &CovariateTable, file: &str) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(file)?;
    let names = table.names();
    writeln!(
        buf,
        "{}",
        names.iter().map(|x| x.as_ref()).collect::<Vec<_>>().join("\t")
    )?;
    for i in 0..table.num_cells() {
        let row: Vec<String> = names
            .iter()
            .map(|name| match table.column(name) {
                Some(Covariate::Categorical(v)) => v[i].to_string(),
                Some(Covariate::Numeric(v)) => format!("{}", v[i]),
                None => String::new(),
            })
            .collect();
        writeln!(buf, "{}", row.join("\t"))?;
    }
    buf.flush()?;
    Ok(())
}
