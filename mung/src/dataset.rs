use crate::common::*;

/// One covariate column: either string-valued levels or numeric values
#[derive(Debug, Clone)]
pub enum Covariate {
    Categorical(Vec<Box<str>>),
    Numeric(Vec<f64>),
}

impl Covariate {
    pub fn len(&self) -> usize {
        match self {
            Covariate::Categorical(v) => v.len(),
            Covariate::Numeric(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-cell covariate table with ordered, named columns
#[derive(Debug, Clone, Default)]
pub struct CovariateTable {
    names: Vec<Box<str>>,
    columns: Vec<Covariate>,
}

impl CovariateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_column(&mut self, name: &str, column: Covariate) -> anyhow::Result<()> {
        if !self.columns.is_empty() && self.num_cells() != column.len() {
            return Err(anyhow::anyhow!(
                "covariate column {} has {} cells, expected {}",
                name,
                column.len(),
                self.num_cells()
            ));
        }
        self.names.push(name.into());
        self.columns.push(column);
        Ok(())
    }

    pub fn add_categorical<S: AsRef<str>>(&mut self, name: &str, values: &[S]) -> anyhow::Result<()> {
        let col = values.iter().map(|x| x.as_ref().into()).collect();
        self.add_column(name, Covariate::Categorical(col))
    }

    pub fn add_numeric(&mut self, name: &str, values: &[f64]) -> anyhow::Result<()> {
        self.add_column(name, Covariate::Numeric(values.to_vec()))
    }

    pub fn num_cells(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn names(&self) -> &[Box<str>] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<&Covariate> {
        self.names
            .iter()
            .position(|n| n.as_ref() == name)
            .map(|j| &self.columns[j])
    }

    pub fn require_column(&self, name: &str) -> anyhow::Result<&Covariate> {
        self.column(name)
            .ok_or_else(|| anyhow::anyhow!("covariate column {} not found", name))
    }
}

/// A bare-bones model formula: `~ a + b` (or just `a + b`) naming
/// covariate columns; `~ 1`, `1`, or the empty string is intercept-only.
#[derive(Debug, Clone, Default)]
pub struct Formula {
    pub terms: Vec<Box<str>>,
}

impl Formula {
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim().trim_start_matches('~').trim();
        let terms = spec
            .split('+')
            .map(|t| t.trim())
            .filter(|t| !t.is_empty() && *t != "1")
            .map(|t| t.into())
            .collect();
        Self { terms }
    }

    pub fn intercept_only(&self) -> bool {
        self.terms.is_empty()
    }
}

impl std::str::FromStr for Formula {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(Formula::parse(s))
    }
}

#[derive(Debug, Clone)]
enum TermEncoder {
    Numeric {
        name: Box<str>,
    },
    /// sorted levels; the first is the baseline and gets no column
    Categorical {
        name: Box<str>,
        levels: Vec<Box<str>>,
    },
}

/// Deterministic design-matrix encoder captured at fit time so that the
/// same dummy coding (and the same seen-level set) applies to any later
/// covariate table.
#[derive(Debug, Clone)]
pub struct DesignEncoder {
    terms: Vec<TermEncoder>,
}

impl DesignEncoder {
    pub fn build(table: &CovariateTable, formula: &Formula) -> anyhow::Result<Self> {
        let mut terms = Vec::with_capacity(formula.terms.len());
        for name in formula.terms.iter() {
            match table.require_column(name)? {
                Covariate::Numeric(_) => terms.push(TermEncoder::Numeric { name: name.clone() }),
                Covariate::Categorical(values) => {
                    let mut levels: Vec<Box<str>> = values.to_vec();
                    levels.sort();
                    levels.dedup();
                    if levels.len() < 2 {
                        return Err(anyhow::anyhow!(
                            "categorical covariate {} has a single level",
                            name
                        ));
                    }
                    terms.push(TermEncoder::Categorical {
                        name: name.clone(),
                        levels,
                    });
                }
            }
        }
        Ok(Self { terms })
    }

    pub fn num_coefficients(&self) -> usize {
        1 + self
            .terms
            .iter()
            .map(|t| match t {
                TermEncoder::Numeric { .. } => 1,
                TermEncoder::Categorical { levels, .. } => levels.len() - 1,
            })
            .sum::<usize>()
    }

    /// Encode a covariate table into an `n x p` design matrix with an
    /// intercept column first. Fails on missing columns and on
    /// categorical levels never seen at fit time.
    pub fn encode(&self, table: &CovariateTable) -> anyhow::Result<Mat> {
        let n = table.num_cells();
        let p = self.num_coefficients();
        let mut x_np = Mat::zeros(n, p);
        for i in 0..n {
            x_np[(i, 0)] = 1.0;
        }

        let mut j = 1;
        for term in self.terms.iter() {
            match term {
                TermEncoder::Numeric { name } => {
                    match table.require_column(name)? {
                        Covariate::Numeric(values) => {
                            for i in 0..n {
                                x_np[(i, j)] = values[i];
                            }
                        }
                        Covariate::Categorical(_) => {
                            return Err(anyhow::anyhow!(
                                "covariate {} was numeric at fit time",
                                name
                            ));
                        }
                    }
                    j += 1;
                }
                TermEncoder::Categorical { name, levels } => {
                    match table.require_column(name)? {
                        Covariate::Categorical(values) => {
                            for i in 0..n {
                                let level = &values[i];
                                let k = levels.iter().position(|l| l == level).ok_or_else(|| {
                                    anyhow::anyhow!(
                                        "level {} of covariate {} was never seen at fit time",
                                        level,
                                        name
                                    )
                                })?;
                                if k > 0 {
                                    x_np[(i, j + k - 1)] = 1.0;
                                }
                            }
                        }
                        Covariate::Numeric(_) => {
                            return Err(anyhow::anyhow!(
                                "covariate {} was categorical at fit time",
                                name
                            ));
                        }
                    }
                    j += levels.len() - 1;
                }
            }
        }
        Ok(x_np)
    }
}

/// Resolve per-cell correlation-group labels. Precedence: an explicit
/// `corr_group` column (numeric labels such as 1/2 are stringified, never
/// dropped), then the (composite) grouping formula, then a single shared
/// group.
pub fn resolve_corr_groups(
    table: &CovariateTable,
    formula: Option<&Formula>,
) -> anyhow::Result<Vec<Box<str>>> {
    let n = table.num_cells();

    if let Some(col) = table.column("corr_group") {
        return Ok(match col {
            Covariate::Categorical(values) => values.to_vec(),
            Covariate::Numeric(values) => values
                .iter()
                .map(|v| format!("{}", v).into_boxed_str())
                .collect(),
        });
    }

    let Some(formula) = formula else {
        return Ok(vec![SHARED_GROUP.into(); n]);
    };
    if formula.intercept_only() {
        return Ok(vec![SHARED_GROUP.into(); n]);
    }

    let mut labels = vec![String::new(); n];
    for name in formula.terms.iter() {
        match table.require_column(name)? {
            Covariate::Categorical(values) => {
                for i in 0..n {
                    if !labels[i].is_empty() {
                        labels[i].push('_');
                    }
                    labels[i].push_str(&values[i]);
                }
            }
            Covariate::Numeric(_) => {
                return Err(anyhow::anyhow!(
                    "correlation grouping needs categorical covariates; {} is numeric",
                    name
                ));
            }
        }
    }
    Ok(labels.into_iter().map(|s| s.into_boxed_str()).collect())
}

/// Immutable input: one or more cells x genes count assays plus the
/// per-cell covariate table
pub struct RawDataset {
    pub assays: Vec<(Box<str>, Mat)>,
    pub genes: Vec<Box<str>>,
    pub covariates: CovariateTable,
}

impl RawDataset {
    pub fn new(counts_nd: Mat, genes: Vec<Box<str>>, covariates: CovariateTable) -> Self {
        Self {
            assays: vec![("counts".into(), counts_nd)],
            genes,
            covariates,
        }
    }

    pub fn assay(&self, name: Option<&str>) -> anyhow::Result<&Mat> {
        match name {
            None => self
                .assays
                .first()
                .map(|(_, m)| m)
                .ok_or_else(|| anyhow::anyhow!("dataset has no assay")),
            Some(name) => self
                .assays
                .iter()
                .find(|(n, _)| n.as_ref() == name)
                .map(|(_, m)| m)
                .ok_or_else(|| anyhow::anyhow!("assay {} not found", name)),
        }
    }
}

/// The modeling table realized column-major: retained counts, encoded
/// designs, and per-cell correlation groups. The (cell, gene, covariate)
/// join of the long format is preserved by row/column index.
pub struct ModelingData {
    pub y_nd: Mat,
    pub genes: Vec<Box<str>>,
    pub filtered_genes: Vec<Box<str>>,
    pub x_mean_np: Mat,
    pub x_disp_nq: Mat,
    pub encoder_mean: DesignEncoder,
    pub encoder_disp: DesignEncoder,
    pub corr_groups: Vec<Box<str>>,
}

/// Stage 1: assemble the modeling dataset. Genes with fewer than
/// `min_nonzero` nonzero cells or zero variance are excluded and
/// reported as `filtered_genes`; the filter is a pure function of the
/// counts.
pub fn build_modeling_data(
    raw: &RawDataset,
    assay: Option<&str>,
    mean_formula: &Formula,
    disp_formula: &Formula,
    corr_formula: Option<&Formula>,
    min_nonzero: usize,
) -> anyhow::Result<ModelingData> {
    let counts_nd = raw.assay(assay)?;
    let n = counts_nd.nrows();
    let d = counts_nd.ncols();

    if d != raw.genes.len() {
        return Err(anyhow::anyhow!(
            "{} count columns vs. {} gene names",
            d,
            raw.genes.len()
        ));
    }
    if n != raw.covariates.num_cells() {
        return Err(anyhow::anyhow!(
            "{} count rows vs. {} covariate rows",
            n,
            raw.covariates.num_cells()
        ));
    }

    let encoder_mean = DesignEncoder::build(&raw.covariates, mean_formula)?;
    let encoder_disp = DesignEncoder::build(&raw.covariates, disp_formula)?;

    let p = encoder_mean
        .num_coefficients()
        .max(encoder_disp.num_coefficients());
    if n <= p {
        return Err(anyhow::anyhow!(
            "{} cells cannot identify {} regression coefficients",
            n,
            p
        ));
    }

    let x_mean_np = encoder_mean.encode(&raw.covariates)?;
    let x_disp_nq = encoder_disp.encode(&raw.covariates)?;
    let corr_groups = resolve_corr_groups(&raw.covariates, corr_formula)?;

    let mut retained = Vec::with_capacity(d);
    let mut filtered_genes = vec![];
    for g in 0..d {
        let col = counts_nd.column(g);
        let nnz = col.iter().filter(|&&y| y > 0.0).count();
        let mean = col.mean();
        let zero_var = col.iter().all(|&y| y == mean);
        if nnz < min_nonzero || zero_var {
            filtered_genes.push(raw.genes[g].clone());
        } else {
            retained.push(g);
        }
    }

    if retained.is_empty() {
        return Err(anyhow::anyhow!("all {} genes were filtered out", d));
    }
    info!(
        "retained {} of {} genes ({} filtered)",
        retained.len(),
        d,
        filtered_genes.len()
    );

    let cols: Vec<DVec> = retained
        .iter()
        .map(|&g| counts_nd.column(g).into_owned())
        .collect();
    let y_nd = Mat::from_columns(&cols);
    let genes = retained.iter().map(|&g| raw.genes[g].clone()).collect();

    Ok(ModelingData {
        y_nd,
        genes,
        filtered_genes,
        x_mean_np,
        x_disp_nq,
        encoder_mean,
        encoder_disp,
        corr_groups,
    })
}
