use accurate::{sum::Klein, traits::*};

use crate::{
    data::{Column, RecordStore, Table},
    MonoBcError, MonoBcResult,
};

/// Column holding the lower edge of each bin in a persisted histogram.
pub const BIN_LOW_COLUMN: &str = "bin_low";
/// Column holding the upper edge of each bin in a persisted histogram.
pub const BIN_HIGH_COLUMN: &str = "bin_high";
/// Column holding the content of each bin in a persisted histogram.
pub const COUNT_COLUMN: &str = "count";

/// A helper method to get histogram edges from evenly-spaced `bins` over a given `range`
/// # See Also
/// [`Histogram`]
/// [`get_bin_index`]
pub fn get_bin_edges(bins: usize, range: (f64, f64)) -> Vec<f64> {
    let bin_width = (range.1 - range.0) / (bins as f64);
    (0..=bins)
        .map(|i| range.0 + (i as f64 * bin_width))
        .collect()
}

/// A helper method to obtain the index of the bin of `edges` where a value should go.
///
/// Bins are half-open `[low, high)` except the last, which also includes its upper edge.
/// Values outside the edges and NaN have no bin.
///
/// # See Also
/// [`Histogram`]
/// [`get_bin_edges`]
pub fn get_bin_index(value: f64, edges: &[f64]) -> Option<usize> {
    let (first, last) = (*edges.first()?, *edges.last()?);
    if edges.len() < 2 || value.is_nan() || value < first || value > last {
        return None;
    }
    if value == last {
        return Some(edges.len() - 2);
    }
    Some(edges.partition_point(|edge| *edge <= value) - 1)
}

/// Check that `edges` describe at least one bin with finite, strictly increasing edges.
pub fn validate_edges(edges: &[f64]) -> MonoBcResult<()> {
    if edges.len() < 2 {
        return Err(MonoBcError::InvalidBinning {
            reason: format!("need at least two edges, got {}", edges.len()),
        });
    }
    if edges.iter().any(|edge| !edge.is_finite()) {
        return Err(MonoBcError::InvalidBinning {
            reason: "edges must be finite".to_string(),
        });
    }
    if let Some(pair) = edges.windows(2).find(|pair| pair[1] <= pair[0]) {
        return Err(MonoBcError::InvalidBinning {
            reason: format!(
                "edges must be strictly increasing ({} followed by {})",
                pair[0], pair[1]
            ),
        });
    }
    Ok(())
}

/// A simple struct which represents a histogram
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    /// The number of counts in each bin (can be `f64`s since these might be weighted or
    /// rescaled counts)
    pub counts: Vec<f64>,
    /// The edges of each bin (length is one greater than `counts`)
    pub bin_edges: Vec<f64>,
}

impl Histogram {
    /// An empty histogram over `edges`.
    pub fn from_edges(edges: Vec<f64>) -> MonoBcResult<Self> {
        validate_edges(&edges)?;
        Ok(Self {
            counts: vec![0.0; edges.len() - 1],
            bin_edges: edges,
        })
    }

    /// A histogram with the given bin contents.
    pub fn new(counts: Vec<f64>, edges: Vec<f64>) -> MonoBcResult<Self> {
        validate_edges(&edges)?;
        if counts.len() + 1 != edges.len() {
            return Err(MonoBcError::LengthMismatch {
                context: "Histogram bin counts".to_string(),
                expected: edges.len() - 1,
                actual: counts.len(),
            });
        }
        Ok(Self {
            counts,
            bin_edges: edges,
        })
    }

    /// An empty histogram with evenly spaced `bins` over `range`.
    pub fn uniform(bins: usize, range: (f64, f64)) -> MonoBcResult<Self> {
        if bins == 0 {
            return Err(MonoBcError::InvalidBinning {
                reason: "number of bins must be greater than zero".to_string(),
            });
        }
        Self::from_edges(get_bin_edges(bins, range))
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.counts.len()
    }

    /// Add one entry at `value`. Returns `false` if the value falls in no bin.
    pub fn fill(&mut self, value: f64) -> bool {
        self.fill_weighted(value, 1.0)
    }

    /// Add `weight` at `value`. Returns `false` if the value falls in no bin.
    pub fn fill_weighted(&mut self, value: f64, weight: f64) -> bool {
        match get_bin_index(value, &self.bin_edges) {
            Some(index) => {
                self.counts[index] += weight;
                true
            }
            None => false,
        }
    }

    /// Add one entry for each value, returning how many landed in a bin.
    pub fn fill_many(&mut self, values: &[f64]) -> usize {
        values.iter().filter(|&&value| self.fill(value)).count()
    }

    /// Sum of all bin contents, accumulated with compensated summation.
    pub fn integral(&self) -> f64 {
        self.counts
            .iter()
            .copied()
            .sum_with_accumulator::<Klein<f64>>()
    }

    /// A copy with every bin multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Histogram {
        Histogram {
            counts: self.counts.iter().map(|count| count * factor).collect(),
            bin_edges: self.bin_edges.clone(),
        }
    }

    /// A unit-integral copy, or [`None`] if the integral is not strictly positive.
    pub fn normalized(&self) -> Option<Histogram> {
        let integral = self.integral();
        if integral > 0.0 {
            Some(self.scaled(1.0 / integral))
        } else {
            None
        }
    }

    /// Returns `true` if both histograms use identical edges.
    pub fn same_binning(&self, other: &Histogram) -> bool {
        self.bin_edges == other.bin_edges
    }

    /// Add `other` bin by bin. `name` identifies `other` in the error when the binnings differ.
    pub fn add(&mut self, other: &Histogram, name: &str) -> MonoBcResult<()> {
        if !self.same_binning(other) {
            return Err(MonoBcError::BinningMismatch {
                name: name.to_string(),
            });
        }
        self.counts
            .iter_mut()
            .zip(&other.counts)
            .for_each(|(count, extra)| *count += extra);
        Ok(())
    }

    /// Lay the histogram out as a table with one row per bin.
    pub fn to_table(&self) -> MonoBcResult<Table> {
        let n = self.n_bins();
        Table::new()
            .with_column(BIN_LOW_COLUMN, Column::Float(self.bin_edges[..n].to_vec()))?
            .with_column(BIN_HIGH_COLUMN, Column::Float(self.bin_edges[1..].to_vec()))?
            .with_column(COUNT_COLUMN, Column::Float(self.counts.clone()))
    }

    /// Read a histogram laid out by [`Histogram::to_table`]. Adjacent bins must share an edge.
    pub fn from_table(table: &Table) -> MonoBcResult<Self> {
        let low = table.require(BIN_LOW_COLUMN)?.to_scalars(BIN_LOW_COLUMN)?;
        let high = table.require(BIN_HIGH_COLUMN)?.to_scalars(BIN_HIGH_COLUMN)?;
        let counts = table.require(COUNT_COLUMN)?.to_scalars(COUNT_COLUMN)?;
        let Some(&upper) = high.last() else {
            return Err(MonoBcError::InvalidBinning {
                reason: "histogram table has no bins".to_string(),
            });
        };
        if let Some(i) = (1..low.len()).find(|&i| low[i] != high[i - 1]) {
            return Err(MonoBcError::InvalidBinning {
                reason: format!("bin {i} does not start where bin {} ends", i - 1),
            });
        }
        let mut edges = low;
        edges.push(upper);
        Self::new(counts, edges)
    }
}

/// Name of the table holding the histogram of `variable` for the category stored in table
/// `category_table`.
pub fn histogram_table_name(variable: &str, category_table: &str) -> String {
    format!("{variable}_{category_table}")
}

/// Persist `histogram` as table `name` of `store`.
pub fn write_histogram(
    store: &mut dyn RecordStore,
    name: &str,
    histogram: &Histogram,
) -> MonoBcResult<()> {
    store.write_table(name, &histogram.to_table()?)
}

/// Read table `name` of `store` as a histogram, or [`None`] if the table does not exist.
pub fn read_histogram(store: &dyn RecordStore, name: &str) -> MonoBcResult<Option<Histogram>> {
    if !store.has_table(name)? {
        return Ok(None);
    }
    Histogram::from_table(&store.read_table(name)?).map(Some)
}

/// Bin column `variable` of table `table` in `store` with the given edges.
///
/// Returns [`None`] (after logging a warning) when the table or the column is missing, so a
/// single incomplete sample does not stop the processing of the others.
pub fn build_shape(
    store: &dyn RecordStore,
    table: &str,
    variable: &str,
    edges: &[f64],
) -> MonoBcResult<Option<Histogram>> {
    let mut histogram = Histogram::from_edges(edges.to_vec())?;
    if !store.has_table(table)? {
        log::warn!("Table '{table}' not found in '{}'", store.name());
        return Ok(None);
    }
    let data = store.read_columns(table, &[variable])?;
    let Some(column) = data.column(variable) else {
        log::warn!(
            "Variable '{variable}' not found in table '{table}' of '{}'",
            store.name()
        );
        return Ok(None);
    };
    let values = column.to_scalars(variable)?;
    let filled = histogram.fill_many(&values);
    log::debug!(
        "Binned {filled} of {} entries of '{variable}' from '{table}' in '{}'",
        values.len(),
        store.name()
    );
    Ok(Some(histogram))
}
