use crate::genotypes::GenotypeTable;
use crate::map::fit::VariantBlockSource;
use std::convert::Infallible;

/// Presents a loaded [`GenotypeTable`] to the PCA as dosage blocks,
/// restricted to a subset of sample columns.
pub struct GenotypeBlockSource<'a> {
    table: &'a GenotypeTable,
    samples: Vec<usize>,
    cursor: usize,
}

impl<'a> GenotypeBlockSource<'a> {
    /// `samples` are genotype-table columns, in the row order the scores
    /// should have.
    pub fn new(table: &'a GenotypeTable, samples: Vec<usize>) -> Self {
        Self {
            table,
            samples,
            cursor: 0,
        }
    }

    pub fn all_samples(table: &'a GenotypeTable) -> Self {
        Self::new(table, (0..table.n_samples()).collect())
    }
}

impl VariantBlockSource for GenotypeBlockSource<'_> {
    type Error = Infallible;

    fn n_samples(&self) -> usize {
        self.samples.len()
    }

    fn n_variants(&self) -> usize {
        self.table.n_variants()
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        self.cursor = 0;
        Ok(())
    }

    fn next_block_into(
        &mut self,
        max_variants: usize,
        storage: &mut [f64],
    ) -> Result<usize, Self::Error> {
        let variants = self.table.variants();
        let remaining = variants.len().saturating_sub(self.cursor);
        let ncols = remaining.min(max_variants);
        if ncols == 0 || self.samples.is_empty() {
            return Ok(0);
        }

        let nrows = self.samples.len();
        for (variant, dest) in variants[self.cursor..self.cursor + ncols]
            .iter()
            .zip(storage.chunks_mut(nrows))
        {
            for (slot, &sample) in dest.iter_mut().zip(&self.samples) {
                *slot = variant.calls[sample].map_or(f64::NAN, f64::from);
            }
        }

        self.cursor += ncols;
        Ok(ncols)
    }
}
