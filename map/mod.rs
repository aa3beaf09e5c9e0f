pub mod fit;
pub mod io;
pub use fit::{
    DEFAULT_BLOCK_WIDTH, DEFAULT_GRAM_BUDGET_BYTES, DenseBlockSource, FitOptions, HwePcaError, HwePcaModel, HweScaler,
    VariantBlockSource,
};
pub use io::GenotypeBlockSource;
