//! Extraction, normalization, staging, and the analysis export

pub mod analysis;
pub mod batch_file;
pub mod circuit_breaker;
pub mod cryptocompare;
pub mod provider;
pub mod transform;

pub use analysis::{analysis_frame, write_analysis_parquet, AnalysisError};
pub use batch_file::{read_batch, write_batch, BatchFileError, StagedBatch};
pub use circuit_breaker::CircuitBreaker;
pub use cryptocompare::{CryptoCompareConfig, CryptoCompareProvider};
pub use provider::{ExtractError, FetchResult, MarketDataProvider, RawRecord};
pub use transform::{transform, DropCounts, TransformOutput};
