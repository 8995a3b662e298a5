//! A disk-backed historical storage and aggregation engine for supervisory/industrial
//! time-series data: CRC/LRC-checksummed shard files, a time-sharded multiplexer per stream,
//! and a windowed aggregation pipeline cascading samples from a native detail level up through
//! coarser AVERAGE/MINIMUM/MAXIMUM levels.

pub mod backend;
pub mod calc;
pub mod channel;
pub mod config;
pub mod error;
pub mod manager;
pub mod multiplexer;
pub mod naming;
pub mod pipeline;
pub mod value;

pub use backend::FileBackEnd;
pub use channel::{ExtendedStorageChannel, StorageChannelFacade};
pub use config::PoolSettings;
pub use manager::BackEndManager;
pub use multiplexer::Multiplexer;
pub use pipeline::{AggregationPipeline, LevelSpec};
pub use value::{CalculationMethod, DataType, Payload, Sample, StorageChannelMetaData};
