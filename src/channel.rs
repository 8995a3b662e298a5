//! The storage-channel façade (§4.H): registers any number of `ExtendedStorageChannel`s and
//! broadcasts updates/reads to all of them, with a single-channel fast path.

use std::sync::Arc;

use parking_lot::Mutex;
use snafu::ResultExt;

use crate::{
    error::{ChannelError, MultiplexerSnafu},
    multiplexer::Multiplexer,
    value::Sample,
};

/// What the façade broadcasts to. `Multiplexer` is the only implementation this crate ships, but
/// the trait keeps the façade decoupled from it the way the source system decouples the channel
/// registry from any one storage backend.
pub trait ExtendedStorageChannel: Send + Sync {
    fn update_longs(&self, values: &[Sample]) -> Result<(), crate::error::MultiplexerError>;
    fn update_doubles(&self, values: &[Sample]) -> Result<(), crate::error::MultiplexerError>;
    fn get_long_values(&self, start: i64, end: i64) -> Result<Vec<Sample>, crate::error::MultiplexerError>;
    fn get_double_values(&self, start: i64, end: i64) -> Result<Vec<Sample>, crate::error::MultiplexerError>;
}

impl ExtendedStorageChannel for Multiplexer {
    fn update_longs(&self, values: &[Sample]) -> Result<(), crate::error::MultiplexerError> {
        self.update_values(values)
    }

    fn update_doubles(&self, values: &[Sample]) -> Result<(), crate::error::MultiplexerError> {
        self.update_values(values)
    }

    fn get_long_values(&self, start: i64, end: i64) -> Result<Vec<Sample>, crate::error::MultiplexerError> {
        self.get_values(start, end)
    }

    fn get_double_values(&self, start: i64, end: i64) -> Result<Vec<Sample>, crate::error::MultiplexerError> {
        self.get_values(start, end)
    }
}

/// Registers zero or more channels and broadcasts every update/read to all of them.
pub struct StorageChannelFacade {
    channels: Mutex<Vec<Arc<dyn ExtendedStorageChannel>>>,
}

impl Default for StorageChannelFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageChannelFacade {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, channel: Arc<dyn ExtendedStorageChannel>) {
        self.channels.lock().push(channel);
    }

    /// Removes the channel matching `channel`'s pointer identity, if registered.
    pub fn unregister(&self, channel: &Arc<dyn ExtendedStorageChannel>) {
        self.channels.lock().retain(|c| !Arc::ptr_eq(c, channel));
    }

    fn snapshot(&self) -> Vec<Arc<dyn ExtendedStorageChannel>> {
        self.channels.lock().clone()
    }

    pub fn update_long(&self, value: Sample) -> Result<(), ChannelError> {
        self.update_longs(&[value])
    }

    pub fn update_longs(&self, values: &[Sample]) -> Result<(), ChannelError> {
        broadcast(self.snapshot(), |channel| channel.update_longs(values))
    }

    pub fn update_double(&self, value: Sample) -> Result<(), ChannelError> {
        self.update_doubles(&[value])
    }

    pub fn update_doubles(&self, values: &[Sample]) -> Result<(), ChannelError> {
        broadcast(self.snapshot(), |channel| channel.update_doubles(values))
    }

    /// Returns the single registered channel's result directly; with more than one, concatenates.
    pub fn get_long_values(&self, start: i64, end: i64) -> Result<Vec<Sample>, ChannelError> {
        let channels = self.snapshot();
        if let [only] = channels.as_slice() {
            return only.get_long_values(start, end).context(MultiplexerSnafu);
        }
        let mut all = Vec::new();
        for channel in &channels {
            all.extend(channel.get_long_values(start, end).context(MultiplexerSnafu)?);
        }
        Ok(all)
    }

    pub fn get_double_values(&self, start: i64, end: i64) -> Result<Vec<Sample>, ChannelError> {
        let channels = self.snapshot();
        if let [only] = channels.as_slice() {
            return only.get_double_values(start, end).context(MultiplexerSnafu);
        }
        let mut all = Vec::new();
        for channel in &channels {
            all.extend(channel.get_double_values(start, end).context(MultiplexerSnafu)?);
        }
        Ok(all)
    }
}

/// Calls `f` against every channel, continuing after a failure, and returns the first error
/// encountered (if any) once every channel has been tried.
fn broadcast<F>(channels: Vec<Arc<dyn ExtendedStorageChannel>>, f: F) -> Result<(), ChannelError>
where
    F: Fn(&Arc<dyn ExtendedStorageChannel>) -> Result<(), crate::error::MultiplexerError>,
{
    let mut first_error = None;
    for channel in &channels {
        if let Err(e) = f(channel) {
            tracing::warn!(error = %e, "channel update failed during broadcast");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    match first_error {
        Some(source) => Err(source).context(MultiplexerSnafu),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PoolSettings, TimeUnit},
        manager::BackEndManager,
        value::{CalculationMethod, DataType, StorageChannelMetaData},
    };
    use temp_dir::TempDir;

    fn multiplexer(dir: &TempDir, config_id: &str) -> Arc<Multiplexer> {
        let settings = PoolSettings {
            time: 1,
            unit: TimeUnit::Seconds,
            count: 1000,
            version: 1,
        };
        let manager = Arc::new(BackEndManager::new(dir.path().to_path_buf(), settings));
        let template = StorageChannelMetaData {
            configuration_id: config_id.to_string(),
            calculation_method: CalculationMethod::Native,
            calculation_method_parameters: vec![],
            detail_level_id: 0,
            start_time: 0,
            end_time: 1,
            data_type: DataType::Long,
            proposed_data_age: 1_000_000,
            accepted_time_delta: 0,
        };
        Arc::new(Multiplexer::new(manager, template))
    }

    #[test]
    fn single_channel_fast_path_returns_its_result_directly() {
        let dir = TempDir::new().unwrap();
        let facade = StorageChannelFacade::new();
        let mux = multiplexer(&dir, "only");
        facade.register(mux.clone());

        facade.update_long(Sample::new_long(10, 1.0, 0.0, 1, 5)).unwrap();
        let values = facade.get_long_values(0, 1000).unwrap();
        assert_eq!(values, vec![Sample::new_long(10, 1.0, 0.0, 1, 5)]);
    }

    #[test]
    fn broadcasts_to_every_registered_channel() {
        let dir = TempDir::new().unwrap();
        let facade = StorageChannelFacade::new();
        let a = multiplexer(&dir, "a");
        let b = multiplexer(&dir, "b");
        facade.register(a.clone());
        facade.register(b.clone());

        facade.update_long(Sample::new_long(10, 1.0, 0.0, 1, 5)).unwrap();
        assert_eq!(a.get_values(0, 1000).unwrap().len(), 1);
        assert_eq!(b.get_values(0, 1000).unwrap().len(), 1);
    }

    #[test]
    fn unregister_removes_channel_from_broadcasts() {
        let dir = TempDir::new().unwrap();
        let facade = StorageChannelFacade::new();
        let a = multiplexer(&dir, "a");
        facade.register(a.clone());
        facade.unregister(&(a.clone() as Arc<dyn ExtendedStorageChannel>));

        facade.update_long(Sample::new_long(10, 1.0, 0.0, 1, 5)).unwrap();
        assert_eq!(a.get_values(0, 1000).unwrap().len(), 0);
    }
}
