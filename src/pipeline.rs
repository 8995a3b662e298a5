//! The aggregation pipeline (§4.G): fans each incoming sample through a chain of calculation
//! providers, each owning its own detail-level multiplexer, producing progressively coarser
//! aggregates.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    calc::{make_provider, CalculationProvider},
    error::MultiplexerError,
    manager::BackEndManager,
    multiplexer::Multiplexer,
    value::{CalculationMethod, DataType, Sample, StorageChannelMetaData},
};

/// Describes one rung of the pipeline: its detail level, how it reduces its input, and the
/// sample type it stores.
pub struct LevelSpec {
    pub detail_level_id: u32,
    pub calculation_method: CalculationMethod,
    pub calculation_method_parameters: Vec<i64>,
    pub data_type: DataType,
    pub proposed_data_age: i64,
    pub accepted_time_delta: i64,
}

struct LevelBuffer {
    window_start: Option<i64>,
    samples: Vec<Sample>,
}

struct Level {
    multiplexer: Multiplexer,
    provider: Box<dyn CalculationProvider + Send + Sync>,
    buffer: Mutex<LevelBuffer>,
}

/// A configured chain of detail levels for one stream, rooted at a NATIVE (passthrough) level 0.
pub struct AggregationPipeline {
    levels: Vec<Level>,
}

impl AggregationPipeline {
    /// `levels[0]` must be `CalculationMethod::Native`; it is the ingestion entry point and
    /// forwards samples to `levels[1]` immediately, with no buffering.
    pub fn new(manager: Arc<BackEndManager>, configuration_id: &str, levels: Vec<LevelSpec>) -> Self {
        let mut built = Vec::with_capacity(levels.len());
        let mut previous_data_type = None;
        for spec in levels {
            let input_type = previous_data_type.unwrap_or(spec.data_type);
            let provider = make_provider(spec.calculation_method, &spec.calculation_method_parameters, input_type, spec.data_type);
            let template = StorageChannelMetaData {
                configuration_id: configuration_id.to_string(),
                calculation_method: spec.calculation_method,
                calculation_method_parameters: spec.calculation_method_parameters.clone(),
                detail_level_id: spec.detail_level_id,
                start_time: 0,
                end_time: 1,
                data_type: spec.data_type,
                proposed_data_age: spec.proposed_data_age,
                accepted_time_delta: spec.accepted_time_delta,
            };
            built.push(Level {
                multiplexer: Multiplexer::new(manager.clone(), template),
                provider,
                buffer: Mutex::new(LevelBuffer {
                    window_start: None,
                    samples: Vec::new(),
                }),
            });
            previous_data_type = Some(spec.data_type);
        }
        Self { levels: built }
    }

    /// Feeds one raw sample into level 0, cascading any emitted aggregates up the chain.
    pub fn ingest(&self, sample: Sample) -> Result<(), MultiplexerError> {
        self.ingest_at_level(0, sample)
    }

    pub fn level(&self, index: usize) -> Option<&Multiplexer> {
        self.levels.get(index).map(|l| &l.multiplexer)
    }

    fn ingest_at_level(&self, level_index: usize, sample: Sample) -> Result<(), MultiplexerError> {
        let Some(level) = self.levels.get(level_index) else {
            return Ok(());
        };

        if level.provider.pass_through() {
            level.multiplexer.update_value(sample)?;
            return self.ingest_at_level(level_index + 1, sample);
        }

        let required = (level.provider.required_timespan_ms() as i64).max(1);
        let mut emitted = Vec::new();
        {
            let mut buffer = level.buffer.lock();
            if buffer.window_start.is_none() {
                buffer.window_start = Some(sample.time.div_euclid(required) * required);
            }
            while sample.time >= buffer.window_start.unwrap() + required {
                let window_start = buffer.window_start.unwrap();
                let window_end = window_start + required;
                let out = level.provider.generate_value(window_start, window_end, &buffer.samples);
                buffer.samples.clear();
                buffer.window_start = Some(window_end);
                emitted.push(out);
            }
            buffer.samples.push(sample);
        }

        for out in emitted {
            level.multiplexer.update_value(out)?;
            self.ingest_at_level(level_index + 1, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolSettings, TimeUnit};
    use temp_dir::TempDir;

    fn manager(dir: &TempDir) -> Arc<BackEndManager> {
        let settings = PoolSettings {
            time: 1,
            unit: TimeUnit::Seconds,
            count: 1000,
            version: 1,
        };
        Arc::new(BackEndManager::new(dir.path().to_path_buf(), settings))
    }

    #[test]
    fn native_level_forwards_every_sample_immediately() {
        let dir = TempDir::new().unwrap();
        let pipeline = AggregationPipeline::new(
            manager(&dir),
            "p1",
            vec![LevelSpec {
                detail_level_id: 0,
                calculation_method: CalculationMethod::Native,
                calculation_method_parameters: vec![],
                data_type: DataType::Long,
                proposed_data_age: 1_000_000,
                accepted_time_delta: 0,
            }],
        );

        pipeline.ingest(Sample::new_long(100, 1.0, 0.0, 1, 7)).unwrap();
        let values = pipeline.level(0).unwrap().get_values(0, 1000).unwrap();
        assert_eq!(values, vec![Sample::new_long(100, 1.0, 0.0, 1, 7)]);
    }

    #[test]
    fn coarser_level_emits_strictly_ascending_aggregates() {
        let dir = TempDir::new().unwrap();
        let pipeline = AggregationPipeline::new(
            manager(&dir),
            "p2",
            vec![
                LevelSpec {
                    detail_level_id: 0,
                    calculation_method: CalculationMethod::Native,
                    calculation_method_parameters: vec![],
                    data_type: DataType::Double,
                    proposed_data_age: 1_000_000,
                    accepted_time_delta: 0,
                },
                LevelSpec {
                    detail_level_id: 1,
                    calculation_method: CalculationMethod::Average,
                    calculation_method_parameters: vec![100],
                    data_type: DataType::Double,
                    proposed_data_age: 1_000_000,
                    accepted_time_delta: 0,
                },
            ],
        );

        for t in [0, 50, 120, 260, 410] {
            pipeline.ingest(Sample::new_double(t, 1.0, 0.0, 1, t as f64)).unwrap();
        }

        let emitted = pipeline.level(1).unwrap().get_values(0, 1000).unwrap();
        let times: Vec<i64> = emitted.iter().map(|s| s.time).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted, "level 1 must emit strictly ascending times");
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }
}
