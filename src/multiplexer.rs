//! The time-sharded multiplexer (§4.E): presents the same `updateLong[s]`/`getLongValues`
//! surface as a single shard, for one `(configId, detailLevelId, method)` stream spread across
//! as many shards as the back-end manager has allocated.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use snafu::ResultExt;

use crate::{
    backend::FileBackEnd,
    error::{ManagerSnafu, MultiplexerError, RetentionExceededSnafu},
    manager::BackEndManager,
    value::{CalculationMethod, DataType, Sample, StorageChannelMetaData},
};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A logical stream: one `(configurationId, detailLevelId, calculationMethod)` triple, backed by
/// however many shards the manager currently has allocated for it.
pub struct Multiplexer {
    manager: Arc<BackEndManager>,
    /// Used only as a template for shard allocation: its `start_time`/`end_time` are placeholders
    /// and are never consulted (the manager computes each shard's actual span).
    template: StorageChannelMetaData,
}

impl Multiplexer {
    pub fn new(manager: Arc<BackEndManager>, template: StorageChannelMetaData) -> Self {
        Self { manager, template }
    }

    pub fn configuration_id(&self) -> &str {
        &self.template.configuration_id
    }

    pub fn detail_level_id(&self) -> u32 {
        self.template.detail_level_id
    }

    pub fn calculation_method(&self) -> CalculationMethod {
        self.template.calculation_method
    }

    pub fn data_type(&self) -> DataType {
        self.template.data_type
    }

    /// A virtual stream's span is unbounded; it grows new shards on demand.
    pub fn is_time_span_constant(&self) -> bool {
        false
    }

    pub fn update_value(&self, value: Sample) -> Result<(), MultiplexerError> {
        self.update_values(&[value])
    }

    /// Partitions `values` by insert-shard and writes each bucket independently. A failing shard
    /// is logged, marked corrupt, and skipped; the remaining buckets still get written.
    #[tracing::instrument(skip(self, values), fields(config_id = %self.template.configuration_id, count = values.len()))]
    pub fn update_values(&self, values: &[Sample]) -> Result<(), MultiplexerError> {
        let mut buckets: Vec<(Arc<FileBackEnd>, Vec<Sample>)> = Vec::new();

        for &sample in values {
            let back_end = self
                .manager
                .get_back_end_for_insert(&self.template, sample.time)
                .context(ManagerSnafu)?;
            match buckets.iter_mut().find(|(b, _)| Arc::ptr_eq(b, &back_end)) {
                Some((_, bucket)) => bucket.push(sample),
                None => buckets.push((back_end, vec![sample])),
            }
        }

        for (back_end, bucket) in buckets {
            match back_end.update_values(&bucket) {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!(path = %back_end.path().display(), error = %e, "shard write failed, marking corrupt");
                    if let Ok(meta) = back_end.meta() {
                        self.manager.mark_back_end_as_corrupt(
                            &self.template.configuration_id,
                            self.template.detail_level_id,
                            self.template.calculation_method,
                            meta.start_time,
                        );
                    }
                }
            }
            self.manager.deinitialize_back_end(self.template.detail_level_id, &back_end);
        }
        Ok(())
    }

    /// Returns samples in `[start,end)` plus the last sample strictly before `start`, merged
    /// across every shard that covers the window.
    pub fn get_values(&self, start: i64, end: i64) -> Result<Vec<Sample>, MultiplexerError> {
        self.get_values_at(start, end, now_millis())
    }

    /// Same as [`Self::get_values`], but with an explicit `now` for deterministic retention-aware
    /// log-level downgrades in tests.
    #[tracing::instrument(skip(self), fields(config_id = %self.template.configuration_id, start, end))]
    pub fn get_values_at(&self, start: i64, end: i64, now: i64) -> Result<Vec<Sample>, MultiplexerError> {
        let shards = self
            .manager
            .get_existing_back_ends(
                &self.template.configuration_id,
                self.template.detail_level_id,
                self.template.calculation_method,
                start,
                end,
            )
            .context(ManagerSnafu)?;

        // Shards arrive in descending end-time order; we accumulate chunks in that order and
        // reverse once at the end, which is equivalent to repeatedly prepending each shard's
        // (ascending) results to the front of the accumulator.
        let mut chunks: Vec<Vec<Sample>> = Vec::new();
        let mut have_pre_start_sample = false;

        for (meta, back_end) in shards {
            if have_pre_start_sample {
                break;
            }

            match back_end.get_values(start, end) {
                Ok(values) => {
                    if values.iter().any(|s| s.time < start) {
                        have_pre_start_sample = true;
                    }
                    chunks.push(values);
                }
                Err(e) => {
                    let retention_exceeded = meta.end_time < now - self.template.proposed_data_age;
                    if retention_exceeded {
                        tracing::info!(path = %back_end.path().display(), error = %e, "shard read failed on out-of-retention data");
                    } else {
                        tracing::warn!(path = %back_end.path().display(), error = %e, "shard read failed");
                    }
                    self.manager.mark_back_end_as_corrupt(
                        &self.template.configuration_id,
                        self.template.detail_level_id,
                        self.template.calculation_method,
                        meta.start_time,
                    );
                    metrics::increment_counter!("chronicle_store_sentinel_samples_emitted_total");
                    let sentinel = Sample::sentinel(meta.start_time, self.template.data_type);
                    if sentinel.time < start {
                        have_pre_start_sample = true;
                    }
                    chunks.push(vec![sentinel]);
                }
            }
            self.manager.deinitialize_back_end(self.template.detail_level_id, &back_end);
        }

        chunks.reverse();
        Ok(chunks.into_iter().flatten().collect())
    }

    /// Deletes shards entirely older than `latest_time - proposedDataAge`, always leaving at
    /// least two samples in the stream.
    pub fn cleanup_relicts(&self) -> Result<(), MultiplexerError> {
        self.cleanup_relicts_at(now_millis())
    }

    #[tracing::instrument(skip(self), fields(config_id = %self.template.configuration_id))]
    pub fn cleanup_relicts_at(&self, now: i64) -> Result<(), MultiplexerError> {
        let _ = now; // retained for signature symmetry with get_values_at; boundary derives from the newest sample itself.
        let shards = self
            .manager
            .get_existing_back_ends(
                &self.template.configuration_id,
                self.template.detail_level_id,
                self.template.calculation_method,
                i64::MIN,
                i64::MAX,
            )
            .context(ManagerSnafu)?;

        let mut total_count = 0u64;
        let mut per_shard = Vec::new();
        for (_, back_end) in &shards {
            let count = back_end.record_count().unwrap_or(0);
            total_count += count;
            per_shard.push(count);
        }
        if total_count < 2 {
            return RetentionExceededSnafu.fail();
        }

        let newest = shards
            .iter()
            .find_map(|(_, back_end)| back_end.last_value().ok().flatten());
        let Some(newest) = newest else {
            return RetentionExceededSnafu.fail();
        };
        let boundary = newest.time - self.template.proposed_data_age;

        // `shards` is in descending end-time order; walk it in reverse (oldest first) so we only
        // ever consider deleting the oldest surviving shard next.
        let mut remaining = total_count;
        let mut delete_older_than = i64::MIN;
        for ((meta, _back_end), count) in shards.iter().zip(per_shard.iter()).rev() {
            if meta.end_time > boundary {
                break;
            }
            if remaining - count < 2 {
                break;
            }
            remaining -= count;
            delete_older_than = meta.end_time;
        }

        if delete_older_than > i64::MIN {
            self.manager
                .delete_old_back_ends(
                    &self.template.configuration_id,
                    self.template.detail_level_id,
                    self.template.calculation_method,
                    delete_older_than,
                )
                .context(ManagerSnafu)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PoolSettings, TimeUnit},
        value::Payload,
    };
    use pretty_assertions::assert_eq;
    use std::fs;
    use temp_dir::TempDir;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn template(config_id: &str) -> StorageChannelMetaData {
        StorageChannelMetaData {
            configuration_id: config_id.to_string(),
            calculation_method: CalculationMethod::Native,
            calculation_method_parameters: vec![],
            detail_level_id: 0,
            start_time: 0,
            end_time: 1,
            data_type: DataType::Long,
            proposed_data_age: 10_000,
            accepted_time_delta: 0,
        }
    }

    fn manager_with_width(dir: &TempDir, width_ms: u64) -> Arc<BackEndManager> {
        let settings = PoolSettings {
            time: width_ms,
            unit: TimeUnit::Milliseconds,
            count: 1,
            version: 1,
        };
        Arc::new(BackEndManager::new(dir.path().to_path_buf(), settings))
    }

    #[test]
    fn merges_two_non_overlapping_shards_ascending() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_width(&dir, 500);
        let mux = Multiplexer::new(manager, template("e5"));

        mux.update_values(&[
            Sample::new_long(100, 1.0, 0.0, 1, 1),
            Sample::new_long(400, 1.0, 0.0, 1, 2),
            Sample::new_long(600, 1.0, 0.0, 1, 3),
            Sample::new_long(900, 1.0, 0.0, 1, 4),
        ])
        .unwrap();

        let values = mux.get_values(0, 1000).unwrap();
        let times: Vec<i64> = values.iter().map(|s| s.time).collect();
        assert_eq!(times, vec![100, 400, 600, 900]);
    }

    #[test]
    fn cleanup_preserves_at_least_two_samples() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_width(&dir, 500);
        let mux = Multiplexer::new(manager, template("cleanup"));

        mux.update_values(&[
            Sample::new_long(100, 1.0, 0.0, 1, 1),
            Sample::new_long(600, 1.0, 0.0, 1, 2),
        ])
        .unwrap();

        mux.cleanup_relicts().unwrap();
        let values = mux.get_values(i64::MIN, i64::MAX).unwrap();
        assert!(values.len() >= 2);
    }

    /// Concrete scenario from the §4.E/§4.B.4 boundary review: shard A `[0,500)={400}`, shard B
    /// `[500,1000)={600,900}`. A query exactly at the shard boundary must still surface 400 as
    /// the "last sample before start", even though shard A doesn't overlap `[500,1000)` at all.
    #[test]
    fn cross_shard_pre_start_sample_included_at_shard_boundary() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_width(&dir, 500);
        let mux = Multiplexer::new(manager, template("pre-start"));

        mux.update_values(&[
            Sample::new_long(400, 1.0, 0.0, 1, 4),
            Sample::new_long(600, 1.0, 0.0, 1, 6),
            Sample::new_long(900, 1.0, 0.0, 1, 9),
        ])
        .unwrap();

        let values = mux.get_values(500, 1000).unwrap();
        let times: Vec<i64> = values.iter().map(|s| s.time).collect();
        assert_eq!(times, vec![400, 600, 900]);
    }

    fn find_shard_with_start(root: &std::path::Path, start_time: i64) -> std::path::PathBuf {
        for entry in fs::read_dir(root).unwrap() {
            let config_dir = entry.unwrap().path();
            if !config_dir.is_dir() {
                continue;
            }
            for file in fs::read_dir(&config_dir).unwrap() {
                let path = file.unwrap().path();
                let back_end = FileBackEnd::unbound(path.clone());
                if back_end.initialize(None).is_ok() {
                    let matches = back_end.meta().map(|m| m.start_time == start_time).unwrap_or(false);
                    back_end.deinitialize();
                    if matches {
                        return path;
                    }
                }
            }
        }
        panic!("no shard with start_time {start_time} under {}", root.display());
    }

    /// E6: the first shard's header CRC is trashed. `get_values` still succeeds, synthesizes the
    /// `(start, q=0, m=0, bvc=0, v=0)` sentinel in its place, and the manager marks it corrupt.
    #[test]
    fn header_corrupt_first_shard_yields_zero_quality_sentinel() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let setup_manager = manager_with_width(&dir, 500);
        {
            let mux = Multiplexer::new(setup_manager.clone(), template("e6"));
            mux.update_values(&[
                Sample::new_long(100, 1.0, 0.0, 1, 1),
                Sample::new_long(600, 1.0, 0.0, 1, 2),
            ])
            .unwrap();
        }
        setup_manager.free_related_resources("e6");

        let shard_a = find_shard_with_start(dir.path(), 0);
        let mut bytes = fs::read(&shard_a).unwrap();
        bytes[10] ^= 0xff;
        fs::write(&shard_a, &bytes).unwrap();

        // A fresh manager, simulating a process restart: discovery now has to cope with shard A's
        // trashed header from a cold start rather than from an already-open, still-valid handle.
        let fresh_manager = manager_with_width(&dir, 500);
        let mux = Multiplexer::new(fresh_manager, template("e6"));

        let values = mux.get_values(0, 1000).unwrap();
        assert_eq!(values[0].time, 0);
        assert_eq!(values[0].quality_indicator, 0.0);
        assert_eq!(values[0].manual_indicator, 0.0);
        assert_eq!(values[0].base_value_count, 0);
        assert_eq!(values[0].payload, Payload::Long(0));

        let times: Vec<i64> = values.iter().map(|s| s.time).collect();
        assert!(times.contains(&600));
        assert!(!shard_a.exists(), "corrupt shard should have been renamed aside by mark_back_end_as_corrupt");
    }
}
