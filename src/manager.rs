//! The back-end manager (§4.D): owns, per stream and per detail level, an ordered index of
//! shards covering `(−∞, +∞)`, and is the only component that calls `create`/`delete` on a
//! shard's underlying file.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use snafu::ResultExt;

use crate::{
    backend::FileBackEnd,
    config::PoolSettings,
    error::{BackEndSnafu, InvalidConfigurationSnafu, ManagerError, NoShardAvailableSnafu},
    naming,
    value::{CalculationMethod, StorageChannelMetaData},
};

/// Detail levels at or below this keep their file descriptor open across calls
/// (`keepOpenWhileInitialized`, §5); higher levels are reopened per call.
pub const DEFAULT_KEEP_OPEN_MAX_DETAIL_LEVEL: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    configuration_id: String,
    detail_level_id: u32,
    calculation_method: CalculationMethod,
}

/// A shard handle plus its metadata, cached at discovery/allocation time so that later lookups
/// never need to re-read a (possibly header-corrupt) shard just to learn its span.
struct ShardEntry {
    back_end: Arc<FileBackEnd>,
    meta: StorageChannelMetaData,
}

struct StreamIndex {
    /// Keyed by shard `start_time`; shards never overlap so this also orders them correctly.
    shards: BTreeMap<i64, ShardEntry>,
    loaded_from_disk: bool,
}

impl StreamIndex {
    fn new() -> Self {
        Self {
            shards: BTreeMap::new(),
            loaded_from_disk: false,
        }
    }
}

/// Owns shard lifecycle for every stream under one storage root.
pub struct BackEndManager {
    root: PathBuf,
    pool_settings: PoolSettings,
    keep_open_max_detail_level: u32,
    streams: Mutex<std::collections::HashMap<StreamKey, StreamIndex>>,
}

impl BackEndManager {
    pub fn new(root: PathBuf, pool_settings: PoolSettings) -> Self {
        Self {
            root,
            pool_settings,
            keep_open_max_detail_level: DEFAULT_KEEP_OPEN_MAX_DETAIL_LEVEL,
            streams: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn shard_width_millis(&self) -> i64 {
        self.pool_settings.shard_width_millis().max(1) as i64
    }

    fn ensure_loaded(
        &self,
        streams: &mut std::collections::HashMap<StreamKey, StreamIndex>,
        key: &StreamKey,
    ) -> Result<(), ManagerError> {
        if streams.get(key).map(|s| s.loaded_from_disk).unwrap_or(false) {
            return Ok(());
        }
        let discovered = naming::get_existing_back_ends(
            &self.root,
            &key.configuration_id,
            key.detail_level_id,
            key.calculation_method,
        )
        .context(BackEndSnafu)?;

        let entry = streams.entry(key.clone()).or_insert_with(StreamIndex::new);
        for shard in discovered {
            if shard.header_corrupt {
                metrics::increment_counter!("chronicle_store_shards_discovered_corrupt_total");
            }
            entry.shards.insert(
                shard.meta.start_time,
                ShardEntry {
                    back_end: Arc::new(shard.back_end),
                    meta: shard.meta,
                },
            );
        }
        entry.loaded_from_disk = true;
        Ok(())
    }

    /// Returns the unique shard whose span includes `time`, allocating and `create`-ing a fresh
    /// one of configured width if none exists.
    #[tracing::instrument(skip(self, template))]
    pub fn get_back_end_for_insert(
        &self,
        template: &StorageChannelMetaData,
        time: i64,
    ) -> Result<Arc<FileBackEnd>, ManagerError> {
        let key = StreamKey {
            configuration_id: template.configuration_id.clone(),
            detail_level_id: template.detail_level_id,
            calculation_method: template.calculation_method,
        };

        let mut streams = self.streams.lock();
        self.ensure_loaded(&mut streams, &key)?;
        let entry = streams.entry(key.clone()).or_insert_with(StreamIndex::new);

        if let Some((_, existing)) = entry.shards.range(..=time).next_back() {
            if existing.meta.start_time <= time && time < existing.meta.end_time {
                return Ok(existing.back_end.clone());
            }
        }

        let width = self.shard_width_millis();
        if width <= 0 {
            return NoShardAvailableSnafu { time }.fail();
        }
        let aligned_start = time.div_euclid(width) * width;
        let aligned_end = aligned_start + width;

        let meta = StorageChannelMetaData {
            configuration_id: template.configuration_id.clone(),
            calculation_method: template.calculation_method,
            calculation_method_parameters: template.calculation_method_parameters.clone(),
            detail_level_id: template.detail_level_id,
            start_time: aligned_start,
            end_time: aligned_end,
            data_type: template.data_type,
            proposed_data_age: template.proposed_data_age,
            accepted_time_delta: template.accepted_time_delta,
        };
        meta.validate()
            .map_err(|reason| InvalidConfigurationSnafu { reason }.build())?;

        let back_end = naming::create_new_back_end(&self.root, &meta);
        back_end.create(&meta).context(BackEndSnafu)?;
        back_end.initialize(Some(&meta)).context(BackEndSnafu)?;
        metrics::increment_counter!("chronicle_store_shards_allocated_total");

        let arc = Arc::new(back_end);
        entry.shards.insert(aligned_start, ShardEntry { back_end: arc.clone(), meta });
        Ok(arc)
    }

    /// Returns every shard overlapping `[start,end)`, in descending end-time order, plus (if it
    /// isn't already among them) the single nearest shard strictly older than `start` — so a
    /// caller can satisfy the "last sample before start" read semantics of §4.B.4 even when no
    /// shard actually overlaps the query window.
    #[tracing::instrument(skip(self))]
    pub fn get_existing_back_ends(
        &self,
        configuration_id: &str,
        detail_level_id: u32,
        calculation_method: CalculationMethod,
        start: i64,
        end: i64,
    ) -> Result<Vec<(StorageChannelMetaData, Arc<FileBackEnd>)>, ManagerError> {
        let key = StreamKey {
            configuration_id: configuration_id.to_string(),
            detail_level_id,
            calculation_method,
        };
        let mut streams = self.streams.lock();
        self.ensure_loaded(&mut streams, &key)?;
        let entry = streams.entry(key).or_insert_with(StreamIndex::new);

        let mut overlapping: Vec<(StorageChannelMetaData, Arc<FileBackEnd>)> = Vec::new();
        for shard in entry.shards.values() {
            if shard.meta.start_time < end && shard.meta.end_time > start {
                overlapping.push((shard.meta.clone(), shard.back_end.clone()));
            }
        }

        if let Some((_, predecessor)) = entry.shards.range(..start).next_back() {
            if !overlapping.iter().any(|(_, b)| Arc::ptr_eq(b, &predecessor.back_end)) {
                overlapping.push((predecessor.meta.clone(), predecessor.back_end.clone()));
            }
        }

        overlapping.sort_by(|(ma, _), (mb, _)| mb.end_time.cmp(&ma.end_time).then(mb.start_time.cmp(&ma.start_time)));
        Ok(overlapping)
    }

    /// Returns a borrowed handle. For detail levels above [`Self::keep_open_max_detail_level`]
    /// the descriptor is closed immediately; low levels stay open across calls.
    pub fn deinitialize_back_end(&self, detail_level_id: u32, back_end: &FileBackEnd) {
        if detail_level_id > self.keep_open_max_detail_level {
            back_end.deinitialize();
        }
    }

    /// Moves the offending shard aside and drops it from the index so the stream stays
    /// writable; a fresh shard will be allocated over the same span on next insert.
    #[tracing::instrument(skip(self))]
    pub fn mark_back_end_as_corrupt(
        &self,
        configuration_id: &str,
        detail_level_id: u32,
        calculation_method: CalculationMethod,
        time: i64,
    ) {
        let key = StreamKey {
            configuration_id: configuration_id.to_string(),
            detail_level_id,
            calculation_method,
        };
        let mut streams = self.streams.lock();
        let Some(entry) = streams.get_mut(&key) else {
            return;
        };

        let covering_start = entry
            .shards
            .range(..=time)
            .next_back()
            .filter(|(_, shard)| shard.meta.start_time <= time && time < shard.meta.end_time)
            .map(|(start, shard)| (*start, shard.back_end.clone()));

        let Some((start, back_end)) = covering_start else {
            return;
        };

        back_end.deinitialize();
        let corrupt_path = back_end.path().with_extension("va.corrupt");
        if let Err(e) = std::fs::rename(back_end.path(), &corrupt_path) {
            tracing::warn!(path = %back_end.path().display(), error = %e, "failed to rename corrupt shard aside");
        }
        entry.shards.remove(&start);
        metrics::increment_counter!("chronicle_store_shards_marked_corrupt_total");
        tracing::warn!(%configuration_id, detail_level_id, time, "marked shard as corrupt");
    }

    /// Deletes every shard whose `endTime <= older_than`.
    #[tracing::instrument(skip(self))]
    pub fn delete_old_back_ends(
        &self,
        configuration_id: &str,
        detail_level_id: u32,
        calculation_method: CalculationMethod,
        older_than: i64,
    ) -> Result<(), ManagerError> {
        let key = StreamKey {
            configuration_id: configuration_id.to_string(),
            detail_level_id,
            calculation_method,
        };
        let mut streams = self.streams.lock();
        self.ensure_loaded(&mut streams, &key)?;
        let Some(entry) = streams.get_mut(&key) else {
            return Ok(());
        };

        let mut to_remove = Vec::new();
        for (start, shard) in entry.shards.iter() {
            if shard.meta.end_time <= older_than {
                to_remove.push(*start);
            }
        }
        for start in to_remove {
            if let Some(shard) = entry.shards.remove(&start) {
                shard.back_end.deinitialize();
                shard.back_end.delete().context(BackEndSnafu)?;
                metrics::increment_counter!("chronicle_store_shards_deleted_total");
                tracing::debug!(%configuration_id, detail_level_id, start, "deleted relict shard");
            }
        }
        Ok(())
    }

    /// Releases every descriptor held for `configuration_id`, across every detail level and
    /// method, as required when the owning multiplexer/store is disposed.
    pub fn free_related_resources(&self, configuration_id: &str) {
        let mut streams = self.streams.lock();
        streams.retain(|key, index| {
            if key.configuration_id == configuration_id {
                for shard in index.shards.values() {
                    shard.back_end.deinitialize();
                }
                false
            } else {
                true
            }
        });
    }
}
