//! The file back-end itself: a single shard, i.e. one `[startTime,endTime)` window of one
//! stream at one detail level (§4.B).

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use parking_lot::RwLock;

use crate::{
    backend::{
        header::Header,
        record::{self, RECORD_SIZE},
    },
    error::{AlreadyExistsSnafu, BackEndError, CorruptRecordSnafu, InvalidArgumentSnafu, IoSnafu, NotInitializedSnafu},
    value::{DataType, Sample, StorageChannelMetaData},
};

/// Shift copies bounded to 1MiB at a time, per §4.B.3, so a large insertion-triggered shift does
/// not require a buffer the size of the whole tail.
const MAX_COPY_BUFFER_FILL_SIZE: usize = 1024 * 1024;

struct OpenState {
    file: File,
    header: Header,
    /// Cached aligned end offset (`dataOffset + N*RECORD_SIZE`), kept in sync with the file so
    /// repeated inserts in one batch don't re-stat the file each time.
    aligned_end: u64,
    first_value_time: Option<i64>,
}

/// One shard: a single `.va` file holding a contiguous, sorted run of samples.
pub struct FileBackEnd {
    path: PathBuf,
    state: RwLock<Option<OpenState>>,
}

impl FileBackEnd {
    /// Binds a back-end to a path without touching the filesystem. Used by the factory for both
    /// `createNewBackEnd` (nothing on disk yet) and as the handle returned for existing files
    /// before `initialize` is called.
    pub fn unbound(path: PathBuf) -> Self {
        Self {
            path,
            state: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The shard's `[start,end)` window never moves once created.
    pub fn is_time_span_constant(&self) -> bool {
        true
    }

    /// Creates the shard file for the first time. Fails if it already exists.
    #[tracing::instrument(skip(self, meta), fields(path = %self.path.display()))]
    pub fn create(&self, meta: &StorageChannelMetaData) -> Result<(), BackEndError> {
        meta.validate().map_err(|reason| InvalidArgumentSnafu { reason }.build())?;

        if self.path.exists() {
            return AlreadyExistsSnafu { path: self.path.clone() }.fail();
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| {
                IoSnafu { path: self.path.clone(), source }.build()
            })?;
        }

        let header = Header::from_meta(meta);
        let bytes = header.encode();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?;
        file.write_all(&bytes).map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?;
        file.sync_all().map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?;

        tracing::debug!(config_id = %meta.configuration_id, detail_level = meta.detail_level_id, "created shard");

        *self.state.write() = Some(OpenState {
            file,
            aligned_end: header.data_offset,
            header,
            first_value_time: None,
        });
        Ok(())
    }

    /// Opens an existing shard, validating its header. If `expected` is supplied, the header is
    /// additionally cross-checked against it (used by the factory's discovery pass).
    #[tracing::instrument(skip(self, expected), fields(path = %self.path.display()))]
    pub fn initialize(&self, expected: Option<&StorageChannelMetaData>) -> Result<(), BackEndError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?;

        let file_len = file
            .metadata()
            .map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?
            .len();

        let mut fixed_prefix = vec![0u8; Header::FIXED_PREFIX_LEN.min(file_len as usize)];
        file.read_exact(&mut fixed_prefix).map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?;
        let declared_len = Header::peek_declared_length(&fixed_prefix).ok_or_else(|| {
            crate::error::CorruptHeaderSnafu {
                path: self.path.clone(),
                reason: format!("file too small to hold a header: {file_len} bytes"),
            }
            .build()
        })?;
        if declared_len > file_len {
            return crate::error::CorruptHeaderSnafu {
                path: self.path.clone(),
                reason: format!("declared header length {declared_len} exceeds file length {file_len}"),
            }
            .fail();
        }

        let mut header_bytes = vec![0u8; declared_len as usize];
        file.seek(SeekFrom::Start(0)).map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?;
        file.read_exact(&mut header_bytes).map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?;
        let header = Header::decode(&header_bytes, &self.path)?;

        if let Some(expected) = expected {
            if header.configuration_id != expected.configuration_id
                || header.detail_level_id != expected.detail_level_id
                || header.calculation_method != expected.calculation_method
            {
                return crate::error::CorruptHeaderSnafu {
                    path: self.path.clone(),
                    reason: "header does not match the identity implied by its filename".to_string(),
                }
                .fail();
            }
        }

        let aligned_end = aligned_end(file_len, header.data_offset);
        if aligned_end != file_len {
            tracing::warn!(
                path = %self.path.display(),
                file_len,
                aligned_end,
                "shard file has a torn trailing record, truncating logical view"
            );
        }

        let first_value_time = if aligned_end > header.data_offset {
            let mut buf = [0u8; RECORD_SIZE];
            file.seek(SeekFrom::Start(header.data_offset)).map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?;
            file.read_exact(&mut buf).map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?;
            Some(record::peek_time(&buf))
        } else {
            None
        };

        *self.state.write() = Some(OpenState {
            file,
            aligned_end,
            header,
            first_value_time,
        });
        Ok(())
    }

    /// Drops any open file descriptor and cached state. A subsequent call must `initialize` again.
    pub fn deinitialize(&self) {
        *self.state.write() = None;
    }

    /// Removes the shard file from disk. Idempotent: a missing file is not an error.
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    pub fn delete(&self) -> Result<(), BackEndError> {
        let _guard = self.state.write();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => IoSnafu { path: self.path.clone(), source }.fail(),
        }
    }

    pub fn meta(&self) -> Result<StorageChannelMetaData, BackEndError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| NotInitializedSnafu { path: self.path.clone() }.build())?;
        Ok(state.header.to_meta())
    }

    pub fn is_empty(&self) -> Result<bool, BackEndError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| NotInitializedSnafu { path: self.path.clone() }.build())?;
        Ok(state.aligned_end < state.header.data_offset + RECORD_SIZE as u64)
    }

    pub fn first_value_time(&self) -> Result<Option<i64>, BackEndError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| NotInitializedSnafu { path: self.path.clone() }.build())?;
        Ok(state.first_value_time)
    }

    pub fn record_count(&self) -> Result<u64, BackEndError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| NotInitializedSnafu { path: self.path.clone() }.build())?;
        Ok((state.aligned_end - state.header.data_offset) / RECORD_SIZE as u64)
    }

    /// The shard's last record by time, or `None` if it holds no records.
    pub fn last_value(&self) -> Result<Option<Sample>, BackEndError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| NotInitializedSnafu { path: self.path.clone() }.build())?;
        let record_count = (state.aligned_end - state.header.data_offset) / RECORD_SIZE as u64;
        if record_count == 0 {
            return Ok(None);
        }
        let sample = read_record(&state.file, &self.path, state.header.data_offset, record_count - 1, state.header.data_type)?;
        Ok(Some(sample))
    }

    /// Inserts or overwrites a single sample. See [`Self::update_values`].
    pub fn update_value(&self, value: Sample) -> Result<(), BackEndError> {
        self.update_values(&[value])
    }

    /// Inserts/overwrites a batch of samples (§4.B.3).
    ///
    /// Samples are stably sorted by time before insertion, so that when two samples share a
    /// time, the one that appeared later in `values` wins (the overwrite law, §8.2). Samples
    /// outside `[startTime,endTime)` are clipped: earlier ones are dropped silently, and the
    /// first sample at or past `endTime` terminates the batch.
    #[tracing::instrument(skip(self, values), fields(path = %self.path.display(), count = values.len()))]
    pub fn update_values(&self, values: &[Sample]) -> Result<(), BackEndError> {
        if values.is_empty() {
            return Ok(());
        }

        let mut sorted: Vec<Sample> = values.to_vec();
        sorted.sort_by(|a, b| a.time.cmp(&b.time));

        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or_else(|| NotInitializedSnafu { path: self.path.clone() }.build())?;

        let data_offset = state.header.data_offset;
        let start_time = state.header.start_time;
        let end_time = state.header.end_time;

        let mut written = 0u64;
        for sample in sorted {
            if sample.time < start_time {
                continue;
            }
            if sample.time >= end_time {
                break;
            }
            insert_one(&mut state.file, &self.path, data_offset, &mut state.aligned_end, sample)?;
            written += 1;
        }

        state
            .file
            .sync_all()
            .map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?;

        metrics::counter!("chronicle_store_records_written_total", written);

        state.first_value_time = if state.aligned_end > data_offset {
            let mut buf = [0u8; RECORD_SIZE];
            state.file.seek(SeekFrom::Start(data_offset)).map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?;
            state.file.read_exact(&mut buf).map_err(|source| IoSnafu { path: self.path.clone(), source }.build())?;
            Some(record::peek_time(&buf))
        } else {
            None
        };

        Ok(())
    }

    /// Returns samples with `time` in `[start,end)`, plus the last sample strictly before
    /// `start` when one exists (§4.B.4).
    #[tracing::instrument(skip(self), fields(path = %self.path.display(), start, end))]
    pub fn get_values(&self, start: i64, end: i64) -> Result<Vec<Sample>, BackEndError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| NotInitializedSnafu { path: self.path.clone() }.build())?;

        let data_offset = state.header.data_offset;
        let record_count = (state.aligned_end - data_offset) / RECORD_SIZE as u64;
        let data_type = state.header.data_type;

        if record_count == 0 {
            return Ok(Vec::new());
        }

        let file = &state.file;

        // Fast path: the whole shard precedes the query window. Only the last record (as the
        // "state at start" sample) can possibly matter.
        if state.header.end_time < start {
            let sample = read_record(file, &self.path, data_offset, record_count - 1, data_type)?;
            return Ok(vec![sample]);
        }

        let start_index = if state.header.start_time > start {
            // The whole shard is at or after `start`; there is no pre-start record to include.
            0
        } else {
            let idx = lower_bound(file, &self.path, data_offset, record_count, start, data_type)?;
            if idx >= record_count {
                record_count - 1
            } else {
                let t = read_time(file, &self.path, data_offset, idx)?;
                if t > start && idx > 0 {
                    idx - 1
                } else {
                    idx
                }
            }
        };

        let mut results = Vec::new();
        for idx in start_index..record_count {
            let sample = read_record(file, &self.path, data_offset, idx, data_type)?;
            if sample.time >= end {
                break;
            }
            results.push(sample);
        }
        Ok(results)
    }
}

fn aligned_end(file_len: u64, data_offset: u64) -> u64 {
    if file_len <= data_offset {
        return data_offset;
    }
    let record_count = (file_len - data_offset) / RECORD_SIZE as u64;
    data_offset + record_count * RECORD_SIZE as u64
}

fn read_time(file: &File, path: &Path, data_offset: u64, index: u64) -> Result<i64, BackEndError> {
    let mut buf = [0u8; RECORD_SIZE];
    read_at(file, path, data_offset + index * RECORD_SIZE as u64, &mut buf)?;
    Ok(record::peek_time(&buf))
}

fn read_record(file: &File, path: &Path, data_offset: u64, index: u64, data_type: DataType) -> Result<Sample, BackEndError> {
    let offset = data_offset + index * RECORD_SIZE as u64;
    let mut buf = [0u8; RECORD_SIZE];
    read_at(file, path, offset, &mut buf)?;
    record::decode(&buf, data_type).map_err(|mismatch| {
        metrics::increment_counter!("chronicle_store_corrupt_records_total");
        CorruptRecordSnafu {
            path: path.to_path_buf(),
            offset,
            reason: format!("LRC mismatch: expected 0x{:02x}, found 0x{:02x}", mismatch.expected, mismatch.actual),
        }
        .build()
    })
}

fn read_at(file: &File, path: &Path, offset: u64, buf: &mut [u8; RECORD_SIZE]) -> Result<(), BackEndError> {
    file.read_exact_at(buf, offset).map_err(|source| IoSnafu { path: path.to_path_buf(), source }.build())
}

/// Binary search for the first record with `time >= start`, i.e. `lower_bound`.
fn lower_bound(file: &File, path: &Path, data_offset: u64, record_count: u64, start: i64, _data_type: DataType) -> Result<u64, BackEndError> {
    let mut lo = 0u64;
    let mut hi = record_count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let t = read_time(file, path, data_offset, mid)?;
        if t < start {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Locates the insertion point for `sample.time` by scanning backward from `*aligned_end`, then
/// either overwrites an exact match in place, appends, or shifts the tail forward to make room.
fn insert_one(file: &mut File, path: &Path, data_offset: u64, aligned_end: &mut u64, sample: Sample) -> Result<(), BackEndError> {
    let record_size = RECORD_SIZE as u64;
    let mut p = *aligned_end;

    loop {
        if p == data_offset {
            break;
        }
        let prev_offset = p - record_size;
        let mut buf = [0u8; RECORD_SIZE];
        read_at(file, path, prev_offset, &mut buf)?;
        let prev_time = record::peek_time(&buf);
        if prev_time < sample.time {
            break;
        }
        p = prev_offset;
    }

    if p < *aligned_end {
        let mut buf = [0u8; RECORD_SIZE];
        read_at(file, path, p, &mut buf)?;
        if record::peek_time(&buf) == sample.time {
            // Overwrite in place.
            let encoded = record::encode(&sample);
            write_at(file, path, p, &encoded)?;
            return Ok(());
        }
        // Insert: shift [p, aligned_end) forward by one record, then write the new record at p.
        shift_tail_forward(file, path, p, *aligned_end)?;
        let encoded = record::encode(&sample);
        write_at(file, path, p, &encoded)?;
        *aligned_end += record_size;
        return Ok(());
    }

    // Append.
    let encoded = record::encode(&sample);
    write_at(file, path, *aligned_end, &encoded)?;
    *aligned_end += record_size;
    Ok(())
}

fn shift_tail_forward(file: &mut File, path: &Path, from: u64, end: u64) -> Result<(), BackEndError> {
    let record_size = RECORD_SIZE as u64;
    let total = end - from;
    let mut chunk = vec![0u8; MAX_COPY_BUFFER_FILL_SIZE.min(total as usize).max(record_size as usize)];

    // Copy back-to-front in bounded chunks so we never overwrite bytes we haven't read yet.
    let mut remaining = total;
    while remaining > 0 {
        let take = remaining.min(chunk.len() as u64);
        let src_start = from + remaining - take;
        let dst_start = src_start + record_size;
        let buf = &mut chunk[..take as usize];
        read_at_variable(file, path, src_start, buf)?;
        write_at_variable(file, path, dst_start, buf)?;
        remaining -= take;
    }
    Ok(())
}

fn read_at_variable(file: &File, path: &Path, offset: u64, buf: &mut [u8]) -> Result<(), BackEndError> {
    file.read_exact_at(buf, offset).map_err(|source| IoSnafu { path: path.to_path_buf(), source }.build())
}

fn write_at_variable(file: &mut File, path: &Path, offset: u64, buf: &[u8]) -> Result<(), BackEndError> {
    file.write_all_at(buf, offset).map_err(|source| IoSnafu { path: path.to_path_buf(), source }.build())
}

fn write_at(file: &mut File, path: &Path, offset: u64, buf: &[u8; RECORD_SIZE]) -> Result<(), BackEndError> {
    write_at_variable(file, path, offset, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::seq::SliceRandom;
    use temp_dir::TempDir;

    use crate::value::{CalculationMethod, Payload};

    fn meta(start: i64, end: i64) -> StorageChannelMetaData {
        StorageChannelMetaData {
            configuration_id: "shard-under-test".to_string(),
            calculation_method: CalculationMethod::Native,
            calculation_method_parameters: vec![],
            detail_level_id: 0,
            start_time: start,
            end_time: end,
            data_type: DataType::Long,
            proposed_data_age: 0,
            accepted_time_delta: 0,
        }
    }

    fn open_new(dir: &TempDir, start: i64, end: i64) -> FileBackEnd {
        let m = meta(start, end);
        let back_end = FileBackEnd::unbound(dir.path().join("shard.va"));
        back_end.create(&m).unwrap();
        back_end
    }

    fn times(samples: &[Sample]) -> Vec<i64> {
        samples.iter().map(|s| s.time).collect()
    }

    #[test]
    fn create_then_read_is_empty() {
        let dir = TempDir::new().unwrap();
        let back_end = open_new(&dir, 0, 1000);
        assert!(back_end.is_empty().unwrap());
        assert_eq!(back_end.get_values(0, 1000).unwrap(), Vec::new());
    }

    #[test]
    fn appends_records_in_ascending_time_order() {
        let dir = TempDir::new().unwrap();
        let back_end = open_new(&dir, 0, 1000);
        back_end
            .update_values(&[
                Sample::new_long(100, 1.0, 0.0, 1, 1),
                Sample::new_long(200, 1.0, 0.0, 1, 2),
                Sample::new_long(300, 1.0, 0.0, 1, 3),
            ])
            .unwrap();

        let values = back_end.get_values(0, 1000).unwrap();
        assert_eq!(times(&values), vec![100, 200, 300]);
    }

    #[test]
    fn overwrites_an_exact_time_match() {
        let dir = TempDir::new().unwrap();
        let back_end = open_new(&dir, 0, 1000);
        back_end
            .update_values(&[Sample::new_long(100, 1.0, 0.0, 1, 1), Sample::new_long(200, 1.0, 0.0, 1, 2)])
            .unwrap();
        back_end.update_values(&[Sample::new_long(100, 1.0, 0.0, 1, 99)]).unwrap();

        let values = back_end.get_values(0, 1000).unwrap();
        assert_eq!(times(&values), vec![100, 200]);
        assert_eq!(values[0].payload, Payload::Long(99));
    }

    /// E4: inserting a record earlier than existing ones shifts the tail forward by one record.
    #[test]
    fn insert_earlier_shifts_tail_forward() {
        let dir = TempDir::new().unwrap();
        let back_end = open_new(&dir, 0, 1000);
        back_end
            .update_values(&[Sample::new_long(500, 1.0, 0.0, 1, 5), Sample::new_long(900, 1.0, 0.0, 1, 9)])
            .unwrap();
        back_end.update_values(&[Sample::new_long(100, 1.0, 0.0, 1, 1)]).unwrap();

        let values = back_end.get_values(0, 1000).unwrap();
        assert_eq!(times(&values), vec![100, 500, 900]);
        assert_eq!(back_end.record_count().unwrap(), 3);
    }

    #[test]
    fn tolerates_a_torn_trailing_record() {
        let dir = TempDir::new().unwrap();
        let back_end = open_new(&dir, 0, 1000);
        back_end
            .update_values(&[Sample::new_long(100, 1.0, 0.0, 1, 1), Sample::new_long(200, 1.0, 0.0, 1, 2)])
            .unwrap();
        back_end.deinitialize();

        // Truncate off the last few bytes of the final record, simulating a crash mid-write.
        let path = back_end.path().to_path_buf();
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();
        drop(file);

        back_end.initialize(None).unwrap();
        let values = back_end.get_values(0, 1000).unwrap();
        assert_eq!(times(&values), vec![100]);
        assert_eq!(back_end.record_count().unwrap(), 1);
    }

    /// Regardless of insertion order, the on-disk record sequence ends up sorted by time.
    #[test]
    fn random_insertion_order_still_yields_sorted_output() {
        let dir = TempDir::new().unwrap();
        let back_end = open_new(&dir, 0, 10_000);

        let mut rng = rand::thread_rng();
        let mut shuffled_times: Vec<i64> = (0..9).map(|i| i * 100 + 10).collect();
        shuffled_times.shuffle(&mut rng);
        for t in shuffled_times {
            back_end.update_value(Sample::new_long(t, 1.0, 0.0, 1, t)).unwrap();
        }

        let values = back_end.get_values(0, 10_000).unwrap();
        let expected: Vec<i64> = (0..9).map(|i| i * 100 + 10).collect();
        assert_eq!(times(&values), expected);
        assert!(values.windows(2).all(|w| w[0].time < w[1].time));
    }
}
