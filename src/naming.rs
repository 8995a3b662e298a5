//! On-disk naming and discovery for shard files (§4.C): `{root}/{configId}/` holds every shard
//! belonging to one stream, named `{configId}_{detailLevelId}_{method}_{start}_{end}.va`.

use std::{fs, path::PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::{
    backend::FileBackEnd,
    error::{BackEndError, IoSnafu},
    value::{CalculationMethod, DataType, StorageChannelMetaData},
};

/// Everything but letters/digits is percent-encoded; this is `NON_ALPHANUMERIC` as-is, kept as a
/// named constant so the encode/decode sites read as a matched pair.
const ENCODE_SET: &AsciiSet = NON_ALPHANUMERIC;

fn encode_config_id(id: &str) -> String {
    // Underscores are the field separator in the filename, so any underscore in the raw id is
    // turned into a space before encoding to keep the separator unambiguous.
    let spaced = id.replace('_', " ");
    utf8_percent_encode(&spaced, ENCODE_SET).to_string()
}

fn decode_config_id(encoded: &str) -> Option<String> {
    let decoded = percent_decode_str(encoded).decode_utf8().ok()?;
    Some(decoded.replace(' ', "_"))
}

/// Formats an epoch-millisecond instant as `YYYYMMDD.HHMMSS.mmm.dstOffset`. The DST-offset field
/// is always `+0000`: every timestamp in this crate is formatted in UTC (§9 design notes).
fn format_timestamp(epoch_millis: i64) -> String {
    let dt: DateTime<Utc> = DateTime::from_timestamp_millis(epoch_millis).unwrap_or_else(|| DateTime::from_timestamp_millis(0).unwrap());
    format!(
        "{}.{:03}.+0000",
        dt.format("%Y%m%d.%H%M%S"),
        dt.timestamp_subsec_millis()
    )
}

/// Inverse of [`format_timestamp`]: recovers the epoch-millisecond instant encoded in a shard
/// filename. Returns `None` if the field doesn't match the fixed `+0000` format this crate always
/// writes.
fn parse_timestamp(formatted: &str) -> Option<i64> {
    let without_offset = formatted.strip_suffix(".+0000")?;
    let naive = NaiveDateTime::parse_from_str(without_offset, "%Y%m%d.%H%M%S.%3f").ok()?;
    Some(naive.and_utc().timestamp_millis())
}

fn config_dir(root: &std::path::Path, config_id: &str) -> PathBuf {
    root.join(encode_config_id(config_id))
}

fn file_name(meta: &StorageChannelMetaData) -> String {
    format!(
        "{}_{}_{}_{}_{}.va",
        encode_config_id(&meta.configuration_id),
        meta.detail_level_id,
        meta.calculation_method.short_code(),
        format_timestamp(meta.start_time),
        format_timestamp(meta.end_time),
    )
}

/// The identity a filename claims for itself, parsed back out for cross-checking against the
/// shard's own header, and as a fallback span when the header can't be read at all (E6).
struct ClaimedIdentity {
    configuration_id: String,
    detail_level_id: u32,
    calculation_method: CalculationMethod,
    start_time: i64,
    end_time: i64,
}

fn parse_file_name(name: &str) -> Option<ClaimedIdentity> {
    let stem = name.strip_suffix(".va")?;
    let mut parts = stem.splitn(5, '_');
    let encoded_config_id = parts.next()?;
    let detail_level_id = parts.next()?.parse().ok()?;
    let method_code = parts.next()?;
    let start_str = parts.next()?;
    let end_str = parts.next()?;

    Some(ClaimedIdentity {
        configuration_id: decode_config_id(encoded_config_id)?,
        detail_level_id,
        calculation_method: CalculationMethod::from_short_code(method_code)?,
        start_time: parse_timestamp(start_str)?,
        end_time: parse_timestamp(end_str)?,
    })
}

/// Constructs the path a new shard for `meta` would live at, and returns an uninitialized handle
/// bound to it. The caller still has to call [`FileBackEnd::create`].
pub fn create_new_back_end(root: &std::path::Path, meta: &StorageChannelMetaData) -> FileBackEnd {
    let path = config_dir(root, &meta.configuration_id).join(file_name(meta));
    FileBackEnd::unbound(path)
}

/// A shard discovered on disk, together with the metadata a caller should treat it as having.
pub struct DiscoveredShard {
    pub back_end: FileBackEnd,
    pub meta: StorageChannelMetaData,
    /// Set when the shard's header could not be read (bad marker, version, or CRC). `meta` in
    /// this case is reconstructed from the filename alone: its span is trustworthy, but its
    /// `data_type`/`proposed_data_age`/`accepted_time_delta`/`calculation_method_parameters`
    /// fields are unknowable and left at defaults.
    pub header_corrupt: bool,
}

/// Scans `{root}/{configId}/` for shards matching `(detailLevelId, method)`, opening and
/// verifying each one.
///
/// A shard whose header fails to open is *not* dropped from the scan (E6): a corrupt header still
/// claims a span via its filename, and a caller needs to know that span exists in order to
/// synthesize the zero-quality sentinel sample §4.E requires at read time. A shard whose header
/// opens fine but disagrees with its filename's identity is a true mismatch and is skipped, since
/// there's no trustworthy span to fall back to.
///
/// Returns shards sorted by `endTime` descending, then `startTime` descending.
#[tracing::instrument(skip(root))]
pub fn get_existing_back_ends(
    root: &std::path::Path,
    config_id: &str,
    detail_level_id: u32,
    method: CalculationMethod,
) -> Result<Vec<DiscoveredShard>, BackEndError> {
    let dir = config_dir(root, config_id);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(&dir).map_err(|source| IoSnafu { path: dir.clone(), source }.build())?;

    let mut found: Vec<DiscoveredShard> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| IoSnafu { path: dir.clone(), source }.build())?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(claimed) = parse_file_name(name) else {
            tracing::warn!(path = %path.display(), "shard file name does not match the expected pattern, skipping");
            continue;
        };
        if claimed.detail_level_id != detail_level_id || claimed.calculation_method != method {
            continue;
        }

        let back_end = FileBackEnd::unbound(path.clone());
        match back_end.initialize(None) {
            Ok(()) => {
                let meta = back_end.meta()?;
                if meta.configuration_id != claimed.configuration_id {
                    tracing::warn!(
                        path = %path.display(),
                        filename_config_id = %claimed.configuration_id,
                        header_config_id = %meta.configuration_id,
                        "shard header identity does not match its filename, skipping"
                    );
                    continue;
                }
                found.push(DiscoveredShard { back_end, meta, header_corrupt: false });
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "shard header failed to open, keeping a corrupt placeholder so reads see a gap"
                );
                let meta = StorageChannelMetaData {
                    configuration_id: claimed.configuration_id,
                    calculation_method: claimed.calculation_method,
                    calculation_method_parameters: Vec::new(),
                    detail_level_id: claimed.detail_level_id,
                    start_time: claimed.start_time,
                    end_time: claimed.end_time,
                    data_type: DataType::Unknown,
                    proposed_data_age: 0,
                    accepted_time_delta: 0,
                };
                found.push(DiscoveredShard { back_end, meta, header_corrupt: true });
            }
        }
    }

    found.sort_by(|a, b| b.meta.end_time.cmp(&a.meta.end_time).then(b.meta.start_time.cmp(&a.meta.start_time)));
    Ok(found)
}

/// Returns the metadata of every discovered shard for `config_id`; when `merge` is set, groups
/// by `(detailLevelId, method)` and widens `[start,end]` per group, keeping the remaining fields
/// from the entry with the latest `endTime`.
pub fn get_existing_back_ends_meta_data(
    root: &std::path::Path,
    config_id: &str,
    merge: bool,
) -> Result<Vec<StorageChannelMetaData>, BackEndError> {
    let dir = config_dir(root, config_id);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut all = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|source| IoSnafu { path: dir.clone(), source }.build())? {
        let entry = entry.map_err(|source| IoSnafu { path: dir.clone(), source }.build())?;
        let path = entry.path();
        let back_end = FileBackEnd::unbound(path.clone());
        if back_end.initialize(None).is_err() {
            continue;
        }
        all.push(back_end.meta()?);
    }

    if !merge {
        return Ok(all);
    }

    let mut groups: Vec<StorageChannelMetaData> = Vec::new();
    for meta in all {
        if let Some(existing) = groups
            .iter_mut()
            .find(|g| g.detail_level_id == meta.detail_level_id && g.calculation_method == meta.calculation_method)
        {
            let wider_start = existing.start_time.min(meta.start_time);
            let wider_end = existing.end_time.max(meta.end_time);
            if meta.end_time >= existing.end_time {
                *existing = meta.with_span(wider_start, wider_end);
            } else {
                existing.start_time = wider_start;
                existing.end_time = wider_end;
            }
        } else {
            groups.push(meta);
        }
    }
    Ok(groups)
}

/// Removes every shard file for `config_id`, then the now-empty directory.
#[tracing::instrument(skip(root))]
pub fn delete_back_ends(root: &std::path::Path, config_id: &str) -> Result<(), BackEndError> {
    let dir = config_dir(root, config_id);
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(&dir).map_err(|source| IoSnafu { path: dir.clone(), source }.build())? {
        let entry = entry.map_err(|source| IoSnafu { path: dir.clone(), source }.build())?;
        let path = entry.path();
        fs::remove_file(&path).map_err(|source| IoSnafu { path: path.clone(), source }.build())?;
    }
    fs::remove_dir(&dir).map_err(|source| IoSnafu { path: dir.clone(), source }.build())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;
    use temp_dir::TempDir;

    fn meta(config_id: &str, start: i64, end: i64) -> StorageChannelMetaData {
        StorageChannelMetaData {
            configuration_id: config_id.to_string(),
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

    #[test]
    fn encodes_underscores_as_spaces_before_percent_encoding() {
        let encoded = encode_config_id("boiler_1/temperature");
        assert!(!encoded.contains('_'));
        assert_eq!(decode_config_id(&encoded).unwrap(), "boiler_1/temperature");
    }

    #[test]
    fn file_name_splits_into_five_underscore_fields() {
        let m = meta("a_b_c", 0, 1000);
        let name = file_name(&m);
        let stem = name.strip_suffix(".va").unwrap();
        assert_eq!(stem.splitn(5, '_').count(), 5);
        let claimed = parse_file_name(&name).unwrap();
        assert_eq!(claimed.configuration_id, "a_b_c");
        assert_eq!(claimed.detail_level_id, 0);
        assert_eq!(claimed.calculation_method, CalculationMethod::Native);
    }

    #[test]
    fn create_then_discover_round_trips() {
        let dir = TempDir::new().unwrap();
        let m = meta("stream-1", 0, 1000);
        let back_end = create_new_back_end(dir.path(), &m);
        back_end.create(&m).unwrap();

        let found = get_existing_back_ends(dir.path(), "stream-1", 0, CalculationMethod::Native).unwrap();
        assert_eq!(found.len(), 1);
        assert!(!found[0].header_corrupt);
        assert_eq!(found[0].meta, m);
    }

    /// E6: a shard whose header CRC is trashed is still discovered, with its span recovered from
    /// the filename, rather than silently dropped from the scan.
    #[test]
    fn discovers_header_corrupt_shard_with_filename_derived_span() {
        let dir = TempDir::new().unwrap();
        let m = meta("stream-corrupt", 0, 500);
        let back_end = create_new_back_end(dir.path(), &m);
        back_end.create(&m).unwrap();
        back_end.deinitialize();

        // Trash a byte inside the CRC-covered header region.
        let path = back_end.path().to_path_buf();
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let found = get_existing_back_ends(dir.path(), "stream-corrupt", 0, CalculationMethod::Native).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].header_corrupt);
        assert_eq!(found[0].meta.start_time, 0);
        assert_eq!(found[0].meta.end_time, 500);
    }

    #[test]
    fn delete_back_ends_removes_directory() {
        let dir = TempDir::new().unwrap();
        let m = meta("stream-2", 0, 1000);
        let back_end = create_new_back_end(dir.path(), &m);
        back_end.create(&m).unwrap();

        delete_back_ends(dir.path(), "stream-2").unwrap();
        assert!(!config_dir(dir.path(), "stream-2").exists());
    }
}
