//! On-disk header layout (§4.B.1): a fixed-size prefix, a vector of method parameters, the
//! UTF-8 configuration id, and a trailing CRC32 over everything from `dataOffset` onward except
//! the marker itself.

use std::path::Path;

use crc32fast::Hasher;

use crate::{
    error::{BackEndError, CorruptHeaderSnafu},
    value::{CalculationMethod, DataType, StorageChannelMetaData},
};

pub const FILE_MARKER: u64 = 0x0a2d_04b2_0b58_0ca9;
pub const FILE_VERSION: i64 = 1;

/// Length of the fixed-size portion of the header, before the variable-length parameter array
/// and configuration id: 11 eight-byte fields (marker through calculationMethodId) plus the two
/// four-byte length fields.
const FIXED_HEADER_LEN: usize = 11 * 8;
const CRC_LEN: usize = 4;

/// A parsed, validated file header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub data_offset: u64,
    pub detail_level_id: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub proposed_data_age: i64,
    pub accepted_time_delta: i64,
    pub data_type: DataType,
    pub calculation_method: CalculationMethod,
    pub calculation_method_parameters: Vec<i64>,
    pub configuration_id: String,
}

impl Header {
    /// Length of the fixed-size prefix a caller must read before it can learn a header's total
    /// declared length via [`Header::peek_declared_length`].
    pub const FIXED_PREFIX_LEN: usize = FIXED_HEADER_LEN;

    pub fn from_meta(meta: &StorageChannelMetaData) -> Self {
        Header {
            data_offset: compute_data_offset(
                meta.calculation_method_parameters.len(),
                meta.configuration_id.as_bytes().len(),
            ),
            detail_level_id: meta.detail_level_id,
            start_time: meta.start_time,
            end_time: meta.end_time,
            proposed_data_age: meta.proposed_data_age,
            accepted_time_delta: meta.accepted_time_delta,
            data_type: meta.data_type,
            calculation_method: meta.calculation_method,
            calculation_method_parameters: meta.calculation_method_parameters.clone(),
            configuration_id: meta.configuration_id.clone(),
        }
    }

    pub fn to_meta(&self) -> StorageChannelMetaData {
        StorageChannelMetaData {
            configuration_id: self.configuration_id.clone(),
            calculation_method: self.calculation_method,
            calculation_method_parameters: self.calculation_method_parameters.clone(),
            detail_level_id: self.detail_level_id,
            start_time: self.start_time,
            end_time: self.end_time,
            data_type: self.data_type,
            proposed_data_age: self.proposed_data_age,
            accepted_time_delta: self.accepted_time_delta,
        }
    }

    /// Serializes the header, including its trailing CRC32, ready to be written at offset 0.
    pub fn encode(&self) -> Vec<u8> {
        let config_bytes = self.configuration_id.as_bytes();
        let param_count = self.calculation_method_parameters.len();
        let data_offset = compute_data_offset(param_count, config_bytes.len());
        debug_assert_eq!(data_offset, self.data_offset);

        let mut buf = Vec::with_capacity(data_offset as usize);
        buf.extend_from_slice(&FILE_MARKER.to_be_bytes());
        buf.extend_from_slice(&data_offset.to_be_bytes());
        buf.extend_from_slice(&FILE_VERSION.to_be_bytes());
        buf.extend_from_slice(&(self.detail_level_id as i64).to_be_bytes());
        buf.extend_from_slice(&self.start_time.to_be_bytes());
        buf.extend_from_slice(&self.end_time.to_be_bytes());
        buf.extend_from_slice(&self.proposed_data_age.to_be_bytes());
        buf.extend_from_slice(&self.accepted_time_delta.to_be_bytes());
        buf.extend_from_slice(&self.data_type.encoding().to_be_bytes());
        buf.extend_from_slice(&self.calculation_method.encoding().to_be_bytes());
        buf.extend_from_slice(&(param_count as u32).to_be_bytes());
        buf.extend_from_slice(&(config_bytes.len() as u32).to_be_bytes());
        for param in &self.calculation_method_parameters {
            buf.extend_from_slice(&param.to_be_bytes());
        }
        buf.extend_from_slice(config_bytes);

        debug_assert_eq!(buf.len(), data_offset as usize - CRC_LEN);

        let crc = crc32(&buf[8..]);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parses and validates a header from the first bytes of a shard file.
    ///
    /// `path` is used only to produce informative error messages.
    pub fn decode(bytes: &[u8], path: &Path) -> Result<Header, BackEndError> {
        let err = |reason: String| CorruptHeaderSnafu { path: path.to_path_buf(), reason }.build();

        if bytes.len() < FIXED_HEADER_LEN {
            return Err(err(format!(
                "file too small to hold a header: {} bytes",
                bytes.len()
            )));
        }

        let marker = read_u64(bytes, 0);
        if marker != FILE_MARKER {
            return Err(err(format!("bad file marker 0x{marker:016x}")));
        }

        let data_offset = read_u64(bytes, 8);
        let file_version = read_i64(bytes, 16);
        if file_version != FILE_VERSION {
            return Err(err(format!(
                "unsupported file version {file_version} (expected {FILE_VERSION})"
            )));
        }

        let detail_level_id = read_i64(bytes, 24);
        if detail_level_id < 0 {
            return Err(err(format!("negative detail level id {detail_level_id}")));
        }
        let start_time = read_i64(bytes, 32);
        let end_time = read_i64(bytes, 40);
        if start_time >= end_time {
            return Err(err(format!(
                "start_time ({start_time}) >= end_time ({end_time})"
            )));
        }
        let proposed_data_age = read_i64(bytes, 48);
        let accepted_time_delta = read_i64(bytes, 56);

        let data_type_raw = read_i64(bytes, 64);
        let data_type = DataType::from_encoding(data_type_raw)
            .ok_or_else(|| err(format!("unknown data type code {data_type_raw}")))?;

        let method_raw = read_i64(bytes, 72);
        let calculation_method = CalculationMethod::from_encoding(method_raw)
            .ok_or_else(|| err(format!("unknown calculation method code {method_raw}")))?;

        let param_count = read_u32(bytes, 80) as usize;
        let config_id_len = read_u32(bytes, 84) as usize;

        let expected_offset = compute_data_offset(param_count, config_id_len);
        if expected_offset != data_offset {
            return Err(err(format!(
                "dataOffset field ({data_offset}) does not match the value implied by paramCount \
                 ({param_count}) and configIdByteLen ({config_id_len}): expected {expected_offset}"
            )));
        }
        if (bytes.len() as u64) < data_offset {
            return Err(err(format!(
                "file too small ({} bytes) to hold declared header ({data_offset} bytes)",
                bytes.len()
            )));
        }

        let mut offset = FIXED_HEADER_LEN;
        let mut calculation_method_parameters = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            calculation_method_parameters.push(read_i64(bytes, offset));
            offset += 8;
        }

        let config_id_bytes = &bytes[offset..offset + config_id_len];
        offset += config_id_len;
        let configuration_id = String::from_utf8(strip_nuls(config_id_bytes))
            .map_err(|_| err("configuration id is not valid UTF-8".to_string()))?;

        let stored_crc = read_u32(bytes, offset);
        let computed_crc = crc32(&bytes[8..offset]);
        if stored_crc != computed_crc {
            return Err(err(format!(
                "header CRC mismatch: stored 0x{stored_crc:08x}, computed 0x{computed_crc:08x}"
            )));
        }

        Ok(Header {
            data_offset,
            detail_level_id: detail_level_id as u32,
            start_time,
            end_time,
            proposed_data_age,
            accepted_time_delta,
            data_type,
            calculation_method,
            calculation_method_parameters,
            configuration_id,
        })
    }

    /// Reads just enough of the fixed prefix to learn the header's total declared length, so a
    /// caller can read exactly that many bytes before handing them to [`Header::decode`].
    /// Returns `None` if `bytes` doesn't even cover the fixed-size prefix.
    pub fn peek_declared_length(bytes: &[u8]) -> Option<u64> {
        if bytes.len() < FIXED_HEADER_LEN {
            return None;
        }
        let param_count = read_u32(bytes, 80) as usize;
        let config_id_len = read_u32(bytes, 84) as usize;
        Some(compute_data_offset(param_count, config_id_len))
    }
}

fn strip_nuls(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().copied().filter(|&b| b != 0).collect()
}

fn compute_data_offset(param_count: usize, config_id_byte_len: usize) -> u64 {
    (FIXED_HEADER_LEN as u64) + (param_count as u64) * 8 + (config_id_byte_len as u64) + (CRC_LEN as u64)
}

pub(crate) fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(bytes[offset..offset + 8].try_into().expect("8-byte slice"))
}

fn read_i64(bytes: &[u8], offset: usize) -> i64 {
    i64::from_be_bytes(bytes[offset..offset + 8].try_into().expect("8-byte slice"))
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().expect("4-byte slice"))
}
