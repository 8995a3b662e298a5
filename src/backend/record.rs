//! Fixed-size record encoding (§4.B.1): 40 data bytes plus a single LRC byte.

use crate::value::{DataType, Payload, Sample};

pub const RECORD_SIZE: usize = 41;
const LRC_SEED: u8 = 0x5a;

/// Encodes one sample into its 41-byte on-disk form.
pub fn encode(sample: &Sample) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    buf[0..8].copy_from_slice(&sample.time.to_be_bytes());
    buf[8..16].copy_from_slice(&sample.quality_indicator.to_bits().to_be_bytes());
    buf[16..24].copy_from_slice(&sample.manual_indicator.to_bits().to_be_bytes());
    buf[24..32].copy_from_slice(&sample.base_value_count.to_be_bytes());
    let value_bits: u64 = match sample.payload {
        Payload::Long(v) => v as u64,
        Payload::Double(v) => v.to_bits(),
    };
    buf[32..40].copy_from_slice(&value_bits.to_be_bytes());
    buf[40] = lrc(&buf[0..40]);
    buf
}

/// Decodes a 41-byte record, verifying its LRC.
///
/// `data_type` tells us whether the value field is an `i64` or IEEE-754 bits, matching the
/// shard's declared type.
pub fn decode(bytes: &[u8; RECORD_SIZE], data_type: DataType) -> Result<Sample, LrcMismatch> {
    let computed = lrc(&bytes[0..40]);
    if computed != bytes[40] {
        return Err(LrcMismatch {
            expected: computed,
            actual: bytes[40],
        });
    }

    let time = i64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let quality_indicator = f64::from_bits(u64::from_be_bytes(bytes[8..16].try_into().unwrap()));
    let manual_indicator = f64::from_bits(u64::from_be_bytes(bytes[16..24].try_into().unwrap()));
    let base_value_count = u64::from_be_bytes(bytes[24..32].try_into().unwrap());
    let value_bits = u64::from_be_bytes(bytes[32..40].try_into().unwrap());
    let payload = match data_type {
        DataType::Double => Payload::Double(f64::from_bits(value_bits)),
        DataType::Long | DataType::Unknown => Payload::Long(value_bits as i64),
    };

    Ok(Sample {
        time,
        quality_indicator,
        manual_indicator,
        base_value_count,
        payload,
    })
}

/// Reads only the `time` field of a record, for use during binary search where decoding the rest
/// of the record (and checking its LRC) would be wasted work until we've located our window.
pub fn peek_time(bytes: &[u8; RECORD_SIZE]) -> i64 {
    i64::from_be_bytes(bytes[0..8].try_into().unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LrcMismatch {
    pub expected: u8,
    pub actual: u8,
}

fn lrc(data: &[u8]) -> u8 {
    data.iter().fold(LRC_SEED, |acc, &b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_long_sample() {
        let s = Sample::new_long(123, 0.5, 0.25, 4, -99);
        let bytes = encode(&s);
        let decoded = decode(&bytes, DataType::Long).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn round_trips_double_sample() {
        let s = Sample::new_double(123, 1.0, 0.0, 1, 3.5);
        let bytes = encode(&s);
        let decoded = decode(&bytes, DataType::Double).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn flipping_any_bit_in_value_region_is_detected() {
        let s = Sample::new_long(123, 0.5, 0.25, 4, -99);
        let bytes = encode(&s);
        for byte_index in 0..40 {
            for bit in 0..8u8 {
                let mut corrupted = bytes;
                corrupted[byte_index] ^= 1 << bit;
                assert!(decode(&corrupted, DataType::Long).is_err());
            }
        }
    }

    proptest::proptest! {
        #[test]
        fn long_samples_round_trip_for_any_field_values(
            time: i64,
            quality in 0.0f64..=1.0,
            manual in 0.0f64..=1.0,
            base_value_count: u64,
            value: i64,
        ) {
            let s = Sample::new_long(time, quality, manual, base_value_count, value);
            let bytes = encode(&s);
            let decoded = decode(&bytes, DataType::Long).unwrap();
            proptest::prop_assert_eq!(decoded, s);
        }

        #[test]
        fn double_samples_round_trip_for_any_finite_value(
            time: i64,
            quality in 0.0f64..=1.0,
            manual in 0.0f64..=1.0,
            base_value_count: u64,
            value in proptest::num::f64::NORMAL | proptest::num::f64::ZERO,
        ) {
            let s = Sample::new_double(time, quality, manual, base_value_count, value);
            let bytes = encode(&s);
            let decoded = decode(&bytes, DataType::Double).unwrap();
            proptest::prop_assert_eq!(decoded, s);
        }
    }
}
