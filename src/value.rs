//! Sample records and per-stream metadata.
//!
//! `LongValue` and `DoubleValue` from the source system are flattened into one [`Sample`] type
//! carrying a tagged [`Payload`]; calculation providers and the file back-end both match on the
//! payload rather than working through a `LongValue`/`DoubleValue` class hierarchy.

use std::cmp::Ordering;

/// The value carried by a [`Sample`], tagged by which on-disk encoding it uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Long(i64),
    Double(f64),
}

impl Payload {
    pub fn data_type(&self) -> DataType {
        match self {
            Payload::Long(_) => DataType::Long,
            Payload::Double(_) => DataType::Double,
        }
    }

    /// Widens a long to a double, or returns the double unchanged.
    pub fn as_double(&self) -> f64 {
        match *self {
            Payload::Long(v) => v as f64,
            Payload::Double(v) => v,
        }
    }

    /// Converts to long, rounding half-away-from-zero when narrowing from double.
    pub fn as_long(&self) -> i64 {
        match *self {
            Payload::Long(v) => v,
            Payload::Double(v) => {
                if v >= 0.0 {
                    (v + 0.5).floor() as i64
                } else {
                    (v - 0.5).ceil() as i64
                }
            }
        }
    }
}

/// A single timestamped sample: a long or double value plus quality/manual/base-count metadata.
///
/// Ordering is by `time` alone; equality requires every field to match, which is why `Sample`
/// does not derive `Ord`/`PartialOrd` directly (two samples at the same time but different values
/// are unordered with respect to each other but not equal).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time: i64,
    pub quality_indicator: f64,
    pub manual_indicator: f64,
    pub base_value_count: u64,
    pub payload: Payload,
}

impl Sample {
    pub fn new_long(time: i64, quality_indicator: f64, manual_indicator: f64, base_value_count: u64, value: i64) -> Self {
        Self {
            time,
            quality_indicator,
            manual_indicator,
            base_value_count,
            payload: Payload::Long(value),
        }
    }

    pub fn new_double(time: i64, quality_indicator: f64, manual_indicator: f64, base_value_count: u64, value: f64) -> Self {
        Self {
            time,
            quality_indicator,
            manual_indicator,
            base_value_count,
            payload: Payload::Double(value),
        }
    }

    /// A zero-quality sentinel used to mark a gap caused by shard corruption.
    pub fn sentinel(time: i64, data_type: DataType) -> Self {
        let payload = match data_type {
            DataType::Long | DataType::Unknown => Payload::Long(0),
            DataType::Double => Payload::Double(0.0),
        };
        Self {
            time,
            quality_indicator: 0.0,
            manual_indicator: 0.0,
            base_value_count: 0,
            payload,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.quality_indicator > 0.0
    }
}

/// Orders samples by time only, as the file back-end and multiplexer require for merging.
pub fn by_time(a: &Sample, b: &Sample) -> Ordering {
    a.time.cmp(&b.time)
}

/// How a stream's coarser levels are produced from their inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalculationMethod {
    Unknown,
    Native,
    Average,
    Minimum,
    Maximum,
}

impl CalculationMethod {
    /// The on-disk/wire integer encoding (§6): -1=UNKNOWN, 0=NATIVE, 1=AVERAGE, 2=MINIMUM, 3=MAXIMUM.
    pub fn encoding(self) -> i64 {
        match self {
            CalculationMethod::Unknown => -1,
            CalculationMethod::Native => 0,
            CalculationMethod::Average => 1,
            CalculationMethod::Minimum => 2,
            CalculationMethod::Maximum => 3,
        }
    }

    pub fn from_encoding(value: i64) -> Option<Self> {
        match value {
            -1 => Some(CalculationMethod::Unknown),
            0 => Some(CalculationMethod::Native),
            1 => Some(CalculationMethod::Average),
            2 => Some(CalculationMethod::Minimum),
            3 => Some(CalculationMethod::Maximum),
            _ => None,
        }
    }

    /// The short code used in shard filenames (§4.C): `NAT|AVG|MIN|MAX|UNK`.
    pub fn short_code(self) -> &'static str {
        match self {
            CalculationMethod::Unknown => "UNK",
            CalculationMethod::Native => "NAT",
            CalculationMethod::Average => "AVG",
            CalculationMethod::Minimum => "MIN",
            CalculationMethod::Maximum => "MAX",
        }
    }

    pub fn from_short_code(code: &str) -> Option<Self> {
        match code {
            "UNK" => Some(CalculationMethod::Unknown),
            "NAT" => Some(CalculationMethod::Native),
            "AVG" => Some(CalculationMethod::Average),
            "MIN" => Some(CalculationMethod::Minimum),
            "MAX" => Some(CalculationMethod::Maximum),
            _ => None,
        }
    }
}

/// Which encoding a shard's values use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Unknown,
    Long,
    Double,
}

impl DataType {
    /// The on-disk integer encoding (§6): 0=UNKNOWN, 1=LONG_VALUE, 2=DOUBLE_VALUE.
    pub fn encoding(self) -> i64 {
        match self {
            DataType::Unknown => 0,
            DataType::Long => 1,
            DataType::Double => 2,
        }
    }

    pub fn from_encoding(value: i64) -> Option<Self> {
        match value {
            0 => Some(DataType::Unknown),
            1 => Some(DataType::Long),
            2 => Some(DataType::Double),
            _ => None,
        }
    }
}

/// Describes one shard's identity and policy: which stream, which detail level, which method,
/// the time span it owns, and the retention/merge tolerances that apply to it.
///
/// Cloned freely at component boundaries so that no sub-component can observe another mutating
/// shared metadata (the source system's "defensive copy constructor").
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChannelMetaData {
    pub configuration_id: String,
    pub calculation_method: CalculationMethod,
    pub calculation_method_parameters: Vec<i64>,
    pub detail_level_id: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub data_type: DataType,
    pub proposed_data_age: i64,
    pub accepted_time_delta: i64,
}

impl StorageChannelMetaData {
    /// Enforces the one invariant that matters across every consumer: `startTime < endTime`.
    pub fn validate(&self) -> Result<(), String> {
        if self.configuration_id.is_empty() {
            return Err("configuration_id must not be empty".to_string());
        }
        if self.start_time >= self.end_time {
            return Err(format!(
                "start_time ({}) must be less than end_time ({})",
                self.start_time, self.end_time
            ));
        }
        Ok(())
    }

    pub fn with_span(&self, start_time: i64, end_time: i64) -> Self {
        Self {
            start_time,
            end_time,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_generates_identity_round_trip_for_encoding() {
        for method in [
            CalculationMethod::Unknown,
            CalculationMethod::Native,
            CalculationMethod::Average,
            CalculationMethod::Minimum,
            CalculationMethod::Maximum,
        ] {
            assert_eq!(CalculationMethod::from_encoding(method.encoding()), Some(method));
            assert_eq!(CalculationMethod::from_short_code(method.short_code()), Some(method));
        }
    }

    #[test]
    fn data_type_round_trips() {
        for dt in [DataType::Unknown, DataType::Long, DataType::Double] {
            assert_eq!(DataType::from_encoding(dt.encoding()), Some(dt));
        }
    }

    #[test]
    fn long_to_double_widens_exactly() {
        let p = Payload::Long(42);
        assert_eq!(p.as_double(), 42.0);
    }

    #[test]
    fn double_to_long_rounds_half_away_from_zero() {
        assert_eq!(Payload::Double(2.5).as_long(), 3);
        assert_eq!(Payload::Double(-2.5).as_long(), -3);
        assert_eq!(Payload::Double(2.4).as_long(), 2);
        assert_eq!(Payload::Double(-2.4).as_long(), -2);
    }

    #[test]
    fn metadata_rejects_inverted_span() {
        let meta = StorageChannelMetaData {
            configuration_id: "t".to_string(),
            calculation_method: CalculationMethod::Native,
            calculation_method_parameters: vec![],
            detail_level_id: 0,
            start_time: 1000,
            end_time: 500,
            data_type: DataType::Long,
            proposed_data_age: 0,
            accepted_time_delta: 0,
        };
        assert!(meta.validate().is_err());
    }
}
