//! Calculation providers (§4.F): the NATIVE/AVERAGE/MINIMUM/MAXIMUM reductions that turn a
//! window of input samples into one output sample for the next detail level.

use crate::value::{CalculationMethod, DataType, Payload, Sample};

/// The capability every calculation method implements.
pub trait CalculationProvider {
    /// `true` for providers that forward each input sample unchanged rather than buffering a
    /// window (only NATIVE).
    fn pass_through(&self) -> bool;

    /// How wide a window (in milliseconds) this provider needs buffered before it can emit.
    fn required_timespan_ms(&self) -> u64;

    fn input_type(&self) -> DataType;
    fn output_type(&self) -> DataType;

    /// Reduces `samples` (chronologically ordered, all falling in `[window_start, window_end)`)
    /// to one output sample timestamped at `window_start`.
    fn generate_value(&self, window_start: i64, window_end: i64, samples: &[Sample]) -> Sample;
}

/// Builds the provider for `method`, reading `required_timespan_ms` from
/// `calculation_method_parameters[0]` (0 for NATIVE, which ignores it).
pub fn make_provider(
    method: CalculationMethod,
    parameters: &[i64],
    input_type: DataType,
    output_type: DataType,
) -> Box<dyn CalculationProvider + Send + Sync> {
    let required_timespan_ms = parameters.first().copied().unwrap_or(0).max(0) as u64;
    match method {
        CalculationMethod::Native | CalculationMethod::Unknown => Box::new(NativeProvider { input_type, output_type }),
        CalculationMethod::Average => Box::new(AverageProvider {
            required_timespan_ms,
            input_type,
            output_type,
        }),
        CalculationMethod::Minimum => Box::new(ExtremumProvider {
            required_timespan_ms,
            input_type,
            output_type,
            pick: Extremum::Minimum,
        }),
        CalculationMethod::Maximum => Box::new(ExtremumProvider {
            required_timespan_ms,
            input_type,
            output_type,
            pick: Extremum::Maximum,
        }),
    }
}

/// The shared tie-break for AVERAGE/MINIMUM/MAXIMUM when no sample in the window has
/// `quality_indicator > 0`.
fn no_valid_input_sample(time: i64, output_type: DataType) -> Sample {
    let payload = match output_type {
        DataType::Double => Payload::Double(f64::NAN),
        DataType::Long | DataType::Unknown => Payload::Long(0),
    };
    Sample {
        time,
        quality_indicator: 0.0,
        manual_indicator: 0.0,
        base_value_count: 0,
        payload,
    }
}

fn convert(value: f64, output_type: DataType) -> Payload {
    match output_type {
        DataType::Double => Payload::Double(value),
        DataType::Long | DataType::Unknown => Payload::Long(Payload::Double(value).as_long()),
    }
}

/// Segment durations for duration-weighted aggregation: sample `i` is treated as holding from
/// its own timestamp until the next sample's timestamp (or `window_end` for the last one).
fn segment_durations(window_end: i64, samples: &[Sample]) -> Vec<f64> {
    samples
        .iter()
        .enumerate()
        .map(|(i, sample)| {
            let seg_end = samples.get(i + 1).map(|s| s.time).unwrap_or(window_end);
            (seg_end - sample.time).max(0) as f64
        })
        .collect()
}

/// Identity: forwards its single input sample unchanged (§8.10, the aggregation-identity law).
struct NativeProvider {
    input_type: DataType,
    output_type: DataType,
}

impl CalculationProvider for NativeProvider {
    fn pass_through(&self) -> bool {
        true
    }

    fn required_timespan_ms(&self) -> u64 {
        0
    }

    fn input_type(&self) -> DataType {
        self.input_type
    }

    fn output_type(&self) -> DataType {
        self.output_type
    }

    fn generate_value(&self, _window_start: i64, _window_end: i64, samples: &[Sample]) -> Sample {
        samples.first().copied().unwrap_or_else(|| no_valid_input_sample(_window_start, self.output_type))
    }
}

struct AverageProvider {
    required_timespan_ms: u64,
    input_type: DataType,
    output_type: DataType,
}

impl CalculationProvider for AverageProvider {
    fn pass_through(&self) -> bool {
        false
    }

    fn required_timespan_ms(&self) -> u64 {
        self.required_timespan_ms
    }

    fn input_type(&self) -> DataType {
        self.input_type
    }

    fn output_type(&self) -> DataType {
        self.output_type
    }

    fn generate_value(&self, window_start: i64, window_end: i64, samples: &[Sample]) -> Sample {
        if samples.is_empty() {
            return no_valid_input_sample(window_start, self.output_type);
        }
        let durations = segment_durations(window_end, samples);
        let total_duration = (window_end - window_start).max(0) as f64;

        let mut quality_weighted = 0.0;
        let mut manual_weighted = 0.0;
        let mut valid_value_weighted = 0.0;
        let mut valid_weight = 0.0;
        let mut base_value_count = 0u64;

        for (sample, &duration) in samples.iter().zip(durations.iter()) {
            quality_weighted += sample.quality_indicator * duration;
            manual_weighted += sample.manual_indicator * duration;
            base_value_count += sample.base_value_count;
            if sample.quality_indicator > 0.0 {
                valid_value_weighted += sample.payload.as_double() * duration;
                valid_weight += duration;
            }
        }

        if valid_weight <= 0.0 {
            return no_valid_input_sample(window_start, self.output_type);
        }

        let quality_indicator = if total_duration > 0.0 { quality_weighted / total_duration } else { 0.0 };
        let manual_indicator = if total_duration > 0.0 { manual_weighted / total_duration } else { 0.0 };
        let value = valid_value_weighted / valid_weight;

        Sample {
            time: window_start,
            quality_indicator,
            manual_indicator,
            base_value_count,
            payload: convert(value, self.output_type),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Extremum {
    Minimum,
    Maximum,
}

struct ExtremumProvider {
    required_timespan_ms: u64,
    input_type: DataType,
    output_type: DataType,
    pick: Extremum,
}

impl CalculationProvider for ExtremumProvider {
    fn pass_through(&self) -> bool {
        false
    }

    fn required_timespan_ms(&self) -> u64 {
        self.required_timespan_ms
    }

    fn input_type(&self) -> DataType {
        self.input_type
    }

    fn output_type(&self) -> DataType {
        self.output_type
    }

    fn generate_value(&self, window_start: i64, window_end: i64, samples: &[Sample]) -> Sample {
        if samples.is_empty() {
            return no_valid_input_sample(window_start, self.output_type);
        }
        let durations = segment_durations(window_end, samples);
        let total_duration = (window_end - window_start).max(0) as f64;

        let mut manual_weighted = 0.0;
        let mut valid_duration = 0.0;
        let mut base_value_count = 0u64;
        let mut extremum: Option<f64> = None;

        for (sample, &duration) in samples.iter().zip(durations.iter()) {
            manual_weighted += sample.manual_indicator * duration;
            base_value_count += sample.base_value_count;
            if sample.quality_indicator > 0.0 {
                valid_duration += duration;
                let v = sample.payload.as_double();
                extremum = Some(match (extremum, self.pick) {
                    (None, _) => v,
                    (Some(current), Extremum::Minimum) => current.min(v),
                    (Some(current), Extremum::Maximum) => current.max(v),
                });
            }
        }

        let Some(value) = extremum else {
            return no_valid_input_sample(window_start, self.output_type);
        };

        let quality_indicator = if total_duration > 0.0 { valid_duration / total_duration } else { 0.0 };
        let manual_indicator = if total_duration > 0.0 { manual_weighted / total_duration } else { 0.0 };

        Sample {
            time: window_start,
            quality_indicator,
            manual_indicator,
            base_value_count,
            payload: convert(value, self.output_type),
        }
    }
}
