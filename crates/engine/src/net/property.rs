use std::collections::VecDeque;

use super::bitstream::{BitError, BitStream};
use super::variant::{ValueEncoding, Variant};

const HISTORY_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("half floats and quantization are mutually exclusive on one property")]
    HalfFloatWithQuantization,
    #[error("quantization range is empty or inverted")]
    InvalidQuantizationRange,
    #[error("delta threshold must be positive when enabled")]
    InvalidDeltaThreshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterpolationCurve {
    #[default]
    Linear,
    CatmullRom,
}

/// Per-property replication settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyConfig {
    pub use_delta_threshold: bool,
    pub delta_threshold: f32,
    pub use_half_floats: bool,
    pub use_quantization: bool,
    pub quantization_min: f32,
    pub quantization_max: f32,
    pub use_interpolation: bool,
    pub interpolation_curve: InterpolationCurve,
    /// Offset from now at which received samples are read, usually negative.
    pub sample_time_offset: f32,
    /// Seconds to extrapolate beyond the newest sample before freezing.
    pub extrapolation_limit: f32,
    pub use_convergence: bool,
    pub active_convergence_weight: f32,
    pub resting_convergence_duration: f32,
    /// Frame interval between convergence steps.
    pub convergence_interval: u32,
    pub snap_threshold: f32,
}

impl Default for PropertyConfig {
    fn default() -> Self {
        Self {
            use_delta_threshold: false,
            delta_threshold: 1.0,
            use_half_floats: false,
            use_quantization: false,
            quantization_min: -1.0,
            quantization_max: 1.0,
            use_interpolation: false,
            interpolation_curve: InterpolationCurve::Linear,
            sample_time_offset: 0.0,
            extrapolation_limit: 1.0,
            use_convergence: false,
            active_convergence_weight: 0.1,
            resting_convergence_duration: 0.05,
            convergence_interval: 1,
            snap_threshold: 10.0,
        }
    }
}

impl PropertyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_half_floats && self.use_quantization {
            return Err(ConfigError::HalfFloatWithQuantization);
        }
        if self.use_quantization && self.quantization_min >= self.quantization_max {
            return Err(ConfigError::InvalidQuantizationRange);
        }
        if self.use_delta_threshold && self.delta_threshold <= 0.0 {
            return Err(ConfigError::InvalidDeltaThreshold);
        }
        Ok(())
    }
}

/// One replicated named value: the locally visible value, the last value the
/// authority observed, and the history of received authoritative samples.
#[derive(Debug, Clone)]
pub struct ReplicaProperty {
    name: String,
    config: PropertyConfig,
    value: Variant,
    last_observed: Variant,
    history: VecDeque<(f32, Variant)>,
    last_change_timestamp: f32,
    frames_since_convergence: u32,
}

impl ReplicaProperty {
    pub fn new(
        name: impl Into<String>,
        initial: Variant,
        config: PropertyConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            last_observed: initial.clone(),
            value: initial,
            history: VecDeque::new(),
            last_change_timestamp: 0.0,
            frames_since_convergence: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PropertyConfig {
        &self.config
    }

    pub fn get(&self) -> &Variant {
        &self.value
    }

    pub fn set(&mut self, value: Variant) {
        self.value = value;
    }

    pub fn last_change_timestamp(&self) -> f32 {
        self.last_change_timestamp
    }

    fn encoding(&self) -> ValueEncoding {
        if !self.value.is_floating_point() {
            return ValueEncoding::Full;
        }
        if self.config.use_half_floats {
            ValueEncoding::Half
        } else if self.config.use_quantization {
            ValueEncoding::Quantized {
                min: self.config.quantization_min,
                max: self.config.quantization_max,
                quantum: if self.config.use_delta_threshold {
                    self.config.delta_threshold
                } else {
                    // Quantization reuses the delta threshold as its quantum;
                    // without one, fall back to a fine default step.
                    0.0001
                },
            }
        } else {
            ValueEncoding::Full
        }
    }

    /// True when the current value differs from the last observed value by
    /// more than the delta threshold.
    pub fn has_changed(&self) -> bool {
        let distance = self.value.distance(&self.last_observed);
        if self.config.use_delta_threshold {
            distance > self.config.delta_threshold
        } else {
            distance > 0.0
        }
    }

    /// Records the current value as observed at `timestamp`.
    pub fn mark_observed(&mut self, timestamp: f32) {
        self.last_observed = self.value.clone();
        self.last_change_timestamp = timestamp;
    }

    pub fn serialize(&self, stream: &mut BitStream) -> Result<(), BitError> {
        self.value.write(stream, self.encoding())
    }

    /// Reads a received authoritative value and appends it to the sample
    /// history. The locally visible value is updated immediately when neither
    /// interpolation nor convergence is enabled.
    pub fn deserialize(&mut self, stream: &mut BitStream, timestamp: f32) -> Result<(), BitError> {
        let mut received = self.value.clone();
        received.read_in_place(stream, self.encoding())?;

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        // Keep the history time-ordered even when changes arrive late.
        let position = self
            .history
            .iter()
            .position(|(time, _)| *time > timestamp)
            .unwrap_or(self.history.len());
        self.history.insert(position, (timestamp, received.clone()));
        self.last_change_timestamp = timestamp;

        if !self.config.use_interpolation && !self.config.use_convergence {
            self.value = received.clone();
        }
        self.last_observed = received;
        Ok(())
    }

    /// Samples the authoritative value at `now + sample_time_offset`.
    /// Beyond the newest sample, extrapolates for at most
    /// `extrapolation_limit` seconds and then freezes.
    pub fn sample(&self, now: f32) -> Option<Variant> {
        let (&(first_time, ref first), &(last_time, ref last)) =
            (self.history.front()?, self.history.back()?);
        let target = now + self.config.sample_time_offset;

        if !self.config.use_interpolation || self.history.len() == 1 {
            return Some(last.clone());
        }
        if target <= first_time {
            return Some(first.clone());
        }
        if target >= last_time {
            let overshoot = target - last_time;
            if overshoot > self.config.extrapolation_limit {
                return Some(last.clone());
            }
            // Linear extrapolation off the two newest samples.
            let (prev_time, prev) = &self.history[self.history.len() - 2];
            let span = last_time - prev_time;
            if span <= 0.0 {
                return Some(last.clone());
            }
            let t = 1.0 + overshoot / span;
            return Some(prev.lerp(last, t));
        }

        let upper = self
            .history
            .iter()
            .position(|(time, _)| *time >= target)
            .unwrap_or(self.history.len() - 1);
        let lower = upper.saturating_sub(1);
        let (lower_time, lower_value) = &self.history[lower];
        let (upper_time, upper_value) = &self.history[upper];
        let span = upper_time - lower_time;
        let t = if span > 0.0 {
            (target - lower_time) / span
        } else {
            0.0
        };

        match self.config.interpolation_curve {
            InterpolationCurve::Linear => Some(lower_value.lerp(upper_value, t)),
            InterpolationCurve::CatmullRom => {
                let before = &self.history[lower.saturating_sub(1)].1;
                let after = &self.history[(upper + 1).min(self.history.len() - 1)].1;
                Some(Variant::hermite(before, lower_value, upper_value, after, t))
            }
        }
    }

    /// Blends the locally simulated value toward the sampled authoritative
    /// value. Called once per frame on receiving peers.
    pub fn converge(&mut self, now: f32, dt: f32) {
        if !self.config.use_convergence {
            if self.config.use_interpolation {
                if let Some(sampled) = self.sample(now) {
                    self.value = sampled;
                }
            }
            return;
        }

        self.frames_since_convergence += 1;
        if self.frames_since_convergence < self.config.convergence_interval.max(1) {
            return;
        }
        self.frames_since_convergence = 0;

        let Some(target) = self.sample(now) else {
            return;
        };

        if self.value.distance(&target) > self.config.snap_threshold {
            self.value = target;
            return;
        }

        let target_time = now + self.config.sample_time_offset;
        let resting = self
            .history
            .back()
            .is_some_and(|(time, _)| target_time >= *time);
        let weight = if resting {
            if self.config.resting_convergence_duration <= 0.0 {
                1.0
            } else {
                (dt * self.config.convergence_interval.max(1) as f32
                    / self.config.resting_convergence_duration)
                    .min(1.0)
            }
        } else {
            self.config.active_convergence_weight
        };
        self.value = self.value.lerp(&target, weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn real3_property(config: PropertyConfig) -> ReplicaProperty {
        ReplicaProperty::new("Position", Variant::Real3(Vec3::ZERO), config).unwrap()
    }

    #[test]
    fn half_floats_with_quantization_rejected() {
        let config = PropertyConfig {
            use_half_floats: true,
            use_quantization: true,
            ..Default::default()
        };
        assert_eq!(
            ReplicaProperty::new("Bad", Variant::Real(0.0), config).unwrap_err(),
            ConfigError::HalfFloatWithQuantization
        );
    }

    #[test]
    fn change_detection_respects_threshold() {
        let config = PropertyConfig {
            use_delta_threshold: true,
            delta_threshold: 0.5,
            ..Default::default()
        };
        let mut property = real3_property(config);
        property.set(Variant::Real3(Vec3::new(0.4, 0.0, 0.0)));
        assert!(!property.has_changed());
        property.set(Variant::Real3(Vec3::new(0.6, 0.0, 0.0)));
        assert!(property.has_changed());
        property.mark_observed(1.0);
        assert!(!property.has_changed());
    }

    #[test]
    fn interpolation_between_samples() {
        let config = PropertyConfig {
            use_interpolation: true,
            sample_time_offset: -0.1,
            ..Default::default()
        };
        let mut property = real3_property(config);
        let mut stream = BitStream::new();
        Variant::Real3(Vec3::new(1.0, 2.0, 3.0))
            .write(&mut stream, ValueEncoding::Full)
            .unwrap();
        Variant::Real3(Vec3::new(1.0, 2.0, 4.0))
            .write(&mut stream, ValueEncoding::Full)
            .unwrap();
        property.deserialize(&mut stream, 1.0).unwrap();
        property.deserialize(&mut stream, 1.05).unwrap();

        // now = 1.125 samples at t = 1.025, halfway between the two samples.
        let sampled = property.sample(1.125).unwrap();
        match sampled {
            Variant::Real3(value) => {
                assert!((value.z - 3.5).abs() < 1e-5);
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn extrapolation_freezes_at_limit() {
        let config = PropertyConfig {
            use_interpolation: true,
            extrapolation_limit: 0.1,
            ..Default::default()
        };
        let mut property = real3_property(config);
        let mut stream = BitStream::new();
        for x in [0.0f32, 1.0] {
            Variant::Real3(Vec3::new(x, 0.0, 0.0))
                .write(&mut stream, ValueEncoding::Full)
                .unwrap();
        }
        property.deserialize(&mut stream, 0.0).unwrap();
        property.deserialize(&mut stream, 1.0).unwrap();

        // Far beyond the limit: frozen at the newest sample.
        match property.sample(10.0).unwrap() {
            Variant::Real3(value) => assert_eq!(value.x, 1.0),
            other => panic!("unexpected variant {other:?}"),
        }
        // Inside the limit: extrapolates past the newest sample.
        match property.sample(1.05).unwrap() {
            Variant::Real3(value) => assert!(value.x > 1.0),
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn convergence_snaps_past_threshold() {
        let config = PropertyConfig {
            use_convergence: true,
            snap_threshold: 0.5,
            ..Default::default()
        };
        let mut property = real3_property(config);
        let mut stream = BitStream::new();
        Variant::Real3(Vec3::new(5.0, 0.0, 0.0))
            .write(&mut stream, ValueEncoding::Full)
            .unwrap();
        property.deserialize(&mut stream, 1.0).unwrap();
        property.converge(1.0, 1.0 / 60.0);
        assert_eq!(property.get(), &Variant::Real3(Vec3::new(5.0, 0.0, 0.0)));
    }

    #[test]
    fn quantized_serialization_round_trip() {
        let config = PropertyConfig {
            use_delta_threshold: true,
            delta_threshold: 0.01,
            use_quantization: true,
            quantization_min: -100.0,
            quantization_max: 100.0,
            ..Default::default()
        };
        let mut property = real3_property(config.clone());
        property.set(Variant::Real3(Vec3::new(1.0, -2.5, 30.125)));

        let mut stream = BitStream::new();
        property.serialize(&mut stream).unwrap();

        let mut receiver = real3_property(config);
        receiver.deserialize(&mut stream, 0.5).unwrap();
        assert!(property.get().distance(receiver.get()) <= 0.005 + 1e-4);
    }
}
