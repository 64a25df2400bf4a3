//! Raw ↔ physical unit conversion for TMCM axis parameters.
//!
//! The controller reports positions in microsteps, speeds and
//! accelerations in internal divisor-scaled units and currents as a
//! fraction of the module's top RMS current. Raw values outside the
//! controller's representable range are rejected before anything is
//! sent to the device:
//!
//! - speed: \[-2047, 2047\]
//! - acceleration: \[0, 2047\]
//! - current: \[0, 255\]

use beamctl_common::error::DeviceError;

/// Per-axis conversion parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisConverter {
    /// Maximum RMS current of the module \[A\].
    pub top_rms_current: f64,
    /// Physical size of one full step (mm or degrees).
    pub full_step_size: f64,
    /// Module clock frequency \[Hz\].
    pub clock_freq: f64,
    pub pulse_divisor: u32,
    pub ramp_divisor: u32,
    pub microstep_resolution: u32,
}

impl AxisConverter {
    pub fn new(top_rms_current: f64, full_step_size: f64, clock_freq: f64) -> Self {
        Self {
            top_rms_current,
            full_step_size,
            clock_freq,
            pulse_divisor: 1,
            ramp_divisor: 1,
            microstep_resolution: 1,
        }
    }

    fn pow2(exponent: u32) -> f64 {
        f64::from(2u32).powi(exponent as i32)
    }

    /// Truncate towards zero, but snap values that are within float
    /// noise of an integer so that raw → phys → raw stays exact.
    fn trunc(value: f64) -> i64 {
        let rounded = value.round();
        if (value - rounded).abs() < 1e-9 * rounded.abs().max(1.0) {
            rounded as i64
        } else {
            value.trunc() as i64
        }
    }

    // ─── Current ───────────────────────────────────────────────────

    pub fn current_to_raw(&self, current: f64) -> Result<i32, DeviceError> {
        if !(0.0..=self.top_rms_current).contains(&current) {
            return Err(DeviceError::OutOfRange(format!(
                "current {current} A outside [0, {}] A",
                self.top_rms_current
            )));
        }
        Ok(Self::trunc(current * 255.0 / self.top_rms_current) as i32)
    }

    pub fn current_to_phys(&self, raw: i32) -> f64 {
        f64::from(raw) * self.top_rms_current / 255.0
    }

    // ─── Acceleration ──────────────────────────────────────────────

    pub fn accel_to_raw(&self, accel: f64) -> Result<i32, DeviceError> {
        let scale = Self::pow2(
            self.pulse_divisor + self.ramp_divisor + self.microstep_resolution + 29,
        );
        let raw = Self::trunc(accel / self.full_step_size / self.clock_freq.powi(2) * scale);
        if !(0..=2047).contains(&raw) {
            return Err(DeviceError::OutOfRange(format!(
                "acceleration {accel} out of bounds (raw {raw})"
            )));
        }
        Ok(raw as i32)
    }

    pub fn accel_to_phys(&self, raw: i32) -> f64 {
        f64::from(raw) * self.full_step_size * self.clock_freq.powi(2)
            / Self::pow2(
                self.pulse_divisor + self.ramp_divisor + self.microstep_resolution + 29,
            )
    }

    // ─── Speed ─────────────────────────────────────────────────────

    pub fn speed_to_raw(&self, speed: f64) -> Result<i32, DeviceError> {
        let scale = Self::pow2(self.pulse_divisor + self.microstep_resolution + 16);
        let raw = Self::trunc(speed * scale / self.clock_freq / self.full_step_size);
        if !(-2047..=2047).contains(&raw) {
            return Err(DeviceError::OutOfRange(format!(
                "speed {speed} out of bounds (raw {raw})"
            )));
        }
        Ok(raw as i32)
    }

    pub fn speed_to_phys(&self, raw: i32) -> f64 {
        f64::from(raw) / Self::pow2(self.pulse_divisor + self.microstep_resolution + 16)
            * self.clock_freq
            * self.full_step_size
    }

    // ─── Position ──────────────────────────────────────────────────

    pub fn position_to_raw(&self, position: f64) -> Result<i32, DeviceError> {
        let raw = Self::trunc(
            position * Self::pow2(self.microstep_resolution) / self.full_step_size,
        );
        i32::try_from(raw).map_err(|_| {
            DeviceError::OutOfRange(format!("position {position} not representable"))
        })
    }

    pub fn position_to_phys(&self, raw: i32) -> f64 {
        f64::from(raw) * self.full_step_size / Self::pow2(self.microstep_resolution)
    }

    // ─── Range helpers ─────────────────────────────────────────────

    pub fn maximum_speed(&self) -> f64 {
        self.speed_to_phys(2047)
    }

    pub fn maximum_acceleration(&self) -> f64 {
        self.accel_to_phys(2047)
    }

    pub fn maximum_current(&self) -> f64 {
        self.current_to_phys(255)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmcm351_axis() -> AxisConverter {
        let mut conv = AxisConverter::new(2.8, 1.0 / 200.0, 16_000_000.0);
        conv.pulse_divisor = 5;
        conv.ramp_divisor = 7;
        conv.microstep_resolution = 6;
        conv
    }

    #[test]
    fn raw_to_phys_to_raw_is_exact() {
        let conv = tmcm351_axis();
        for raw in [-2047, -1024, -1, 0, 1, 512, 2047] {
            assert_eq!(conv.speed_to_raw(conv.speed_to_phys(raw)).unwrap(), raw);
        }
        for raw in [0, 1, 100, 2047] {
            assert_eq!(conv.accel_to_raw(conv.accel_to_phys(raw)).unwrap(), raw);
        }
        for raw in [0, 1, 128, 255] {
            assert_eq!(conv.current_to_raw(conv.current_to_phys(raw)).unwrap(), raw);
        }
        for raw in [-1_000_000, -1, 0, 1, 1_000_000] {
            assert_eq!(
                conv.position_to_raw(conv.position_to_phys(raw)).unwrap(),
                raw
            );
        }
    }

    #[test]
    fn phys_to_raw_to_phys_is_identity_up_to_one_raw_unit() {
        let conv = tmcm351_axis();
        let step = conv.speed_to_phys(1);
        for speed in [0.0, 0.37, 1.21, -2.5] {
            let roundtrip = conv.speed_to_phys(conv.speed_to_raw(speed).unwrap());
            assert!((roundtrip - speed).abs() <= step);
        }
    }

    #[test]
    fn out_of_bounds_raw_values_are_rejected() {
        let conv = tmcm351_axis();
        assert!(conv.speed_to_raw(conv.speed_to_phys(2048)).is_err());
        assert!(conv.speed_to_raw(conv.speed_to_phys(-2048)).is_err());
        assert!(conv.accel_to_raw(conv.accel_to_phys(2048)).is_err());
        assert!(conv.accel_to_raw(-1.0).is_err());
        assert!(conv.current_to_raw(2.81).is_err());
        assert!(conv.current_to_raw(-0.1).is_err());
        // One step inside the bounds is accepted.
        assert!(conv.speed_to_raw(conv.speed_to_phys(2047)).is_ok());
        assert!(conv.current_to_raw(2.8).is_ok());
    }

    #[test]
    fn divisor_changes_rescale_conversions() {
        let mut conv = tmcm351_axis();
        let one_before = conv.speed_to_phys(1000);
        conv.pulse_divisor += 1;
        let one_after = conv.speed_to_phys(1000);
        assert!((one_before / one_after - 2.0).abs() < 1e-12);
    }
}
