//! Pixel-array detector back-end (camserver-style line protocol).
//!
//! Requests and replies are text lines over TCP: replies carry a
//! numeric code, `OK`/`ERR` and a payload. Queries and settings are
//! strictly request/reply and go through the pairing FIFO; per-image
//! notifications during an exposure arrive unsolicited (code 7) and do
//! not advance the FIFO.
//!
//! During exposures the device is legitimately silent for the whole
//! exposure series, so the watchdog is suspended and re-armed when the
//! series completes or is stopped.

use beamctl_common::error::DeviceError;

use crate::backend::{BackendIo, DeviceProcedure};
use crate::message::{BusyKind, DeviceStatus};
use crate::transport::split_lines;
use crate::variable::{VarSpec, VarValue};
use crate::varname::VarName;

/// Discriminator gain setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gain {
    Low,
    Mid,
    High,
}

impl Gain {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "lowg" => Some(Self::Low),
            "mid" | "midg" => Some(Self::Mid),
            "high" | "highg" => Some(Self::High),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        }
    }

    /// Valid trim threshold interval for this gain [eV].
    pub const fn threshold_limits(self) -> (i64, i64) {
        match self {
            Self::Low => (6685, 20202),
            Self::Mid => (4425, 14328),
            Self::High => (3814, 11614),
        }
    }
}

/// Pilatus-class detector back-end.
pub struct PilatusBackend {
    images_expected: i64,
}

impl PilatusBackend {
    pub fn new() -> Self {
        Self { images_expected: 0 }
    }

    fn send_line(&self, io: &mut BackendIo, line: &str) -> Result<(), DeviceError> {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        io.send_paired(bytes)
    }
}

impl Default for PilatusBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProcedure for PilatusBackend {
    fn device_type(&self) -> &'static str {
        "pilatus"
    }

    fn variables(&self) -> Vec<VarSpec> {
        let threshold = VarName::plain("threshold");
        vec![
            VarSpec::new(VarName::plain("version")).urgent(),
            VarSpec::new(VarName::plain("exptime")).urgent(),
            VarSpec::new(VarName::plain("expperiod")).urgent(),
            VarSpec::new(VarName::plain("nimages")).urgent(),
            VarSpec::new(threshold.clone()).urgent(),
            // The threshold query reports the gain in the same reply.
            VarSpec::new(VarName::plain("gain")).depends_on(threshold),
            VarSpec::new(VarName::plain("targetfile")),
            VarSpec::new(VarName::plain("imagesremaining")),
            VarSpec::new(VarName::plain("lastimagefile")),
            VarSpec::new(VarName::plain("lastimagecounts")),
        ]
    }

    fn query(&mut self, io: &mut BackendIo, name: &VarName) -> Result<(), DeviceError> {
        match name.base() {
            "version" => self.send_line(io, "version"),
            "exptime" => self.send_line(io, "exptime"),
            "expperiod" => self.send_line(io, "expperiod"),
            "nimages" => self.send_line(io, "nimages"),
            "threshold" | "gain" => self.send_line(io, "setthreshold"),
            "targetfile" => {
                if io.value(name).is_none() {
                    io.update(name, "");
                }
                Ok(())
            }
            "imagesremaining" => {
                if io.value(name).is_none() {
                    io.update(name, 0i64);
                }
                Ok(())
            }
            "lastimagefile" => {
                if io.value(name).is_none() {
                    io.update(name, "");
                }
                Ok(())
            }
            "lastimagecounts" => {
                if io.value(name).is_none() {
                    io.update(name, 0i64);
                }
                Ok(())
            }
            other => Err(DeviceError::UnknownVariable(other.to_string())),
        }
    }

    fn set(
        &mut self,
        io: &mut BackendIo,
        name: &VarName,
        value: &VarValue,
    ) -> Result<(), DeviceError> {
        match name.base() {
            "exptime" => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| DeviceError::Device("exptime must be a number".into()))?;
                if v <= 0.0 {
                    return Err(DeviceError::OutOfRange(format!("exposure time {v} s")));
                }
                self.send_line(io, &format!("exptime {v:.6}"))
            }
            "expperiod" => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| DeviceError::Device("expperiod must be a number".into()))?;
                self.send_line(io, &format!("expperiod {v:.6}"))
            }
            "nimages" => {
                let v = value
                    .as_i64()
                    .ok_or_else(|| DeviceError::Device("nimages must be an integer".into()))?;
                if v < 1 {
                    return Err(DeviceError::OutOfRange(format!("image count {v}")));
                }
                self.send_line(io, &format!("nimages {v}"))
            }
            other => Err(DeviceError::UnknownVariable(other.to_string())),
        }
    }

    fn execute(
        &mut self,
        io: &mut BackendIo,
        command: &str,
        args: &[VarValue],
    ) -> Result<(), DeviceError> {
        match command {
            "trim" => {
                if io.status() != DeviceStatus::Idle {
                    io.command_failed(command, "detector is not idle");
                    return Ok(());
                }
                let threshold = args
                    .first()
                    .and_then(VarValue::as_i64)
                    .ok_or_else(|| DeviceError::Device("trim: threshold must be an integer".into()))?;
                let Some(gain) = args.get(1).and_then(VarValue::as_str).and_then(Gain::parse)
                else {
                    io.command_failed(command, "gain must be one of low, mid, high");
                    return Ok(());
                };
                let (min, max) = gain.threshold_limits();
                if threshold < min || threshold > max {
                    io.command_failed(
                        command,
                        format!(
                            "threshold {threshold} eV outside [{min}, {max}] eV for {} gain",
                            gain.as_str()
                        ),
                    );
                    return Ok(());
                }
                io.set_status(DeviceStatus::Busy(BusyKind::Trimming));
                self.send_line(io, &format!("setthreshold {}g {threshold}", gain.as_str()))?;
                io.command_finished(command, format!("trimming to {threshold} eV"));
                Ok(())
            }
            "expose" => {
                if io.status() != DeviceStatus::Idle {
                    io.command_failed(command, "detector is not idle");
                    return Ok(());
                }
                let filename = args
                    .first()
                    .and_then(VarValue::as_str)
                    .ok_or_else(|| DeviceError::Device("expose: filename missing".into()))?
                    .to_string();
                let exptime = args
                    .get(1)
                    .and_then(VarValue::as_f64)
                    .ok_or_else(|| DeviceError::Device("expose: exposure time missing".into()))?;
                let nimages = args.get(2).and_then(VarValue::as_i64).unwrap_or(1);
                let period = args
                    .get(3)
                    .and_then(VarValue::as_f64)
                    .unwrap_or(exptime + 0.003);
                if exptime <= 0.0 || nimages < 1 || period < exptime {
                    io.command_failed(command, "invalid exposure parameters");
                    return Ok(());
                }
                self.send_line(io, &format!("exptime {exptime:.6}"))?;
                self.send_line(io, &format!("nimages {nimages}"))?;
                self.send_line(io, &format!("expperiod {period:.6}"))?;
                self.send_line(io, &format!("exposure {filename}"))?;
                self.images_expected = nimages;
                io.update(&VarName::plain("targetfile"), filename.as_str());
                io.update(&VarName::plain("imagesremaining"), nimages);
                io.set_status(DeviceStatus::Busy(BusyKind::Exposing));
                // The detector says nothing until the first image is
                // done; a long series must not trip the watchdog.
                io.suppress_watchdog();
                io.command_finished(command, format!("exposure of {nimages} image(s) started"));
                Ok(())
            }
            "stopexposure" => {
                if io.status() != DeviceStatus::Busy(BusyKind::Exposing) {
                    io.command_failed(command, "no exposure is running");
                    return Ok(());
                }
                io.set_status(DeviceStatus::Busy(BusyKind::Stopping));
                self.send_line(io, "k")?;
                io.command_finished(command, "stopping exposure");
                Ok(())
            }
            _ => {
                io.command_failed(command, "unknown command");
                Ok(())
            }
        }
    }

    fn interpret(
        &mut self,
        io: &mut BackendIo,
        frame: &[u8],
        sent: Option<&[u8]>,
    ) -> Result<(), DeviceError> {
        let line = String::from_utf8_lossy(frame);
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        let mut parts = line.splitn(3, ' ');
        let code: u32 = parts
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| DeviceError::Communication(format!("malformed reply: {line}")))?;
        let verdict = parts.next().unwrap_or("");
        let payload = parts.next().unwrap_or("").trim();

        // Code 7 lines are asynchronous per-image notifications; any
        // other line answers the pending request.
        if code != 7 && sent.is_some() {
            io.complete_pending_sent()?;
        }

        if verdict == "ERR" {
            if io.status().is_busy() {
                io.set_status(DeviceStatus::Idle);
                io.release_watchdog();
            }
            return Err(DeviceError::Device(format!("camserver error: {payload}")));
        }

        if code == 7 {
            // "<path> <total counts>"
            let mut fields = payload.rsplitn(2, ' ');
            let counts: i64 = fields.next().and_then(|c| c.parse().ok()).unwrap_or(0);
            let path = fields.next().unwrap_or(payload);
            io.update_forced(&VarName::plain("lastimagefile"), path);
            io.update_forced(&VarName::plain("lastimagecounts"), counts);
            let remaining = io
                .i64_of(&VarName::plain("imagesremaining"))
                .unwrap_or(self.images_expected)
                - 1;
            io.update(&VarName::plain("imagesremaining"), remaining.max(0));
            if remaining <= 0 {
                io.set_status(DeviceStatus::Idle);
                io.release_watchdog();
            }
            return Ok(());
        }

        let mut words = payload.split_whitespace();
        match words.next() {
            Some("exptime") => {
                if let Some(v) = words.next().and_then(|w| w.parse::<f64>().ok()) {
                    io.update(&VarName::plain("exptime"), v);
                }
            }
            Some("expperiod") => {
                if let Some(v) = words.next().and_then(|w| w.parse::<f64>().ok()) {
                    io.update(&VarName::plain("expperiod"), v);
                }
            }
            Some("nimages") => {
                if let Some(v) = words.next().and_then(|w| w.parse::<i64>().ok()) {
                    io.update(&VarName::plain("nimages"), v);
                }
            }
            Some("threshold") => {
                // "threshold 4425 gain mid"
                if let Some(v) = words.next().and_then(|w| w.parse::<i64>().ok()) {
                    io.update(&VarName::plain("threshold"), v);
                }
                if words.next() == Some("gain") {
                    if let Some(gain) = words.next().and_then(Gain::parse) {
                        io.update(&VarName::plain("gain"), gain.as_str());
                    }
                }
                if io.status() == DeviceStatus::Busy(BusyKind::Trimming) {
                    io.set_status(DeviceStatus::Idle);
                }
            }
            Some("tvx") => {
                io.update(&VarName::plain("version"), payload);
            }
            Some("starting") => {}
            Some("stopped") => {
                io.update(&VarName::plain("imagesremaining"), 0i64);
                io.set_status(DeviceStatus::Idle);
                io.release_watchdog();
            }
            _ => {
                tracing::debug!(reply = %line, "unrecognized camserver reply");
            }
        }
        Ok(())
    }

    fn split_frames(&self, buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
        split_lines(buffer, b'\n')
    }

    fn on_variables_ready(&mut self, io: &mut BackendIo) -> Result<(), DeviceError> {
        io.set_status(DeviceStatus::Idle);
        io.set_auxstatus("");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_threshold_limits_match_the_calibration() {
        assert_eq!(Gain::Low.threshold_limits(), (6685, 20202));
        assert_eq!(Gain::Mid.threshold_limits(), (4425, 14328));
        assert_eq!(Gain::High.threshold_limits(), (3814, 11614));
    }

    #[test]
    fn gain_parses_wire_and_human_forms() {
        assert_eq!(Gain::parse("midg"), Some(Gain::Mid));
        assert_eq!(Gain::parse("HIGH"), Some(Gain::High));
        assert_eq!(Gain::parse("low"), Some(Gain::Low));
        assert_eq!(Gain::parse("ultra"), None);
    }

    #[test]
    fn line_splitter_keeps_partial_tails() {
        let mut buffer = b"15 OK exptime 1.0\n7 OK /ram/img_00001.cbf 1234\n15 O".to_vec();
        let frames = split_lines(&mut buffer, b'\n');
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"15 OK exptime 1.0".to_vec());
        assert_eq!(frames[1], b"7 OK /ram/img_00001.cbf 1234".to_vec());
        assert_eq!(buffer, b"15 O".to_vec());
    }
}
