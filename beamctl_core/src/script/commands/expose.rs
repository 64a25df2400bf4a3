//! Exposure commands: `expose` and `exposemulti`.
//!
//! Both finish only once the detector has reported the end of the
//! exposure series AND every expected image has been received.

use crate::exposer::ExposureSignal;
use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;
use crate::signal::Signal;

#[derive(Debug)]
pub struct Expose {
    multi: bool,
    success: Option<bool>,
    failure: String,
    waiting_for_images: i64,
}

impl Expose {
    pub fn single() -> Self {
        Self {
            multi: false,
            success: None,
            failure: String::new(),
            waiting_for_images: 0,
        }
    }

    pub fn multi() -> Self {
        Self {
            multi: true,
            ..Self::single()
        }
    }

    fn try_finalize(&self) -> Outcome {
        match self.success {
            None => Outcome::Continue,
            Some(_) if self.waiting_for_images > 0 => Outcome::Continue,
            Some(true) => Outcome::Finished(ScriptValue::Bool(true)),
            Some(false) => Outcome::Failed(self.failure.clone()),
        }
    }
}

impl ScriptCommand for Expose {
    fn name(&self) -> &'static str {
        if self.multi { "exposemulti" } else { "expose" }
    }

    fn description(&self) -> &'static str {
        if self.multi {
            "Expose several images in one series"
        } else {
            "Make a single exposure with the detector"
        }
    }

    fn args(&self) -> Vec<ArgSpec> {
        let mut specs = vec![ArgSpec::required(
            "exptime",
            "exposure time in seconds",
            ArgKind::Float,
        )];
        if self.multi {
            specs.push(ArgSpec::required("nimages", "number of images", ArgKind::Int));
        }
        specs.push(ArgSpec::optional(
            "prefix",
            "exposure prefix",
            ArgKind::Str,
            ScriptValue::Str("crd".to_string()),
        ));
        specs.push(ArgSpec::optional(
            "delay",
            "delay between images in seconds",
            ArgKind::Float,
            ScriptValue::Float(0.003),
        ));
        specs
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let Some(exptime) = args.first().and_then(ScriptValue::as_f64) else {
            return Outcome::Failed("expose: exposure time required".to_string());
        };
        let (nimages, prefix_idx) = if self.multi {
            let Some(n) = args.get(1).and_then(ScriptValue::as_i64) else {
                return Outcome::Failed("exposemulti: image count required".to_string());
            };
            if n < 1 {
                return Outcome::Failed(format!("exposemulti: invalid image count {n}"));
            }
            (n as u64, 2)
        } else {
            (1, 1)
        };
        let prefix = args
            .get(prefix_idx)
            .and_then(ScriptValue::as_str)
            .unwrap_or("crd")
            .to_string();
        let delay = args
            .get(prefix_idx + 1)
            .and_then(ScriptValue::as_f64)
            .unwrap_or(0.003);
        self.success = None;
        self.waiting_for_images = nimages as i64;
        let fsn = match ctx.exposer.start(ctx.devices, &prefix, exptime, nimages, delay) {
            Ok(fsn) => fsn,
            Err(error) => return Outcome::Failed(error.to_string()),
        };
        let sample = ctx
            .samples
            .current()
            .map_or("no sample".to_string(), |s| format!("sample {}", s.title));
        if nimages > 1 {
            ctx.message(format!(
                "Started exposure {prefix}/{fsn}..{} ({sample})",
                fsn + nimages - 1
            ));
        } else {
            ctx.message(format!("Started exposure {prefix}/{fsn} ({sample})"));
        }
        Outcome::Continue
    }

    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        let Signal::Exposure(exposure) = signal else {
            return Outcome::Continue;
        };
        match exposure {
            ExposureSignal::Progress {
                prefix,
                fsn,
                elapsed,
                total,
            } => {
                let remaining = (total - elapsed).max(0.0);
                let scale = 1000u64;
                let current = if *total > 0.0 {
                    ((elapsed / total) * scale as f64) as u64
                } else {
                    0
                };
                ctx.progress(
                    format!("Exposing {prefix}/{fsn}, remaining time {remaining:.1} sec"),
                    current,
                    scale,
                );
                Outcome::Continue
            }
            ExposureSignal::ImageReceived { .. } => {
                self.waiting_for_images -= 1;
                self.try_finalize()
            }
            ExposureSignal::Finished { success, message } => {
                self.success = Some(*success);
                if !success {
                    self.failure = message.clone();
                    self.waiting_for_images = 0;
                }
                self.try_finalize()
            }
        }
    }

    fn stop(&mut self, ctx: &mut CommandCtx) -> Outcome {
        ctx.exposer.stop(ctx.devices);
        // The abort is confirmed through the exposure-finished signal.
        Outcome::Continue
    }
}
