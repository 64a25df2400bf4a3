//! Scan commands: `scan` and `scanrel`, both driving the scan
//! orchestrator.

use crate::orchestrator::scan::{ScanParams, ScanRequest, ScanSignal};
use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;
use crate::signal::Signal;

/// Run an N-point scan: move, expose, step.
#[derive(Debug)]
pub struct ScanCmd {
    relative: bool,
}

impl ScanCmd {
    pub fn absolute() -> Self {
        Self { relative: false }
    }

    pub fn relative() -> Self {
        Self { relative: true }
    }
}

impl ScriptCommand for ScanCmd {
    fn name(&self) -> &'static str {
        if self.relative { "scanrel" } else { "scan" }
    }

    fn description(&self) -> &'static str {
        if self.relative {
            "Scan a motor symmetrically around its current position"
        } else {
            "Scan a motor over an absolute interval"
        }
    }

    fn args(&self) -> Vec<ArgSpec> {
        if self.relative {
            vec![
                ArgSpec::required("motor", "name of the motor", ArgKind::Str),
                ArgSpec::required("halfwidth", "half width of the interval", ArgKind::Float),
                ArgSpec::required("npoints", "number of points", ArgKind::Int),
                ArgSpec::required("exptime", "exposure time per point", ArgKind::Float),
                ArgSpec::required("comment", "description of the scan", ArgKind::Str),
            ]
        } else {
            vec![
                ArgSpec::required("motor", "name of the motor", ArgKind::Str),
                ArgSpec::required("start", "starting position (inclusive)", ArgKind::Float),
                ArgSpec::required("end", "end position (inclusive)", ArgKind::Float),
                ArgSpec::required("npoints", "number of points", ArgKind::Int),
                ArgSpec::required("exptime", "exposure time per point", ArgKind::Float),
                ArgSpec::required("comment", "description of the scan", ArgKind::Str),
            ]
        }
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let motor = match args.first().and_then(ScriptValue::as_str) {
            Some(motor) => motor.to_string(),
            None => return Outcome::Failed("scan: motor name required".to_string()),
        };
        let params = if self.relative {
            let (Some(halfwidth), Some(npoints), Some(exptime), Some(comment)) = (
                args.get(1).and_then(ScriptValue::as_f64),
                args.get(2).and_then(ScriptValue::as_i64),
                args.get(3).and_then(ScriptValue::as_f64),
                args.get(4).and_then(ScriptValue::as_str),
            ) else {
                return Outcome::Failed("scanrel: invalid arguments".to_string());
            };
            ScanParams {
                motor,
                start: -halfwidth,
                end: halfwidth,
                steps: npoints.max(0) as u32,
                exptime,
                comment: comment.to_string(),
                relative: true,
            }
        } else {
            let (Some(start), Some(end), Some(npoints), Some(exptime), Some(comment)) = (
                args.get(1).and_then(ScriptValue::as_f64),
                args.get(2).and_then(ScriptValue::as_f64),
                args.get(3).and_then(ScriptValue::as_i64),
                args.get(4).and_then(ScriptValue::as_f64),
                args.get(5).and_then(ScriptValue::as_str),
            ) else {
                return Outcome::Failed("scan: invalid arguments".to_string());
            };
            ScanParams {
                motor,
                start,
                end,
                steps: npoints.max(0) as u32,
                exptime,
                comment: comment.to_string(),
                relative: false,
            }
        };
        if params.steps < 2 {
            return Outcome::Failed(format!(
                "{}: at least two points are needed",
                self.name()
            ));
        }
        ctx.message(format!(
            "Starting {} scan with motor {} from {} to {} ({} steps, {:.3} s each)",
            if params.relative { "relative" } else { "absolute" },
            params.motor,
            params.start,
            params.end,
            params.steps,
            params.exptime,
        ));
        *ctx.scan_request = Some(ScanRequest::Start(params));
        Outcome::Continue
    }

    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        let Signal::Scan(scan) = signal else {
            return Outcome::Continue;
        };
        match scan {
            ScanSignal::Started { index, steps } => {
                ctx.message(format!("Started scan #{index} with {steps} steps"));
                Outcome::Continue
            }
            ScanSignal::Progress {
                start,
                end,
                current,
                message,
            } => {
                if (end - start).abs() > f64::EPSILON {
                    ctx.progress(
                        message.clone(),
                        (1000.0 * (current - start) / (end - start)) as u64,
                        1000,
                    );
                } else {
                    ctx.progress(message.clone(), 0, 0);
                }
                Outcome::Continue
            }
            ScanSignal::Finished {
                success,
                index,
                message,
            } => {
                if *success {
                    ctx.message(format!("Scan #{index} finished: {message}"));
                    Outcome::Finished(ScriptValue::Int(*index as i64))
                } else {
                    Outcome::Failed(message.clone())
                }
            }
        }
    }

    fn stop(&mut self, ctx: &mut CommandCtx) -> Outcome {
        *ctx.scan_request = Some(ScanRequest::Stop);
        // The orchestrator confirms through a scan-finished signal.
        Outcome::Continue
    }
}
