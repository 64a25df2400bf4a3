//! The `sample` command: select a sample and drive the stage to it.

use crate::samples::{MoveDirection, SampleSignal};
use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;
use crate::signal::Signal;

/// Look up a sample, move the stage to its position and make it the
/// current sample.
#[derive(Debug, Default)]
pub struct SampleCmd {
    title: String,
}

impl ScriptCommand for SampleCmd {
    fn name(&self) -> &'static str {
        "sample"
    }

    fn description(&self) -> &'static str {
        "Move the sample stage to a stored sample"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![
            ArgSpec::required("title", "title of the sample", ArgKind::Str),
            ArgSpec::optional(
                "direction",
                "which stage axes to drive",
                ArgKind::Choice(&["both", "x", "y"]),
                ScriptValue::Str("both".to_string()),
            ),
        ]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let Some(title) = args.first().and_then(ScriptValue::as_str) else {
            return Outcome::Failed("sample: title required".to_string());
        };
        let direction = args
            .get(1)
            .and_then(ScriptValue::as_str)
            .and_then(MoveDirection::parse)
            .unwrap_or(MoveDirection::Both);
        self.title = title.to_string();
        ctx.message(format!("Moving to sample {title}"));
        let result = ctx.samples.move_to_sample(
            ctx.devices,
            ctx.motors,
            ctx.accounting,
            ctx.config,
            title,
            direction,
        );
        match result {
            Ok(()) => Outcome::Continue,
            Err(error) => Outcome::Failed(error.to_string()),
        }
    }

    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        let Signal::Sample(sample) = signal else {
            return Outcome::Continue;
        };
        match sample {
            SampleSignal::MovingToSample {
                sample,
                motor,
                position,
                start,
                end,
            } if *sample == self.title => {
                let span = end - start;
                let (current, total) = if span.abs() > f64::EPSILON {
                    ((1000.0 * (position - start) / span) as u64, 1000)
                } else {
                    (0, 0)
                };
                ctx.progress(
                    format!("Moving to sample {sample}: {motor} at {position:.4}"),
                    current,
                    total,
                );
                Outcome::Continue
            }
            SampleSignal::MovingFinished { success, sample } if *sample == self.title => {
                if *success {
                    ctx.message(format!("Now at sample {sample}"));
                    Outcome::Finished(ScriptValue::Str(sample.clone()))
                } else {
                    Outcome::Failed(format!("cannot move to sample {sample}"))
                }
            }
            _ => Outcome::Continue,
        }
    }

    fn stop(&mut self, ctx: &mut CommandCtx) -> Outcome {
        ctx.samples.stop(ctx.devices, ctx.motors);
        Outcome::Failed("sample move stopped on user request".to_string())
    }
}
