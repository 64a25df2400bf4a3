//! The command catalog.

pub mod basic;
pub mod beamstop;
pub mod detector;
pub mod device;
pub mod expose;
pub mod flags;
pub mod illumination;
pub mod motor;
pub mod pump;
pub mod sample;
pub mod scan;
pub mod temperature;
pub mod vacuum;
pub mod xray;

use beamctl_device::variable::VarValue;

use crate::script::expr::ScriptValue;

/// Convert a cached device value into a script value.
pub(crate) fn script_value_of(value: &VarValue) -> ScriptValue {
    match value {
        VarValue::None => ScriptValue::None,
        VarValue::Bool(b) => ScriptValue::Bool(*b),
        VarValue::Int(i) => ScriptValue::Int(*i),
        VarValue::Float(x) => ScriptValue::Float(*x),
        VarValue::Str(s) => ScriptValue::Str(s.clone()),
    }
}
