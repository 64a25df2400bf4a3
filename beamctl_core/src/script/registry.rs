//! Name → command resolution for the script parser.

use crate::script::command::ScriptCommand;
use crate::script::commands::{
    basic, beamstop, detector, device, expose, flags, illumination, motor, pump, sample,
    scan, temperature, vacuum, xray,
};

/// Construct the command registered under `name`.
pub fn command_by_name(name: &str) -> Option<Box<dyn ScriptCommand>> {
    Some(match name {
        "sleep" => Box::new(basic::Sleep::default()),
        "comment" => Box::new(basic::Comment),
        "label" => Box::new(basic::Label),
        "end" => Box::new(basic::End),
        "goto" => Box::new(basic::Goto),
        "gosub" => Box::new(basic::Gosub),
        "return" => Box::new(basic::Return),
        "set" => Box::new(basic::SetVar),
        "moveto" => Box::new(motor::Move::absolute()),
        "moverel" => Box::new(motor::Move::relative()),
        "where" => Box::new(motor::Where),
        "expose" => Box::new(expose::Expose::single()),
        "exposemulti" => Box::new(expose::Expose::multi()),
        "shutter" => Box::new(xray::Shutter::default()),
        "xrays" => Box::new(xray::Xrays::default()),
        "xray_power" => Box::new(xray::XrayPower::default()),
        "xray_warmup" => Box::new(xray::WarmUp::default()),
        "beamstop" => Box::new(beamstop::Beamstop::default()),
        "sample" => Box::new(sample::SampleCmd::default()),
        "trim" => Box::new(detector::Trim::default()),
        "circulator" => Box::new(temperature::Circulator::default()),
        "settemp" => Box::new(temperature::SetTemp::default()),
        "temperature" => Box::new(temperature::Temperature),
        "wait_temp" => Box::new(temperature::WaitTemp::default()),
        "vacuum" => Box::new(vacuum::Vacuum),
        "wait_vacuum" => Box::new(vacuum::WaitVacuum::default()),
        "pp_start" => Box::new(pump::PumpCommand::start_pump()),
        "pp_stop" => Box::new(pump::PumpCommand::stop_pump()),
        "pp_dispense_wait" => Box::new(pump::PumpCommand::dispense_wait()),
        "pp_dispense_start" => Box::new(pump::PumpCommand::dispense_start()),
        "set_illumination_brightness" => {
            Box::new(illumination::SetIlluminationBrightness::default())
        }
        "newflag" => Box::new(flags::NewFlag),
        "setflag" => Box::new(flags::SetFlag),
        "clearflag" => Box::new(flags::ClearFlag),
        "getvar" => Box::new(device::GetVar),
        "listvars" => Box::new(device::ListVars),
        "devcommand" => Box::new(device::DevCommand::default()),
        "scan" => Box::new(scan::ScanCmd::absolute()),
        "scanrel" => Box::new(scan::ScanCmd::relative()),
        _ => return None,
    })
}

/// Every registered command name.
pub fn command_names() -> Vec<&'static str> {
    vec![
        "sleep",
        "comment",
        "label",
        "end",
        "goto",
        "gosub",
        "return",
        "set",
        "moveto",
        "moverel",
        "where",
        "expose",
        "exposemulti",
        "shutter",
        "xrays",
        "xray_power",
        "xray_warmup",
        "beamstop",
        "sample",
        "trim",
        "circulator",
        "settemp",
        "temperature",
        "wait_temp",
        "vacuum",
        "wait_vacuum",
        "pp_start",
        "pp_stop",
        "pp_dispense_wait",
        "pp_dispense_start",
        "set_illumination_brightness",
        "newflag",
        "setflag",
        "clearflag",
        "getvar",
        "listvars",
        "devcommand",
        "scan",
        "scanrel",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_name_resolves_and_agrees() {
        for name in command_names() {
            let command = command_by_name(name)
                .unwrap_or_else(|| panic!("{name} is listed but does not resolve"));
            assert_eq!(command.name(), name);
        }
        assert!(command_by_name("frobnicate").is_none());
    }
}
