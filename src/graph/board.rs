//! FPGA board description files and pin constraint generation.
//!
//! A `BoardInfo` file (referenced by a target's `boards:` list) describes
//! a physical board: its device triplet, and a map of named pins to
//! physical location/IO-standard/drive info. `generate_constraints`
//! renders either a UCF (Xilinx ISE) or PCF (Yosys) file depending on the
//! requested path's extension, as spec'd in §4.3 "Board constraint
//! generation".

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct PinEntry {
    pub location: String,
    pub iostandard: String,
    pub slew: Option<String>,
    pub drive: Option<String>,
    /// Present if this pin is a board clock; the constraint period in ns.
    pub clock_period_ns: Option<f64>,
    pub clock_duty_percent: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoardInfo {
    pub device_triplet: String,
    /// Speed grade, injected into derived nodes as `hardware/speed/<N>`.
    pub speed: Option<i64>,
    /// Package name, injected as `hardware/package/<pkg>`.
    pub package: Option<String>,
    pub pins: HashMap<String, PinEntry>,
}

#[derive(Debug, Clone)]
pub enum ConstraintFormat {
    Ucf,
    Pcf,
}

impl ConstraintFormat {
    pub fn from_path(path: &str) -> Option<ConstraintFormat> {
        if path.ends_with(".ucf") {
            Some(ConstraintFormat::Ucf)
        } else if path.ends_with(".pcf") {
            Some(ConstraintFormat::Pcf)
        } else {
            None
        }
    }
}

/// Renders constraint text for `pins: {name: width}` against a board's
/// pin table. Unknown pin names are reported as errors rather than
/// silently skipped, matching the "bad board pin reference" schema error
/// in spec.md §7.
pub fn generate_constraints(
    board: &BoardInfo,
    requested_pins: &HashMap<String, u32>,
    format: &ConstraintFormat,
) -> Result<String, String> {
    let mut out = String::new();
    for (name, width) in requested_pins {
        for bit in 0..*width {
            let pin_name = if *width == 1 { name.clone() } else { format!("{}[{}]", name, bit) };
            let entry = board
                .pins
                .get(&pin_name)
                .or_else(|| board.pins.get(name))
                .ok_or_else(|| format!("no pin named {:?} on this board", pin_name))?;

            match format {
                ConstraintFormat::Ucf => {
                    out.push_str(&format!(
                        "NET \"{}\" LOC = \"{}\" | IOSTANDARD = {};\n",
                        pin_name, entry.location, entry.iostandard
                    ));
                    if let Some(slew) = &entry.slew {
                        out.push_str(&format!("NET \"{}\" SLEW = {};\n", pin_name, slew));
                    }
                    if let Some(drive) = &entry.drive {
                        out.push_str(&format!("NET \"{}\" DRIVE = {};\n", pin_name, drive));
                    }
                    if let Some(period) = entry.clock_period_ns {
                        let duty = entry.clock_duty_percent.unwrap_or(50.0);
                        out.push_str(&format!(
                            "NET \"{}\" TNM_NET = \"{}\";\nTIMESPEC TS_{} = PERIOD \"{}\" {} ns HIGH {}%;\n",
                            pin_name, pin_name, pin_name, pin_name, period, duty
                        ));
                    }
                }
                ConstraintFormat::Pcf => {
                    out.push_str(&format!("set_io {} {}\n", pin_name, entry.location));
                    if let Some(period) = entry.clock_period_ns {
                        out.push_str(&format!("# clock {} period {} ns\n", pin_name, period));
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_board() -> BoardInfo {
        let mut pins = HashMap::new();
        pins.insert(
            "clk".to_owned(),
            PinEntry {
                location: "P12".into(),
                iostandard: "LVCMOS33".into(),
                slew: None,
                drive: None,
                clock_period_ns: Some(10.0),
                clock_duty_percent: Some(50.0),
            },
        );
        BoardInfo { device_triplet: "zynq7-xc7z010".into(), speed: Some(1), package: Some("fbg484".into()), pins }
    }

    #[test]
    fn renders_ucf_with_clock_constraint() {
        let board = sample_board();
        let mut req = HashMap::new();
        req.insert("clk".to_owned(), 1u32);
        let text = generate_constraints(&board, &req, &ConstraintFormat::Ucf).unwrap();
        assert!(text.contains("LOC = \"P12\""));
        assert!(text.contains("PERIOD"));
    }

    #[test]
    fn unknown_pin_is_an_error() {
        let board = sample_board();
        let mut req = HashMap::new();
        req.insert("nonexistent".to_owned(), 1u32);
        assert!(generate_constraints(&board, &req, &ConstraintFormat::Pcf).is_err());
    }

    #[test]
    fn format_selected_by_extension() {
        assert!(matches!(ConstraintFormat::from_path("top.ucf"), Some(ConstraintFormat::Ucf)));
        assert!(matches!(ConstraintFormat::from_path("top.pcf"), Some(ConstraintFormat::Pcf)));
        assert!(ConstraintFormat::from_path("top.txt").is_none());
    }
}
