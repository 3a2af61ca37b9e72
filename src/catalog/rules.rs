//! Value rules applied on top of the catalog schema.
//!
//! The schema only knows required/default/options. These rules look at the
//! parameter name to infer what a value means (a current, a gain, a CPR) and
//! flag values that cannot be right or are worth a second look.

use serde_json::Value;

use super::definition::CommandParameter;
use super::ParamMap;

/// Expected type, inferred from the parameter name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Number,
    Boolean,
    Text,
}

const NUMERIC_HINTS: &[&str] = &[
    "current", "voltage", "pos", "vel", "torque", "gain", "bandwidth", "frequency", "timeout", "rate", "limit",
    "cpr", "pairs",
];
const BOOLEAN_HINTS: &[&str] = &["enable", "use", "true", "false"];

/// Requested states accepted by the firmware's state machine
const REQUESTABLE_STATES: std::ops::RangeInclusive<i64> = 1..=8;
const GIMBAL_MOTOR_TYPE: f64 = 1.0;
const GIMBAL_CURRENT_LIMIT: f64 = 5.0;

pub fn infer_kind(name: &str) -> ParamKind {
    let name = name.to_ascii_lowercase();
    if NUMERIC_HINTS.iter().any(|hint| name.contains(hint)) {
        ParamKind::Number
    } else if BOOLEAN_HINTS.iter().any(|hint| name.contains(hint)) {
        ParamKind::Boolean
    } else {
        ParamKind::Text
    }
}

/// Numeric reading of a supplied value, plus whether reading it changed its
/// textual form (`"2.50"` reads as `2.5`, `true` as `1`).
fn read_number(value: &Value) -> Option<(f64, bool)> {
    match value {
        Value::Number(n) => n.as_f64().map(|n| (n, false)),
        Value::Bool(b) => Some((if *b { 1.0 } else { 0.0 }, true)),
        Value::String(s) => {
            let number = s.trim().parse::<f64>().ok().filter(|n| n.is_finite())?;
            Some((number, *s != format_number(number)))
        }
        _ => None,
    }
}

/// Whole numbers print without a fractional part
pub(crate) fn format_number(number: f64) -> String {
    if number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        number.to_string()
    }
}

/// Findings for one supplied parameter value
pub fn check_value(param: &CommandParameter, value: &Value, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    let name = param.name.as_str();
    let number = read_number(value);

    if infer_kind(name) == ParamKind::Number {
        match number {
            None => {
                errors.push(format!("Parameter '{}' must be a number", name));
                return;
            }
            Some((n, true)) => warnings.push(format!(
                "Parameter '{}' value {} was converted to the number {}",
                name,
                value,
                format_number(n)
            )),
            Some(_) => {}
        }
    }

    let Some((n, _)) = number else { return };
    check_range(name, n, errors, warnings);
    check_domain(name, n, errors, warnings);
}

fn check_range(name: &str, n: f64, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    let lower = name.to_ascii_lowercase();
    let has = |hint: &str| lower.contains(hint);

    if has("current") {
        if n < 0.0 {
            errors.push(format!("Parameter '{}': current cannot be negative", name));
        } else if n > 100.0 {
            warnings.push(format!("Current {}A is very high, confirm it is safe", format_number(n)));
        } else if n > 50.0 {
            warnings.push(format!("Current {}A is high, check the motor rating", format_number(n)));
        }
    }
    if has("voltage") {
        if n < 0.0 {
            errors.push(format!("Parameter '{}': voltage cannot be negative", name));
        } else if n > 60.0 {
            warnings.push(format!("Voltage {}V is high, check the supply rating", format_number(n)));
        }
    }
    if (has("vel") || has("speed")) && n.abs() > 1000.0 {
        warnings.push(format!("Velocity {} is high, check the mechanical limits", format_number(n)));
    }
    if has("pos") && n.abs() > 100.0 {
        warnings.push(format!("Position {} is large, check the travel limits", format_number(n)));
    }
    if has("bandwidth") || has("frequency") {
        if n <= 0.0 {
            errors.push(format!("Parameter '{}': frequency must be positive", name));
        } else if n > 10_000.0 {
            warnings.push(format!("Frequency {}Hz is high and may destabilise the loop", format_number(n)));
        }
    }
    if has("gain") {
        if n < 0.0 {
            errors.push(format!("Parameter '{}': gain cannot be negative", name));
        } else if n > 1000.0 {
            warnings.push(format!("Gain {} is large and may cause oscillation", format_number(n)));
        }
    }
    if has("timeout") {
        if n < 0.0 {
            errors.push(format!("Parameter '{}': timeout cannot be negative", name));
        } else if n > 300_000.0 {
            warnings.push(format!("Timeout {}ms is long", format_number(n)));
        }
    }
}

fn check_domain(name: &str, n: f64, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    match name {
        "axis" if n != 0.0 && n != 1.0 => errors.push("Axis must be 0 or 1".to_string()),
        "state" if n.fract() != 0.0 || !REQUESTABLE_STATES.contains(&(n as i64)) => errors.push(format!(
            "Invalid requested state {}, expected {}-{}",
            format_number(n),
            REQUESTABLE_STATES.start(),
            REQUESTABLE_STATES.end()
        )),
        "cpr" => {
            if n <= 0.0 {
                errors.push("CPR must be positive".to_string());
            } else if n < 100.0 {
                warnings.push(format!("CPR {} is low and limits resolution", format_number(n)));
            } else if n > 50_000.0 {
                warnings.push(format!("CPR {} is high and may cost performance", format_number(n)));
            }
        }
        "pairs" | "pole_pairs" => {
            if n <= 0.0 {
                errors.push("Pole pairs must be positive".to_string());
            } else if n > 50.0 {
                warnings.push(format!("{} pole pairs is unusual, check the motor data", format_number(n)));
            }
        }
        _ => {}
    }
}

/// Nonzero numeric value of `name`, if supplied
fn supplied(values: &ParamMap, name: &str) -> Option<f64> {
    values.get(name).and_then(read_number).map(|(n, _)| n).filter(|n| *n != 0.0)
}

/// Warnings about parameters that are fine alone but not together
pub fn check_combinations(values: &ParamMap, warnings: &mut Vec<String>) {
    if let (Some(vel), Some(accel)) = (supplied(values, "vel_limit"), supplied(values, "accel_limit")) {
        let ratio = vel.abs() / accel.abs();
        if ratio > 10.0 {
            warnings.push(format!(
                "Velocity to acceleration limit ratio is {:.1}:1, motion may not be smooth",
                ratio
            ));
        }
    }

    if let (Some(current), Some(motor_type)) = (supplied(values, "current_lim"), supplied(values, "motor_type")) {
        if motor_type == GIMBAL_MOTOR_TYPE && current > GIMBAL_CURRENT_LIMIT {
            warnings.push(format!(
                "Gimbal motors should stay at or below {}A, got {}A",
                format_number(GIMBAL_CURRENT_LIMIT),
                format_number(current)
            ));
        }
    }

    if let (Some(bandwidth), Some(cpr)) = (supplied(values, "bandwidth"), supplied(values, "cpr")) {
        if bandwidth > cpr / 4.0 {
            warnings.push(format!(
                "Encoder bandwidth {}Hz exceeds CPR/4 ({}Hz) and will pick up noise",
                format_number(bandwidth),
                (cpr / 4.0).floor()
            ));
        }
    }
}

/// Typical values for a parameter: its numeric default plus common choices
/// for its kind, sorted and without duplicates.
pub fn suggested_values(param: &CommandParameter) -> Vec<f64> {
    let mut values: Vec<f64> = param.default.as_ref().and_then(Value::as_f64).into_iter().collect();

    let name = param.name.to_ascii_lowercase();
    let common: &[f64] = if name.contains("current") {
        &[1.0, 5.0, 10.0, 20.0]
    } else if name.contains("voltage") {
        &[12.0, 24.0, 48.0]
    } else if name.contains("bandwidth") {
        &[100.0, 500.0, 1000.0, 2000.0]
    } else if name.contains("cpr") {
        &[1000.0, 2000.0, 4000.0, 8192.0]
    } else if name.contains("pairs") {
        &[7.0, 14.0, 21.0]
    } else {
        &[]
    };
    values.extend_from_slice(common);
    values.sort_by(|a, b| a.total_cmp(b));
    values.dedup();
    values
}
