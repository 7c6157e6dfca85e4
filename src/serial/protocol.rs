//! Pill dispenser line protocol.
//!
//! Outbound: `COMMAND[:ARG]\n`. Inbound: newline-terminated ASCII telemetry.
//! Decoding never fails; malformed numeric fields are reported per field so the
//! rest of the line still applies.

use std::fmt;

pub const DATA_PREFIX: &str = "DATA:";
pub const WEIGHT_PREFIX: &str = "WEIGHT:";
const CALIBRATION_MARKERS: [&str; 2] = ["measured single pill weight", "measure_single_pill_weight"];
const READY_MARKER: &str = "pillbox ready";
const MEASUREMENT_MARKERS: [&str; 3] = ["measurement sample", "start measuring", "measuring"];

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    SetMode { simulation: bool },
    SelectMedication(String),
    SetPillWeight(f64),
    /// Simulation mode only
    SetWeight(f64),
    TareSim,
    SetStage(i64),
    ResetAll,
    UnlockCompartment,
    LockCompartment,
    ConsumePills(u32),
    GetWeight,
    MeasureSinglePillWeight,
    BoxTare,
}

impl DeviceCommand {
    /// Encode as a protocol line, without the terminator
    pub fn encode(&self) -> String {
        match self {
            DeviceCommand::SetMode { simulation } => {
                format!("SET_MODE:{}", if *simulation { 1 } else { 0 })
            }
            DeviceCommand::SelectMedication(name) => format!("SELECT_MEDICATION:{}", name),
            DeviceCommand::SetPillWeight(wpp) => format!("SET_PILL_WEIGHT:{:.4}", wpp),
            DeviceCommand::SetWeight(weight) => format!("SET_WEIGHT:{:.2}", weight),
            DeviceCommand::TareSim => "TARE_SIM".to_string(),
            DeviceCommand::SetStage(stage) => format!("SET_STAGE:{}", stage),
            DeviceCommand::ResetAll => "RESET_ALL".to_string(),
            DeviceCommand::UnlockCompartment => "UNLOCK_COMPARTMENT:1".to_string(),
            DeviceCommand::LockCompartment => "LOCK_COMPARTMENT:1".to_string(),
            DeviceCommand::ConsumePills(count) => format!("CONSUME_PILLS:{}", count),
            DeviceCommand::GetWeight => "GET_WEIGHT".to_string(),
            DeviceCommand::MeasureSinglePillWeight => "MEASURE_SINGLE_PILL_WEIGHT".to_string(),
            DeviceCommand::BoxTare => "BOX_TARE".to_string(),
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// One `DATA:` line. `None` numeric fields failed to parse and must keep their previous value.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub stage: String,
    pub total_weight: Option<f64>,
    pub pill_count: Option<i64>,
    pub medication: String,
    pub wpp: Option<f64>,
    /// Present only on extended (7 field) lines
    pub lid_distance_cm: Option<f64>,
    pub lid_open: Option<bool>,
    pub extended: bool,
    /// Names of fields that were present but unparsable
    pub rejected_fields: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    Data(Telemetry),
    /// Reply to `GET_WEIGHT`
    Weight(f64),
    /// Fresh single-pill calibration; carries the value if the line states one
    Calibration { wpp: Option<f64> },
    Ready,
    Measurement(String),
    Malformed { line: String, reason: String },
    Chatter(String),
    Empty,
}

/// Classify one inbound line. Never fails.
pub fn decode_line(raw: &str) -> InboundLine {
    let line = raw.trim();
    if line.is_empty() {
        return InboundLine::Empty;
    }

    if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
        return decode_data(line, rest);
    }

    if let Some(rest) = line.strip_prefix(WEIGHT_PREFIX) {
        return match rest.trim().parse::<f64>() {
            Ok(weight) if weight.is_finite() => InboundLine::Weight(weight),
            _ => {
                log::warn!("Could not parse weight reply: {}", line);
                InboundLine::Malformed {
                    line: line.to_string(),
                    reason: "unparsable weight".to_string(),
                }
            }
        };
    }

    let lowered = line.to_lowercase();
    if CALIBRATION_MARKERS.iter().any(|m| lowered.contains(m)) {
        return InboundLine::Calibration {
            wpp: trailing_number(line),
        };
    }
    if lowered.contains(READY_MARKER) {
        return InboundLine::Ready;
    }
    if MEASUREMENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return InboundLine::Measurement(line.to_string());
    }

    InboundLine::Chatter(line.to_string())
}

fn decode_data(line: &str, rest: &str) -> InboundLine {
    let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
    if parts.len() != 5 && parts.len() != 7 {
        log::warn!("DATA line with {} fields ignored: {}", parts.len(), line);
        return InboundLine::Malformed {
            line: line.to_string(),
            reason: format!("expected 5 or 7 fields, got {}", parts.len()),
        };
    }

    let mut rejected = Vec::new();
    let total_weight = parse_float(parts[1], "weight", &mut rejected);
    let pill_count = parse_field::<i64>(parts[2], "pill_count", &mut rejected);
    let wpp = parse_float(parts[4], "wpp", &mut rejected);

    let extended = parts.len() == 7;
    let (lid_distance_cm, lid_open) = if extended {
        (
            parse_float(parts[5], "lid_distance", &mut rejected),
            parse_flag(parts[6], &mut rejected),
        )
    } else {
        (None, None)
    };

    InboundLine::Data(Telemetry {
        stage: parts[0].to_string(),
        total_weight,
        pill_count,
        medication: parts[3].to_string(),
        wpp,
        lid_distance_cm,
        lid_open,
        extended,
        rejected_fields: rejected,
    })
}

fn parse_field<T: std::str::FromStr>(
    value: &str,
    name: &'static str,
    rejected: &mut Vec<&'static str>,
) -> Option<T> {
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("Could not parse {} field: {:?}", name, value);
            rejected.push(name);
            None
        }
    }
}

fn parse_float(value: &str, name: &'static str, rejected: &mut Vec<&'static str>) -> Option<f64> {
    match parse_field::<f64>(value, name, rejected) {
        Some(v) if v.is_finite() => Some(v),
        Some(_) => {
            log::warn!("Non-finite {} field: {:?}", name, value);
            rejected.push(name);
            None
        }
        None => None,
    }
}

fn parse_flag(value: &str, rejected: &mut Vec<&'static str>) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "open" => Some(true),
        "0" | "false" | "closed" => Some(false),
        _ => {
            log::warn!("Could not parse lid_open field: {:?}", value);
            rejected.push("lid_open");
            None
        }
    }
}

/// Last numeric token on a line, e.g. `0.512` from "Measured single pill weight: 0.512g".
fn trailing_number(line: &str) -> Option<f64> {
    line.split(|c: char| c.is_whitespace() || c == ':' || c == '=' || c == ',')
        .rev()
        .filter(|token| !token.is_empty())
        .find_map(|token| {
            token
                .trim_end_matches('g')
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v > 0.0)
        })
}
