use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::inventory::{Consumption, MedicationRecord};
use crate::serial::{LinkState, Telemetry};

/// Stage id the firmware treats as a full reset
pub const RESET_STAGE: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Simulation,
    Real,
}

impl OperatingMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "simulation" | "sim" => Some(OperatingMode::Simulation),
            "real" => Some(OperatingMode::Real),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Simulation => "simulation",
            OperatingMode::Real => "real",
        }
    }

    pub fn is_simulation(&self) -> bool {
        matches!(self, OperatingMode::Simulation)
    }
}

/// Last known device telemetry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub stage_name: String,
    pub total_weight_in_box: f64,
    pub pill_count_on_device: i64,
    pub current_medication_on_device: String,
    pub weight_per_pill: f64,
    pub lid_distance_cm: Option<f64>,
    pub lid_open: bool,
    /// Never moves backwards
    pub last_update: DateTime<Utc>,
    pub raw_last_line: String,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            stage_name: "Initializing".to_string(),
            total_weight_in_box: 0.0,
            pill_count_on_device: 0,
            current_medication_on_device: "N/A".to_string(),
            weight_per_pill: 0.25,
            lid_distance_cm: None,
            lid_open: false,
            last_update: Utc::now(),
            raw_last_line: String::new(),
        }
    }
}

impl DeviceState {
    /// Record that `line` arrived at `now`.
    pub fn touch(&mut self, line: &str, now: DateTime<Utc>) {
        if now > self.last_update {
            self.last_update = now;
        }
        self.raw_last_line = line.to_string();
    }

    /// Fields that failed to parse keep their previous value.
    pub fn apply_telemetry(&mut self, telemetry: &Telemetry) {
        self.stage_name = telemetry.stage.clone();
        self.current_medication_on_device = telemetry.medication.clone();
        if let Some(weight) = telemetry.total_weight {
            self.total_weight_in_box = weight;
        }
        if let Some(count) = telemetry.pill_count {
            self.pill_count_on_device = count;
        }
        if let Some(wpp) = telemetry.wpp {
            self.weight_per_pill = wpp;
        }
        if let Some(distance) = telemetry.lid_distance_cm {
            self.lid_distance_cm = Some(distance);
        }
        if let Some(open) = telemetry.lid_open {
            self.lid_open = open;
        }
    }

    pub fn staleness(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_update).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Started,
    Unlocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicationSession {
    pub id: Uuid,
    pub medication: String,
    pub phase: SessionPhase,
    pub compartment_unlocked: bool,
    pub start_time: DateTime<Utc>,
    /// Scale reading the session measures against; the device is tared at
    /// start so this is zero.
    pub start_weight: f64,
}

impl MedicationSession {
    pub fn new(medication: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            medication: medication.to_string(),
            phase: SessionPhase::Started,
            compartment_unlocked: false,
            start_time: Utc::now(),
            start_weight: 0.0,
        }
    }

    pub fn mark_unlocked(&mut self) {
        self.compartment_unlocked = true;
        self.phase = SessionPhase::Unlocked;
    }
}

/// Result of `lock_and_record`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub medication: String,
    pub pills_consumed: u32,
    pub weight_consumed: f64,
    pub end_weight: f64,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn record(&self) -> ConsumptionRecord {
        ConsumptionRecord {
            medication: self.medication.clone(),
            pills_consumed: self.pills_consumed,
            weight_consumed: self.weight_consumed,
            duration_seconds: self.duration_seconds,
            timestamp: self.finished_at,
        }
    }
}

/// Immutable history entry handed to persistence collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub medication: String,
    pub pills_consumed: u32,
    pub weight_consumed: f64,
    pub duration_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub device: DeviceState,
    pub medications: HashMap<String, MedicationRecord>,
    pub active_medication: Option<String>,
    pub is_simulation: bool,
    pub session: Option<MedicationSession>,
    pub link_state: LinkState,
    pub staleness_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeChange {
    pub mode: OperatingMode,
    /// False when the device could not be told; it is replayed on reconnect
    pub synced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveChange {
    pub active_medication: Option<String>,
    pub synced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageChange {
    pub stage_id: i64,
    pub reset: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MedicationUpdate {
    pub name: String,
    pub record: MedicationRecord,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryChange {
    pub medication: String,
    pub record: MedicationRecord,
    pub consumption: Option<Consumption>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeightReading {
    pub weight: f64,
    /// Query attempt that produced the reading; `None` for cached values
    pub attempt: Option<u32>,
    pub last_update: DateTime<Utc>,
    pub age_seconds: f64,
}

/// Why a single-pill measurement was not taken into the ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CalibrationRejection {
    /// At or below the smallest usable weight per pill
    InvalidMeasurement,
    OtherMedication { on_device: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationResult {
    pub medication: String,
    /// Ledger value after the measurement
    pub weight_per_pill: f64,
    pub measured: f64,
    pub adopted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<CalibrationRejection>,
}
