use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

use super::models::{DeviceState, MedicationRecord, MedicationSession, OperatingMode};
use crate::inventory::{self, MIN_WEIGHT_PER_PILL};
use crate::serial::InboundLine;

/// Everything the engine shares between the listener and request handlers.
#[derive(Debug)]
pub struct SharedState {
    pub device: DeviceState,
    pub medications: HashMap<String, MedicationRecord>,
    pub active_medication: Option<String>,
    pub session: Option<MedicationSession>,
    pub mode: OperatingMode,
}

impl SharedState {
    pub fn new(mode: OperatingMode) -> Self {
        Self {
            device: DeviceState::default(),
            medications: HashMap::new(),
            active_medication: None,
            session: None,
            mode,
        }
    }

    pub fn active_record(&self) -> Option<(&str, &MedicationRecord)> {
        let name = self.active_medication.as_deref()?;
        self.medications.get(name).map(|record| (name, record))
    }

    pub fn active_record_mut(&mut self) -> Option<(String, &mut MedicationRecord)> {
        let name = self.active_medication.clone()?;
        self.medications.get_mut(&name).map(|record| (name, record))
    }

    /// Stage reset: forget every medication, the active pointer and the session.
    pub fn reset_all(&mut self) {
        self.medications.clear();
        self.active_medication = None;
        self.session = None;
    }

    /// Apply one inbound line. Every non-empty line counts as liveness.
    pub fn apply_inbound(&mut self, raw: &str, decoded: &InboundLine, now: DateTime<Utc>) {
        if matches!(decoded, InboundLine::Empty) {
            return;
        }
        self.device.touch(raw.trim(), now);

        match decoded {
            InboundLine::Data(telemetry) => {
                self.device.apply_telemetry(telemetry);
            }
            InboundLine::Weight(weight) => {
                self.device.total_weight_in_box = *weight;
                log::debug!("Received weight reply: {:.2}g", weight);
            }
            InboundLine::Calibration { wpp } => {
                let measured = wpp.unwrap_or(self.device.weight_per_pill);
                self.adopt_calibration(measured);
            }
            _ => {}
        }
    }

    /// Take a device-side calibration into the ledger when it concerns the
    /// active medication and actually differs.
    fn adopt_calibration(&mut self, measured: f64) {
        if measured <= MIN_WEIGHT_PER_PILL {
            return;
        }
        let on_device = self.device.current_medication_on_device.clone();
        let Some((name, record)) = self.active_record_mut() else {
            return;
        };
        if name != on_device || (record.weight_per_pill - measured).abs() <= MIN_WEIGHT_PER_PILL {
            return;
        }
        log::info!(
            "Device reported new weight per pill for '{}': {:.3}g, updating records",
            name,
            measured
        );
        if let Err(e) = inventory::set_weight_per_pill(record, measured) {
            log::warn!("Ignoring calibration for '{}': {}", name, e);
        }
    }
}

/// Cloneable handle to the single lock guarding [`SharedState`].
#[derive(Clone)]
pub struct DeviceStore {
    inner: Arc<Mutex<SharedState>>,
}

impl DeviceStore {
    pub fn new(mode: OperatingMode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SharedState::new(mode))),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.inner.lock().await
    }

    pub async fn apply_line(&self, raw: &str, decoded: &InboundLine) {
        self.inner.lock().await.apply_inbound(raw, decoded, Utc::now());
    }

    pub async fn since_last_update(&self) -> Duration {
        self.inner.lock().await.device.staleness(Utc::now())
    }
}
