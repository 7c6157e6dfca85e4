use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::dispatcher::CommandDispatcher;
use super::models::*;
use super::session;
use super::store::{DeviceStore, SharedState};
use super::{DeviceError, Result};
use crate::config::Settings;
use crate::inventory::{self, MIN_WEIGHT_PER_PILL};
use crate::serial::protocol::decode_line;
use crate::serial::unified::{LinkObserver, ListenerBuilder, ListenerHandle, ListenerMetrics};
use crate::serial::{
    DeviceCommand, InboundLine, LinkManager, LinkState, PortOpener, ReconnectPolicy, SerialError,
};

/// A refreshed scale reading is only charged to records calibrated above this
const REFRESH_MIN_WEIGHT_PER_PILL: f64 = 1e-3;

/// Feeds listener output into the store and replays host state on connect.
struct EngineObserver {
    store: DeviceStore,
    dispatcher: CommandDispatcher,
}

#[async_trait]
impl LinkObserver for EngineObserver {
    async fn on_line(&self, raw: &str, decoded: &InboundLine) {
        self.store.apply_line(raw, decoded).await;
    }

    async fn since_last_update(&self) -> Duration {
        self.store.since_last_update().await
    }

    async fn on_connected(&self) -> bool {
        let state = self.store.lock().await;
        let mode = state.mode;
        let set_mode = DeviceCommand::SetMode {
            simulation: mode.is_simulation(),
        };
        if let Err(e) = self.dispatcher.send(&set_mode).await {
            log::error!("Could not restore {} mode after connect: {}", mode.as_str(), e);
            return false;
        }
        if let Some((name, record)) = state.active_record() {
            self.dispatcher.pause(self.dispatcher.command_gap()).await;
            if let Err(e) = self.dispatcher.resync(name, record, mode).await {
                log::error!("Could not resync '{}' after connect: {}", name, e);
                return false;
            }
        }
        true
    }
}

/// Central entry point: owns the store, the dispatcher and the listener task,
/// and exposes every operation the request layer calls.
pub struct DeviceManager {
    store: DeviceStore,
    dispatcher: CommandDispatcher,
    listener: ListenerHandle,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    consumption_tx: broadcast::Sender<ConsumptionRecord>,
    settings: Settings,
}

impl DeviceManager {
    /// Build the engine and spawn the listener. Must run inside a tokio runtime.
    pub fn start(settings: Settings, opener: Arc<dyn PortOpener>) -> Self {
        let mode = if settings.start_in_simulation {
            OperatingMode::Simulation
        } else {
            OperatingMode::Real
        };
        let store = DeviceStore::new(mode);
        let link = Arc::new(LinkManager::new(
            settings.port_name.clone(),
            settings.baud_rate,
            settings.settle(),
            opener,
        ));
        let dispatcher = CommandDispatcher::new(link.clone(), settings.command_gap());
        let observer = Arc::new(EngineObserver {
            store: store.clone(),
            dispatcher: dispatcher.clone(),
        });

        let (listener, task) = ListenerBuilder::new(link, observer)
            .policy(ReconnectPolicy::new(
                settings.stale_reconnect(),
                settings.reconnect_interval(),
            ))
            .read_timeout_ms(settings.read_timeout_ms)
            .reconnect_penalty(settings.reconnect_penalty())
            .spawn();
        let (consumption_tx, _) = broadcast::channel(64);

        log::info!(
            "Device manager started on {} in {} mode",
            settings.port_name,
            mode.as_str()
        );

        Self {
            store,
            dispatcher,
            listener,
            listener_task: Mutex::new(Some(task)),
            consumption_tx,
            settings,
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.dispatcher.link().state()
    }

    /// Staleness after which the request layer shows the device as disconnected
    pub fn stale_display(&self) -> Duration {
        self.settings.stale_display()
    }

    pub async fn status(&self) -> StatusSnapshot {
        let state = self.store.lock().await;
        StatusSnapshot {
            device: state.device.clone(),
            medications: state.medications.clone(),
            active_medication: state.active_medication.clone(),
            is_simulation: state.mode.is_simulation(),
            session: state.session.clone(),
            link_state: self.link_state(),
            staleness_seconds: state.device.staleness(Utc::now()).as_secs_f64(),
        }
    }

    /// Switch mode. The device is told immediately if possible; otherwise the
    /// next connect replays it.
    pub async fn set_mode(&self, mode: OperatingMode) -> Result<ModeChange> {
        let mut state = self.store.lock().await;
        state.mode = mode;

        let set_mode = DeviceCommand::SetMode {
            simulation: mode.is_simulation(),
        };
        let mut synced = self.dispatcher.send(&set_mode).await.is_ok();
        if let Some((name, record)) = state.active_record() {
            synced &= self.dispatcher.resync(name, record, mode).await.is_ok();
        }
        if !synced {
            log::warn!("Mode set to {} locally; device will be told on reconnect", mode.as_str());
        }
        log::info!("Switched to {} mode", mode.as_str());
        Ok(ModeChange { mode, synced })
    }

    pub async fn set_stage(&self, stage_id: i64) -> Result<StageChange> {
        let mut state = self.store.lock().await;
        self.dispatcher
            .send(&DeviceCommand::SetStage(stage_id))
            .await
            .map_err(|e| DeviceError::sync_failure("stage change", e))?;

        let reset = stage_id == RESET_STAGE;
        if reset {
            self.dispatcher
                .send(&DeviceCommand::ResetAll)
                .await
                .map_err(|e| DeviceError::sync_failure("full reset", e))?;
            state.reset_all();
            log::info!("System fully reset: medications and session cleared");
        }
        Ok(StageChange { stage_id, reset })
    }

    /// Register a medication or change a known one's weight per pill.
    pub async fn upsert_medication(&self, name: &str, weight_per_pill: f64) -> Result<MedicationUpdate> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DeviceError::Validation(
                "Medication name cannot be empty".to_string(),
            ));
        }
        if !weight_per_pill.is_finite() || weight_per_pill < 0.0 {
            return Err(DeviceError::Validation(
                "Weight per pill cannot be negative".to_string(),
            ));
        }

        let mut state = self.store.lock().await;
        let is_active = state.active_medication.as_deref() == Some(name);
        if !state.medications.contains_key(name) {
            let record = MedicationRecord::new(weight_per_pill);
            state.medications.insert(name.to_string(), record);
            if weight_per_pill == 0.0 {
                log::info!("'{}' added without a weight per pill; measure or set it later", name);
            } else {
                log::info!("Added medication '{}' ({:.3}g per pill)", name, weight_per_pill);
            }
            return Ok(MedicationUpdate {
                name: name.to_string(),
                record,
                created: true,
            });
        }

        let record = state
            .medications
            .get_mut(name)
            .ok_or_else(|| DeviceError::UnknownMedication(name.to_string()))?;
        let before = *record;
        inventory::set_weight_per_pill(record, weight_per_pill)?;
        if is_active {
            if let Err(e) = self
                .dispatcher
                .send(&DeviceCommand::SetPillWeight(weight_per_pill))
                .await
            {
                *record = before;
                return Err(DeviceError::sync_failure("weight per pill update", e));
            }
        }
        log::info!(
            "Updated '{}' to {:.3}g per pill, count now {}",
            name,
            weight_per_pill,
            record.count_in_box
        );
        Ok(MedicationUpdate {
            name: name.to_string(),
            record: *record,
            created: false,
        })
    }

    /// Select (or with `None`, clear) the active medication.
    pub async fn set_active_medication(&self, name: Option<&str>) -> Result<ActiveChange> {
        let mut state = self.store.lock().await;
        let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
            state.active_medication = None;
            log::info!("Active medication cleared");
            return Ok(ActiveChange {
                active_medication: None,
                synced: true,
            });
        };

        let record = *state
            .medications
            .get(name)
            .ok_or_else(|| DeviceError::UnknownMedication(name.to_string()))?;
        state.active_medication = Some(name.to_string());

        let synced = match self.dispatcher.resync(name, &record, state.mode).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Active medication set to '{}' but not synced: {}", name, e);
                false
            }
        };
        log::info!("Active medication set to '{}'", name);
        Ok(ActiveChange {
            active_medication: Some(name.to_string()),
            synced,
        })
    }

    pub async fn set_simulated_weight(&self, weight: f64) -> Result<InventoryChange> {
        let mut state = self.store.lock().await;
        require_mode(&state, OperatingMode::Simulation, "Setting the simulated weight")?;
        let (name, record) = active_entry(&mut state)?;

        let before = *record;
        inventory::set_weight(record, weight)?;
        if let Err(e) = self.dispatcher.send(&DeviceCommand::SetWeight(weight)).await {
            *record = before;
            return Err(DeviceError::sync_failure("simulated weight", e));
        }
        log::info!(
            "Simulated weight for '{}' set to {:.2}g, count {}",
            name,
            weight,
            record.count_in_box
        );
        Ok(InventoryChange {
            medication: name,
            record: *record,
            consumption: None,
        })
    }

    pub async fn tare_sim(&self) -> Result<()> {
        let state = self.store.lock().await;
        if !state.mode.is_simulation() {
            log::warn!("TARE_SIM requested in real mode, sending anyway");
        }
        self.dispatcher
            .send(&DeviceCommand::TareSim)
            .await
            .map_err(|e| DeviceError::sync_failure("tare", e))
    }

    /// Set the active medication's inventory from a manual pill count.
    pub async fn set_count(&self, count: i64) -> Result<InventoryChange> {
        if count < 0 {
            return Err(DeviceError::Validation(
                "Pill count cannot be negative".to_string(),
            ));
        }
        let count = u32::try_from(count)
            .map_err(|_| DeviceError::Validation(format!("Pill count {} is too large", count)))?;

        let mut state = self.store.lock().await;
        let mode = state.mode;
        let (name, record) = active_entry(&mut state)?;

        let before = *record;
        inventory::set_count(record, count)?;
        if let Err(e) = self.dispatcher.resync(&name, record, mode).await {
            *record = before;
            return Err(DeviceError::sync_failure("manual count", e));
        }
        log::info!(
            "Count for '{}' set to {} ({:.2}g)",
            name,
            count,
            record.total_weight_in_box
        );
        Ok(InventoryChange {
            medication: name,
            record: *record,
            consumption: None,
        })
    }

    pub async fn set_weight_per_pill(&self, weight_per_pill: f64) -> Result<InventoryChange> {
        if !weight_per_pill.is_finite() || weight_per_pill <= MIN_WEIGHT_PER_PILL {
            return Err(DeviceError::Validation(format!(
                "Weight per pill must be greater than {}",
                MIN_WEIGHT_PER_PILL
            )));
        }

        let mut state = self.store.lock().await;
        let (name, record) = active_entry(&mut state)?;

        let before = *record;
        inventory::set_weight_per_pill(record, weight_per_pill)?;
        if let Err(e) = self
            .dispatcher
            .send(&DeviceCommand::SetPillWeight(weight_per_pill))
            .await
        {
            *record = before;
            return Err(DeviceError::sync_failure("weight per pill", e));
        }
        log::info!(
            "Weight per pill for '{}' set to {:.3}g, count {}",
            name,
            weight_per_pill,
            record.count_in_box
        );
        Ok(InventoryChange {
            medication: name,
            record: *record,
            consumption: None,
        })
    }

    /// Ask the device to weigh a single pill of the active medication. The
    /// listener adopts the result into the ledger as the reply arrives.
    pub async fn measure_single_pill(&self) -> Result<CalibrationResult> {
        let medication = {
            let state = self.store.lock().await;
            require_mode(&state, OperatingMode::Real, "Single pill measurement")?;
            state
                .active_medication
                .clone()
                .ok_or_else(DeviceError::no_active_medication)?
        };

        let (response, _) = self
            .dispatcher
            .poll(
                &self.listener,
                DeviceCommand::MeasureSinglePillWeight,
                self.settings.query_timeout(),
                self.settings.query_attempts,
                self.settings.query_retry_gap(),
                |response| Some(response.clone()),
            )
            .await?;

        let state = self.store.lock().await;
        let measured = response
            .lines
            .iter()
            .find_map(|line| match decode_line(line) {
                InboundLine::Calibration { wpp } => wpp,
                _ => None,
            })
            .unwrap_or(state.device.weight_per_pill);
        let record = state
            .medications
            .get(&medication)
            .ok_or_else(|| DeviceError::UnknownMedication(medication.clone()))?;
        let adopted = (record.weight_per_pill - measured).abs() <= MIN_WEIGHT_PER_PILL;
        let rejection = if adopted {
            None
        } else if measured <= MIN_WEIGHT_PER_PILL {
            log::warn!("Device reported an unusable pill weight of {:.4}g", measured);
            Some(CalibrationRejection::InvalidMeasurement)
        } else {
            let on_device = state.device.current_medication_on_device.clone();
            log::warn!(
                "Device measured {:.3}g for '{}', which is not '{}'",
                measured,
                on_device,
                medication
            );
            Some(CalibrationRejection::OtherMedication { on_device })
        };
        Ok(CalibrationResult {
            medication,
            weight_per_pill: record.weight_per_pill,
            measured,
            adopted,
            rejection,
        })
    }

    pub async fn consume_by_count(&self, pills: i64) -> Result<InventoryChange> {
        if pills <= 0 {
            return Err(DeviceError::Validation(
                "Number of pills must be positive".to_string(),
            ));
        }
        let pills = u32::try_from(pills)
            .map_err(|_| DeviceError::Validation(format!("{} pills is too many", pills)))?;

        let mut state = self.store.lock().await;
        let mode = state.mode;
        let (name, record) = active_entry(&mut state)?;

        let before = *record;
        let consumption = inventory::consume_by_count(record, pills)?;
        if let Err(e) = self.push_consumption(&name, record, mode, pills).await {
            *record = before;
            return Err(DeviceError::sync_failure("pill consumption", e));
        }
        log::info!(
            "{} pills of '{}' consumed, {:.2}g and {} pills left",
            pills,
            name,
            record.total_weight_in_box,
            record.count_in_box
        );
        Ok(InventoryChange {
            medication: name,
            record: *record,
            consumption: Some(consumption),
        })
    }

    /// Simulation only. Less than half a pill is reported as a no-op consumption.
    pub async fn consume_by_weight(&self, weight: f64) -> Result<InventoryChange> {
        let mut state = self.store.lock().await;
        require_mode(&state, OperatingMode::Simulation, "Consume by weight")?;
        let mode = state.mode;
        let (name, record) = active_entry(&mut state)?;

        let before = *record;
        let consumption = inventory::consume_by_weight(record, weight)?;
        if !consumption.is_noop() {
            if let Err(e) = self
                .push_consumption(&name, record, mode, consumption.pills)
                .await
            {
                *record = before;
                return Err(DeviceError::sync_failure("pill consumption", e));
            }
            log::info!(
                "Consumed about {} pills of '{}' by removing {:.2}g",
                consumption.pills,
                name,
                weight
            );
        }
        Ok(InventoryChange {
            medication: name,
            record: *record,
            consumption: Some(consumption),
        })
    }

    async fn push_consumption(
        &self,
        name: &str,
        record: &MedicationRecord,
        mode: OperatingMode,
        pills: u32,
    ) -> std::result::Result<(), SerialError> {
        self.dispatcher.resync(name, record, mode).await?;
        self.dispatcher.pause(self.settings.consume_gap()).await;
        self.dispatcher.send(&DeviceCommand::ConsumePills(pills)).await
    }

    /// Read the scale now instead of waiting for telemetry. In simulation mode
    /// the cached weight is the truth.
    pub async fn force_refresh_weight(&self, tare_first: bool) -> Result<WeightReading> {
        let mode = self.store.lock().await.mode;
        if mode.is_simulation() {
            return Ok(self.current_weight().await);
        }

        if !self.dispatcher.link().is_open() {
            log::warn!("Link is closed, reconnecting before weight refresh");
            if !self.listener.reconnect().await {
                return Err(DeviceError::LinkUnavailable(SerialError::NotConnected));
            }
        }

        if tare_first {
            self.dispatcher.send(&DeviceCommand::TareSim).await?;
            self.dispatcher.pause(self.settings.tare_settle()).await;
        }

        let (weight, attempt) = self
            .dispatcher
            .poll(
                &self.listener,
                DeviceCommand::GetWeight,
                self.settings.query_timeout(),
                self.settings.query_attempts,
                self.settings.query_retry_gap(),
                |response| response.weight().filter(|w| *w >= 0.0),
            )
            .await?;

        let mut state = self.store.lock().await;
        state.device.total_weight_in_box = weight;
        if let Some((name, record)) = state.active_record_mut() {
            if record.weight_per_pill > REFRESH_MIN_WEIGHT_PER_PILL {
                inventory::set_weight(record, weight)?;
                log::info!(
                    "Updated '{}' from scale: {} pills ({:.3}g)",
                    name,
                    record.count_in_box,
                    weight
                );
            }
        }
        let now = Utc::now();
        Ok(WeightReading {
            weight,
            attempt: Some(attempt),
            last_update: state.device.last_update,
            age_seconds: state.device.staleness(now).as_secs_f64(),
        })
    }

    /// Cached scale weight, without touching the link.
    pub async fn current_weight(&self) -> WeightReading {
        let state = self.store.lock().await;
        WeightReading {
            weight: state.device.total_weight_in_box,
            attempt: None,
            last_update: state.device.last_update,
            age_seconds: state.device.staleness(Utc::now()).as_secs_f64(),
        }
    }

    pub async fn start_session(&self, name: &str) -> Result<MedicationSession> {
        let mut state = self.store.lock().await;
        session::start(&mut state, &self.dispatcher, name).await
    }

    pub async fn unlock_compartment(&self) -> Result<MedicationSession> {
        let mut state = self.store.lock().await;
        session::unlock(&mut state, &self.dispatcher).await
    }

    /// Finish the session and publish its consumption record.
    pub async fn lock_and_record(&self) -> Result<SessionSummary> {
        let summary = {
            let mut state = self.store.lock().await;
            session::lock_and_record(&mut state, &self.dispatcher).await?
        };
        if self.consumption_tx.send(summary.record()).is_err() {
            log::debug!("No consumption subscribers for session {}", summary.session_id);
        }
        Ok(summary)
    }

    pub async fn cancel_session(&self) -> Result<MedicationSession> {
        let mut state = self.store.lock().await;
        session::cancel(&mut state, &self.dispatcher).await
    }

    pub async fn session_status(&self) -> Option<MedicationSession> {
        let state = self.store.lock().await;
        session::status(&state)
    }

    /// One record per completed session, for history and notification collaborators.
    pub fn subscribe_consumption(&self) -> broadcast::Receiver<ConsumptionRecord> {
        self.consumption_tx.subscribe()
    }

    pub fn listener_metrics(&self) -> ListenerMetrics {
        self.listener.metrics()
    }

    /// Stop the listener and close the link.
    pub async fn shutdown(&self) {
        self.listener.shutdown().await;
        if let Some(task) = self.listener_task.lock().await.take() {
            if let Err(e) = task.await {
                log::error!("Listener task ended abnormally: {}", e);
            }
        }
    }
}

fn require_mode(state: &SharedState, wanted: OperatingMode, operation: &str) -> Result<()> {
    if state.mode != wanted {
        return Err(DeviceError::ModeMismatch(format!(
            "{} is only allowed in {} mode",
            operation,
            wanted.as_str()
        )));
    }
    Ok(())
}

fn active_entry(state: &mut SharedState) -> Result<(String, &mut MedicationRecord)> {
    state
        .active_record_mut()
        .ok_or_else(DeviceError::no_active_medication)
}
