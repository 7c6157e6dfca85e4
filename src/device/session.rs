//! Medication session workflow: start, unlock, then lock-and-record or cancel.
//!
//! Each transition runs with the store lock held by the caller, so a session is
//! never observed half-way through a transition.

use chrono::Utc;

use super::dispatcher::CommandDispatcher;
use super::models::{MedicationSession, SessionSummary};
use super::store::SharedState;
use super::{DeviceError, Result};
use crate::inventory::{self, MIN_WEIGHT_PER_PILL};
use crate::serial::DeviceCommand;

/// Begin a session for `name`: make it active, resync it and tare the scale.
pub async fn start(
    state: &mut SharedState,
    dispatcher: &CommandDispatcher,
    name: &str,
) -> Result<MedicationSession> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DeviceError::Validation(
            "A medication name is required to start a session".to_string(),
        ));
    }
    if let Some(active) = &state.session {
        return Err(DeviceError::State(format!(
            "A session for '{}' is already in progress, finish it first",
            active.medication
        )));
    }
    let record = *state
        .medications
        .get(name)
        .ok_or_else(|| DeviceError::UnknownMedication(name.to_string()))?;

    let previous_active = state.active_medication.replace(name.to_string());
    let tare = if state.mode.is_simulation() {
        DeviceCommand::TareSim
    } else {
        DeviceCommand::BoxTare
    };

    let synced = match dispatcher.resync(name, &record, state.mode).await {
        Ok(()) => dispatcher.send(&tare).await,
        Err(e) => Err(e),
    };
    if let Err(e) = synced {
        state.active_medication = previous_active;
        return Err(DeviceError::sync_failure("session start", e));
    }

    let session = MedicationSession::new(name);
    log::info!("Started medication session for '{}'", name);
    state.session = Some(session.clone());
    Ok(session)
}

pub async fn unlock(
    state: &mut SharedState,
    dispatcher: &CommandDispatcher,
) -> Result<MedicationSession> {
    let real_mode = !state.mode.is_simulation();
    let session = state.session.as_mut().ok_or_else(DeviceError::no_session)?;

    if real_mode {
        dispatcher
            .send(&DeviceCommand::UnlockCompartment)
            .await
            .map_err(|e| DeviceError::sync_failure("unlock compartment", e))?;
    }

    session.mark_unlocked();
    log::info!("Compartment unlocked for '{}'", session.medication);
    Ok(session.clone())
}

/// Close the compartment and charge whatever left the scale since the tare
/// to the ledger.
pub async fn lock_and_record(
    state: &mut SharedState,
    dispatcher: &CommandDispatcher,
) -> Result<SessionSummary> {
    let session = state.session.as_ref().ok_or_else(DeviceError::no_session)?;
    if !session.compartment_unlocked {
        return Err(DeviceError::State(
            "Compartment is not unlocked yet, unlock it first".to_string(),
        ));
    }
    // Until the device reports after the tare, the cached weight is the full box.
    if state.device.last_update <= session.start_time {
        return Err(DeviceError::State(
            "No post-tare reading from the scale yet, try again shortly".to_string(),
        ));
    }

    if !state.mode.is_simulation() {
        dispatcher
            .send(&DeviceCommand::LockCompartment)
            .await
            .map_err(|e| DeviceError::sync_failure("lock compartment", e))?;
    }

    let Some(session) = state.session.take() else {
        return Err(DeviceError::no_session());
    };
    let end_weight = state.device.total_weight_in_box;
    let weight_consumed = (end_weight - session.start_weight).abs();

    let mut pills_consumed = 0;
    if let Some(record) = state.medications.get_mut(&session.medication) {
        if record.weight_per_pill > MIN_WEIGHT_PER_PILL {
            pills_consumed = (weight_consumed / record.weight_per_pill).round() as u32;
        }
        if pills_consumed > 0 {
            inventory::deduct_pills(record, pills_consumed);
            if state.mode.is_simulation() {
                let push = DeviceCommand::SetWeight(record.total_weight_in_box);
                if let Err(e) = dispatcher.send(&push).await {
                    log::warn!("Could not push new weight after session: {}", e);
                }
            }
        }
    } else {
        log::warn!(
            "Medication '{}' disappeared during its session, nothing charged",
            session.medication
        );
    }

    let finished_at = Utc::now();
    let summary = SessionSummary {
        session_id: session.id,
        medication: session.medication,
        pills_consumed,
        weight_consumed,
        end_weight,
        duration_seconds: (finished_at - session.start_time).num_milliseconds() as f64 / 1000.0,
        started_at: session.start_time,
        finished_at,
    };
    log::info!(
        "Finished session for '{}': {} pills, {:.2}g removed, {:.1}s",
        summary.medication,
        summary.pills_consumed,
        summary.weight_consumed,
        summary.duration_seconds
    );
    Ok(summary)
}

/// Abandon the session. Relocking in real mode is best effort.
pub async fn cancel(
    state: &mut SharedState,
    dispatcher: &CommandDispatcher,
) -> Result<MedicationSession> {
    let session = state.session.take().ok_or_else(DeviceError::no_session)?;
    if session.compartment_unlocked && !state.mode.is_simulation() {
        if let Err(e) = dispatcher.send(&DeviceCommand::LockCompartment).await {
            log::warn!("Could not relock compartment on cancel: {}", e);
        }
    }
    log::info!("Cancelled session for '{}'", session.medication);
    Ok(session)
}

pub fn status(state: &SharedState) -> Option<MedicationSession> {
    state.session.clone()
}
