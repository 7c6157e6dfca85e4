//! Request-layer adapters.
//!
//! Each function wraps one [`DeviceManager`] operation and turns its outcome
//! into the `{status, message, ...}` reply a router serializes, along with the
//! HTTP status code it should answer with.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::device::{
    CalibrationRejection, DeviceError, DeviceManager, ErrorKind, OperatingMode, StatusSnapshot,
};

const DISCONNECTED_STAGE: &str = "Disconnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
    Info,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandReply {
    pub status: ReplyStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
    #[serde(skip)]
    pub http_status: u16,
}

impl CommandReply {
    pub fn success(message: impl Into<String>, data: Value) -> Self {
        Self::with_status(ReplyStatus::Success, message, data)
    }

    pub fn info(message: impl Into<String>, data: Value) -> Self {
        Self::with_status(ReplyStatus::Info, message, data)
    }

    fn with_status(status: ReplyStatus, message: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self {
            status,
            message: message.into(),
            kind: None,
            data,
            http_status: 200,
        }
    }

    pub fn error(error: &DeviceError) -> Self {
        let kind = error.kind();
        Self {
            status: ReplyStatus::Error,
            message: error.to_string(),
            kind: Some(kind),
            data: Map::new(),
            http_status: http_status(kind),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }
}

pub fn http_status(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::Validation | ErrorKind::State | ErrorKind::InsufficientInventory => 400,
        ErrorKind::ModeMismatch => 403,
        ErrorKind::UnknownMedication => 404,
        ErrorKind::LinkUnavailable | ErrorKind::DeviceSyncFailure => 500,
    }
}

fn reply<T>(result: Result<T, DeviceError>, ok: impl FnOnce(T) -> CommandReply) -> CommandReply {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            log::warn!("Request failed ({:?}): {}", e.kind(), e);
            CommandReply::error(&e)
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Status for display: stale telemetry is shown as a disconnected device.
pub fn display_status(mut snapshot: StatusSnapshot, stale_after: Duration) -> StatusSnapshot {
    if snapshot.staleness_seconds > stale_after.as_secs_f64() {
        snapshot.device.stage_name = DISCONNECTED_STAGE.to_string();
        snapshot.device.raw_last_line =
            "Connection to device potentially lost (stale data).".to_string();
    }
    snapshot
}

pub async fn get_status(manager: &DeviceManager) -> CommandReply {
    let snapshot = display_status(manager.status().await, manager.stale_display());
    CommandReply::success("Status", to_value(&snapshot))
}

pub async fn set_mode(manager: &DeviceManager, mode_name: &str) -> CommandReply {
    let Some(mode) = OperatingMode::from_str(mode_name) else {
        return CommandReply::error(&DeviceError::Validation(format!(
            "Invalid mode '{}'",
            mode_name
        )));
    };
    reply(manager.set_mode(mode).await, |change| {
        let mut message = format!("Switched to {} mode.", change.mode.as_str());
        if !change.synced {
            message.push_str(" Device will be updated when it reconnects.");
        }
        CommandReply::success(
            message,
            json!({ "is_simulation": change.mode.is_simulation(), "synced": change.synced }),
        )
    })
}

pub async fn set_stage(manager: &DeviceManager, stage_id: i64) -> CommandReply {
    reply(manager.set_stage(stage_id).await, |change| {
        CommandReply::success(
            format!("Stage change sent (stage id {}).", change.stage_id),
            to_value(&change),
        )
    })
}

pub async fn add_or_update_medication(
    manager: &DeviceManager,
    name: &str,
    weight_per_pill: f64,
) -> CommandReply {
    reply(manager.upsert_medication(name, weight_per_pill).await, |update| {
        let message = if update.created {
            format!(
                "Added new medication '{}' ({:.3}g per pill).",
                update.name, update.record.weight_per_pill
            )
        } else {
            format!(
                "Updated '{}' to {:.3}g per pill. Count recalculated.",
                update.name, update.record.weight_per_pill
            )
        };
        CommandReply::success(message, to_value(&update))
    })
}

pub async fn set_active_medication(manager: &DeviceManager, name: Option<&str>) -> CommandReply {
    reply(manager.set_active_medication(name).await, |change| {
        let message = match &change.active_medication {
            Some(name) if change.synced => format!("Active medication set to '{}'.", name),
            Some(name) => format!(
                "Active medication set to '{}'. Device will be updated when it reconnects.",
                name
            ),
            None => "Active medication cleared.".to_string(),
        };
        CommandReply::success(message, to_value(&change))
    })
}

pub async fn set_simulated_weight(manager: &DeviceManager, weight: f64) -> CommandReply {
    reply(manager.set_simulated_weight(weight).await, |change| {
        CommandReply::success(
            format!(
                "Simulated weight for '{}' set to {:.2}g. Count: {}.",
                change.medication, change.record.total_weight_in_box, change.record.count_in_box
            ),
            to_value(&change),
        )
    })
}

pub async fn tare_sim(manager: &DeviceManager) -> CommandReply {
    reply(manager.tare_sim().await, |()| {
        CommandReply::success("TARE_SIM sent; device weight zeroed.", Value::Null)
    })
}

pub async fn set_count(manager: &DeviceManager, count: i64) -> CommandReply {
    reply(manager.set_count(count).await, |change| {
        CommandReply::success(
            format!(
                "Count for '{}' set to {} ({:.2}g). Synced with device.",
                change.medication, change.record.count_in_box, change.record.total_weight_in_box
            ),
            to_value(&change),
        )
    })
}

pub async fn set_weight_per_pill(manager: &DeviceManager, weight_per_pill: f64) -> CommandReply {
    reply(manager.set_weight_per_pill(weight_per_pill).await, |change| {
        CommandReply::success(
            format!(
                "Weight per pill for '{}' set to {:.3}g. Count: {}.",
                change.medication, change.record.weight_per_pill, change.record.count_in_box
            ),
            to_value(&change),
        )
    })
}

pub async fn measure_single_pill(manager: &DeviceManager) -> CommandReply {
    reply(manager.measure_single_pill().await, |result| {
        let message = match &result.rejection {
            None => format!(
                "Measured {:.3}g per pill for '{}'.",
                result.weight_per_pill, result.medication
            ),
            Some(CalibrationRejection::InvalidMeasurement) => format!(
                "Device reported an invalid pill weight ({:.4}g); records for '{}' unchanged.",
                result.measured, result.medication
            ),
            Some(CalibrationRejection::OtherMedication { on_device }) => format!(
                "Device measured {:.3}g for '{}', not '{}'; records unchanged.",
                result.measured, on_device, result.medication
            ),
        };
        CommandReply::success(message, to_value(&result))
    })
}

pub async fn consume_pills(manager: &DeviceManager, count: i64) -> CommandReply {
    reply(manager.consume_by_count(count).await, |change| {
        let pills = change.consumption.map(|c| c.pills).unwrap_or_default();
        CommandReply::success(
            format!(
                "{} pills of '{}' consumed. Remaining {:.2}g, {} pills.",
                pills, change.medication, change.record.total_weight_in_box, change.record.count_in_box
            ),
            json!({
                "consumed_med": change.medication,
                "consumed_count": pills,
                "record": change.record,
            }),
        )
    })
}

pub async fn consume_by_weight(manager: &DeviceManager, weight: f64) -> CommandReply {
    reply(manager.consume_by_weight(weight).await, |change| {
        let Some(consumption) = change.consumption.filter(|c| !c.is_noop()) else {
            return CommandReply::info(
                format!(
                    "Weight reduction {:.2}g is less than half a pill. No pills consumed.",
                    weight
                ),
                json!({ "consumed_count": 0 }),
            );
        };
        CommandReply::success(
            format!(
                "Consumed about {} pills of '{}' by removing {:.2}g.",
                consumption.pills, change.medication, weight
            ),
            json!({
                "consumed_med": change.medication,
                "consumed_count": consumption.pills,
                "weight_reduced_approx": consumption.weight_removed,
                "record": change.record,
            }),
        )
    })
}

pub async fn start_session(manager: &DeviceManager, name: &str) -> CommandReply {
    reply(manager.start_session(name).await, |session| {
        CommandReply::success(
            format!("Started session for '{}'.", session.medication),
            json!({ "session_data": session }),
        )
    })
}

pub async fn unlock_compartment(manager: &DeviceManager) -> CommandReply {
    reply(manager.unlock_compartment().await, |session| {
        CommandReply::success(
            format!("Compartment for '{}' unlocked.", session.medication),
            json!({ "session_data": session }),
        )
    })
}

pub async fn lock_and_record(manager: &DeviceManager) -> CommandReply {
    reply(manager.lock_and_record().await, |summary| {
        CommandReply::success(
            format!(
                "Recorded {} pills of '{}'.",
                summary.pills_consumed, summary.medication
            ),
            json!({
                "completed_session": summary,
                "consumed_med": summary.medication,
                "consumed_count": summary.pills_consumed,
                "weight_reduced_approx": summary.weight_consumed,
            }),
        )
    })
}

pub async fn cancel_session(manager: &DeviceManager) -> CommandReply {
    reply(manager.cancel_session().await, |session| {
        CommandReply::success(
            format!("Cancelled session for '{}'.", session.medication),
            json!({ "cancelled_session": session }),
        )
    })
}

pub async fn session_status(manager: &DeviceManager) -> CommandReply {
    let session = manager.session_status().await;
    CommandReply::success(
        "Session status",
        json!({ "session_active": session.is_some(), "session_data": session }),
    )
}

pub async fn current_weight(manager: &DeviceManager) -> CommandReply {
    let reading = manager.current_weight().await;
    CommandReply::success(format!("{:.3}g", reading.weight), to_value(&reading))
}

pub async fn force_refresh_weight(manager: &DeviceManager, tare_first: bool) -> CommandReply {
    reply(manager.force_refresh_weight(tare_first).await, |reading| {
        CommandReply::success(
            format!("Current weight: {:.3}g", reading.weight),
            to_value(&reading),
        )
    })
}

pub fn listener_metrics(manager: &DeviceManager) -> CommandReply {
    CommandReply::success("Listener metrics", to_value(&manager.listener_metrics()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;
    use crate::inventory::InventoryError;
    use crate::serial::{LinkState, SerialError};
    use std::collections::HashMap;

    fn snapshot(staleness_seconds: f64) -> StatusSnapshot {
        StatusSnapshot {
            device: DeviceState::default(),
            medications: HashMap::new(),
            active_medication: None,
            is_simulation: true,
            session: None,
            link_state: LinkState::Connected,
            staleness_seconds,
        }
    }

    #[test]
    fn test_error_kinds_map_to_status_codes() {
        let cases = [
            (DeviceError::Validation("x".into()), 400),
            (DeviceError::no_session(), 400),
            (
                DeviceError::Inventory(InventoryError::Insufficient {
                    requested: 3,
                    available_weight: 0.2,
                }),
                400,
            ),
            (DeviceError::ModeMismatch("x".into()), 403),
            (DeviceError::UnknownMedication("x".into()), 404),
            (DeviceError::sync_failure("consume", SerialError::NotConnected), 500),
            (DeviceError::LinkUnavailable(SerialError::NotConnected), 500),
        ];
        for (error, code) in cases {
            assert_eq!(CommandReply::error(&error).http_status, code, "{}", error);
        }
    }

    #[test]
    fn test_reply_flattens_fields() {
        let reply = CommandReply::success("done", json!({ "consumed_count": 3 }));
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["message"], "done");
        assert_eq!(value["consumed_count"], 3);
        assert!(value.get("http_status").is_none());
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn test_error_reply_carries_kind() {
        let reply = CommandReply::error(&DeviceError::ModeMismatch("real only".into()));
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["kind"], "mode_mismatch");
    }

    #[test]
    fn test_stale_status_shown_disconnected() {
        let fresh = display_status(snapshot(5.0), Duration::from_secs(20));
        assert_eq!(fresh.device.stage_name, "Initializing");

        let stale = display_status(snapshot(25.0), Duration::from_secs(20));
        assert_eq!(stale.device.stage_name, DISCONNECTED_STAGE);
    }
}
