//! Pill count ⇄ weight bookkeeping for a single medication.
//!
//! `count_in_box` is derived from `total_weight_in_box` and `weight_per_pill`;
//! every mutator here ends with [`recompute`] so the derived field never drifts.

use serde::{Deserialize, Serialize};

/// Weights per pill at or below this are treated as "not calibrated".
pub const MIN_WEIGHT_PER_PILL: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MedicationRecord {
    pub weight_per_pill: f64,
    pub total_weight_in_box: f64,
    pub count_in_box: u32,
}

impl MedicationRecord {
    pub fn new(weight_per_pill: f64) -> Self {
        let mut record = Self {
            weight_per_pill,
            total_weight_in_box: 0.0,
            count_in_box: 0,
        };
        recompute(&mut record);
        record
    }

    pub fn has_valid_weight_per_pill(&self) -> bool {
        self.weight_per_pill > MIN_WEIGHT_PER_PILL
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InventoryError {
    #[error("Weight per pill {0:.4}g is not valid (must be > 0.0001)")]
    InvalidWeightPerPill(f64),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Not enough inventory to consume {requested} pills ({available_weight:.2}g in box)")]
    Insufficient { requested: u32, available_weight: f64 },
}

pub type Result<T> = std::result::Result<T, InventoryError>;

/// Outcome of a consumption against the ledger
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Consumption {
    pub pills: u32,
    pub weight_removed: f64,
    pub previous_total: f64,
}

impl Consumption {
    pub fn is_noop(&self) -> bool {
        self.pills == 0
    }
}

/// Whole pills represented by `weight`; anything under half a pill counts as none.
pub fn pills_for_weight(weight: f64, weight_per_pill: f64) -> u32 {
    if weight_per_pill <= MIN_WEIGHT_PER_PILL || weight < weight_per_pill / 2.0 {
        return 0;
    }
    (weight / weight_per_pill).round() as u32
}

/// Re-establish `count_in_box` from weight and weight per pill. Idempotent.
pub fn recompute(record: &mut MedicationRecord) {
    record.count_in_box = pills_for_weight(record.total_weight_in_box, record.weight_per_pill);
    log::debug!(
        "Recalculated count: {} (total {:.2}g, wpp {:.3}g)",
        record.count_in_box,
        record.total_weight_in_box,
        record.weight_per_pill
    );
}

/// Remove `pills` from the ledger unconditionally, flooring the weight at zero.
pub fn deduct_pills(record: &mut MedicationRecord, pills: u32) -> Consumption {
    let previous_total = record.total_weight_in_box;
    let weight_removed = if record.has_valid_weight_per_pill() {
        f64::from(pills) * record.weight_per_pill
    } else {
        0.0
    };
    record.total_weight_in_box = (previous_total - weight_removed).max(0.0);
    recompute(record);
    Consumption {
        pills,
        weight_removed,
        previous_total,
    }
}

/// Consume `pills`, accepting up to half a pill of shortfall to absorb scale noise.
pub fn consume_by_count(record: &mut MedicationRecord, pills: u32) -> Result<Consumption> {
    if pills == 0 {
        return Err(InventoryError::InvalidQuantity(
            "number of pills must be positive".to_string(),
        ));
    }
    if !record.has_valid_weight_per_pill() {
        return Err(InventoryError::InvalidWeightPerPill(record.weight_per_pill));
    }

    let wpp = record.weight_per_pill;
    let needed = f64::from(pills) * wpp;
    if record.total_weight_in_box < needed - wpp / 2.0 {
        return Err(InventoryError::Insufficient {
            requested: pills,
            available_weight: record.total_weight_in_box,
        });
    }

    Ok(deduct_pills(record, pills))
}

/// Consume by removed weight. Less than half a pill is a successful no-op.
pub fn consume_by_weight(record: &mut MedicationRecord, weight: f64) -> Result<Consumption> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(InventoryError::InvalidQuantity(
            "weight to reduce must be positive".to_string(),
        ));
    }
    if !record.has_valid_weight_per_pill() {
        return Err(InventoryError::InvalidWeightPerPill(record.weight_per_pill));
    }

    let pills = pills_for_weight(weight, record.weight_per_pill);
    if pills == 0 {
        return Ok(Consumption {
            pills: 0,
            weight_removed: 0.0,
            previous_total: record.total_weight_in_box,
        });
    }
    consume_by_count(record, pills)
}

pub fn set_weight(record: &mut MedicationRecord, weight: f64) -> Result<()> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(InventoryError::InvalidQuantity(
            "weight cannot be negative".to_string(),
        ));
    }
    record.total_weight_in_box = weight;
    recompute(record);
    Ok(())
}

/// Set the inventory by count; the weight is back-computed from the weight per pill.
pub fn set_count(record: &mut MedicationRecord, count: u32) -> Result<()> {
    if !record.has_valid_weight_per_pill() {
        return Err(InventoryError::InvalidWeightPerPill(record.weight_per_pill));
    }
    record.total_weight_in_box = f64::from(count) * record.weight_per_pill;
    recompute(record);
    Ok(())
}

/// Zero is accepted: it marks a medication whose weight is yet to be measured.
pub fn set_weight_per_pill(record: &mut MedicationRecord, weight_per_pill: f64) -> Result<()> {
    if !weight_per_pill.is_finite() || weight_per_pill < 0.0 {
        return Err(InventoryError::InvalidWeightPerPill(weight_per_pill));
    }
    record.weight_per_pill = weight_per_pill;
    recompute(record);
    Ok(())
}
