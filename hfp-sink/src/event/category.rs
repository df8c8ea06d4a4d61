use std::fmt;

use tracing::warn;

use super::schema::{Column, BASE_COLUMNS, SIGNAL_PRIORITY_COLUMNS};

/// Journey type of revenue service. Everything else (deadrun, signoff, missing) is
/// treated as non-revenue.
pub const REVENUE_JOURNEY_TYPE: &str = "journey";

/// Classification of an HFP event. Drives the CSV schema and the file it lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    VehiclePosition,
    StopEvent,
    SignalPriority,
    Other,
    /// Position updates sent outside of revenue service (deadruns, signoff)
    Unsigned,
}

impl EventCategory {
    /// Maps an HFP event type code to its category. Returns `None` for codes we do
    /// not know about; callers drop those records.
    pub fn classify(journey_type: Option<&str>, event_type: &str) -> Option<EventCategory> {
        match event_type {
            "VP" => {
                if journey_type == Some(REVENUE_JOURNEY_TYPE) {
                    Some(EventCategory::VehiclePosition)
                } else {
                    Some(EventCategory::Unsigned)
                }
            }
            "DUE" | "ARR" | "ARS" | "PDE" | "DEP" | "PAS" | "WAIT" => {
                Some(EventCategory::StopEvent)
            }
            "TLR" | "TLA" => Some(EventCategory::SignalPriority),
            "DOO" | "DOC" | "DA" | "DOUT" | "BA" | "BOUT" | "VJA" | "VJOUT" => {
                Some(EventCategory::Other)
            }
            unknown => {
                warn!(event_type = unknown, "Received HFP event with unknown event type");
                None
            }
        }
    }

    /// Ordered column list used both for the file header and for every data row.
    pub fn columns(&self) -> &'static [Column] {
        match self {
            EventCategory::SignalPriority => SIGNAL_PRIORITY_COLUMNS,
            _ => BASE_COLUMNS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::VehiclePosition => "VehiclePosition",
            EventCategory::StopEvent => "StopEvent",
            EventCategory::SignalPriority => "SignalPriorityEvent",
            EventCategory::Other => "OtherEvent",
            EventCategory::Unsigned => "UnsignedEvent",
        }
    }

    /// Rough number of distinct records one time slot of this category holds, used to
    /// pre-size the per-file deduplicator.
    pub fn expected_records_per_file(&self) -> usize {
        match self {
            EventCategory::VehiclePosition => 250_000,
            _ => 1_000,
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
