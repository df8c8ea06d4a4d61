//! Explicit CSV schemas.
//!
//! Every category owns a fixed column list sorted by column name (byte order). The same
//! list produces the header and drives per-row serialization, so a header and the rows
//! below it always line up.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, SecondsFormat, Timelike, Utc};

use super::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Acc,
    Desi,
    Dir,
    DirectionId,
    Dl,
    DrType,
    Drst,
    EventType,
    GeohashLevel,
    Hdg,
    Headsign,
    IsOngoing,
    JourneyStartTime,
    JourneyType,
    Jrn,
    Latitude,
    Line,
    LocationQualityMethod,
    Longitude,
    Mode,
    NextStopId,
    Occu,
    Oday,
    Odo,
    Oper,
    OwnerOperatorId,
    ReceivedAt,
    Route,
    RouteId,
    Seq,
    Sid,
    SignalGroupId,
    Spd,
    Start,
    Stop,
    TlpAttSeq,
    TlpDecision,
    TlpFrequency,
    TlpLineConfigId,
    TlpPointConfigId,
    TlpPriorityLevel,
    TlpProtocol,
    TlpReason,
    TlpRequestId,
    TlpRequestType,
    TlpSignalGroupNbr,
    TopicLatitude,
    TopicLongitude,
    TopicPrefix,
    TopicVersion,
    Tsi,
    Tst,
    UniqueVehicleId,
    Uuid,
    Veh,
    VehicleNumber,
}

pub const BASE_COLUMNS: &[Column] = &[
    Column::Acc,
    Column::Desi,
    Column::Dir,
    Column::DirectionId,
    Column::Dl,
    Column::DrType,
    Column::Drst,
    Column::EventType,
    Column::GeohashLevel,
    Column::Hdg,
    Column::Headsign,
    Column::IsOngoing,
    Column::JourneyStartTime,
    Column::JourneyType,
    Column::Jrn,
    Column::Latitude,
    Column::Line,
    Column::LocationQualityMethod,
    Column::Longitude,
    Column::Mode,
    Column::NextStopId,
    Column::Occu,
    Column::Oday,
    Column::Odo,
    Column::Oper,
    Column::OwnerOperatorId,
    Column::ReceivedAt,
    Column::Route,
    Column::RouteId,
    Column::Seq,
    Column::Spd,
    Column::Start,
    Column::Stop,
    Column::TopicLatitude,
    Column::TopicLongitude,
    Column::TopicPrefix,
    Column::TopicVersion,
    Column::Tsi,
    Column::Tst,
    Column::UniqueVehicleId,
    Column::Uuid,
    Column::Veh,
    Column::VehicleNumber,
];

pub const SIGNAL_PRIORITY_COLUMNS: &[Column] = &[
    Column::Acc,
    Column::Desi,
    Column::Dir,
    Column::DirectionId,
    Column::Dl,
    Column::DrType,
    Column::Drst,
    Column::EventType,
    Column::GeohashLevel,
    Column::Hdg,
    Column::Headsign,
    Column::IsOngoing,
    Column::JourneyStartTime,
    Column::JourneyType,
    Column::Jrn,
    Column::Latitude,
    Column::Line,
    Column::LocationQualityMethod,
    Column::Longitude,
    Column::Mode,
    Column::NextStopId,
    Column::Occu,
    Column::Oday,
    Column::Odo,
    Column::Oper,
    Column::OwnerOperatorId,
    Column::ReceivedAt,
    Column::Route,
    Column::RouteId,
    Column::Seq,
    Column::Sid,
    Column::SignalGroupId,
    Column::Spd,
    Column::Start,
    Column::Stop,
    Column::TlpAttSeq,
    Column::TlpDecision,
    Column::TlpFrequency,
    Column::TlpLineConfigId,
    Column::TlpPointConfigId,
    Column::TlpPriorityLevel,
    Column::TlpProtocol,
    Column::TlpReason,
    Column::TlpRequestId,
    Column::TlpRequestType,
    Column::TlpSignalGroupNbr,
    Column::TopicLatitude,
    Column::TopicLongitude,
    Column::TopicPrefix,
    Column::TopicVersion,
    Column::Tsi,
    Column::Tst,
    Column::UniqueVehicleId,
    Column::Uuid,
    Column::Veh,
    Column::VehicleNumber,
];

impl Column {
    pub fn name(&self) -> &'static str {
        match self {
            Column::Acc => "acc",
            Column::Desi => "desi",
            Column::Dir => "dir",
            Column::DirectionId => "directionId",
            Column::Dl => "dl",
            Column::DrType => "drType",
            Column::Drst => "drst",
            Column::EventType => "eventType",
            Column::GeohashLevel => "geohashLevel",
            Column::Hdg => "hdg",
            Column::Headsign => "headsign",
            Column::IsOngoing => "isOngoing",
            Column::JourneyStartTime => "journeyStartTime",
            Column::JourneyType => "journeyType",
            Column::Jrn => "jrn",
            Column::Latitude => "latitude",
            Column::Line => "line",
            Column::LocationQualityMethod => "locationQualityMethod",
            Column::Longitude => "longitude",
            Column::Mode => "mode",
            Column::NextStopId => "nextStopId",
            Column::Occu => "occu",
            Column::Oday => "oday",
            Column::Odo => "odo",
            Column::Oper => "oper",
            Column::OwnerOperatorId => "ownerOperatorId",
            Column::ReceivedAt => "receivedAt",
            Column::Route => "route",
            Column::RouteId => "routeId",
            Column::Seq => "seq",
            Column::Sid => "sid",
            Column::SignalGroupId => "signalGroupId",
            Column::Spd => "spd",
            Column::Start => "start",
            Column::Stop => "stop",
            Column::TlpAttSeq => "tlpAttSeq",
            Column::TlpDecision => "tlpDecision",
            Column::TlpFrequency => "tlpFrequency",
            Column::TlpLineConfigId => "tlpLineConfigId",
            Column::TlpPointConfigId => "tlpPointConfigId",
            Column::TlpPriorityLevel => "tlpPriorityLevel",
            Column::TlpProtocol => "tlpProtocol",
            Column::TlpReason => "tlpReason",
            Column::TlpRequestId => "tlpRequestId",
            Column::TlpRequestType => "tlpRequestType",
            Column::TlpSignalGroupNbr => "tlpSignalGroupNbr",
            Column::TopicLatitude => "topicLatitude",
            Column::TopicLongitude => "topicLongitude",
            Column::TopicPrefix => "topicPrefix",
            Column::TopicVersion => "topicVersion",
            Column::Tsi => "tsi",
            Column::Tst => "tst",
            Column::UniqueVehicleId => "uniqueVehicleId",
            Column::Uuid => "uuid",
            Column::Veh => "veh",
            Column::VehicleNumber => "vehicleNumber",
        }
    }

    /// Renders this column of `record`. Missing values render as an empty string.
    pub fn render(&self, record: &Record) -> String {
        let tlp = record.signal_priority.as_ref();
        match self {
            Column::Acc => opt_f64(record.acc),
            Column::Desi => opt_str(&record.desi),
            Column::Dir => opt_display(record.dir),
            Column::DirectionId => opt_display(record.direction_id),
            Column::Dl => opt_display(record.dl),
            Column::DrType => opt_display(record.dr_type),
            Column::Drst => opt_display(record.drst),
            Column::EventType => opt_str(&record.event_type),
            Column::GeohashLevel => opt_display(record.geohash_level),
            Column::Hdg => opt_display(record.hdg),
            Column::Headsign => opt_str(&record.headsign),
            Column::IsOngoing => opt_display(record.is_ongoing),
            Column::JourneyStartTime => record.journey_start_time.map(format_time).unwrap_or_default(),
            Column::JourneyType => opt_str(&record.journey_type),
            Column::Jrn => opt_display(record.jrn),
            Column::Latitude => opt_f64(record.latitude),
            Column::Line => opt_display(record.line),
            Column::LocationQualityMethod => opt_str(&record.location_quality_method),
            Column::Longitude => opt_f64(record.longitude),
            Column::Mode => opt_str(&record.mode),
            Column::NextStopId => opt_str(&record.next_stop_id),
            Column::Occu => opt_display(record.occu),
            Column::Oday => record.oday.map(format_date).unwrap_or_default(),
            Column::Odo => opt_f64(record.odo),
            Column::Oper => opt_display(record.oper),
            Column::OwnerOperatorId => opt_display(record.owner_operator_id),
            Column::ReceivedAt => record.received_at.map(format_instant).unwrap_or_default(),
            Column::Route => opt_str(&record.route),
            Column::RouteId => opt_str(&record.route_id),
            Column::Seq => opt_display(record.seq),
            Column::Sid => opt_display(tlp.and_then(|t| t.sid)),
            Column::SignalGroupId => opt_display(tlp.and_then(|t| t.signal_group_id)),
            Column::Spd => opt_f64(record.spd),
            Column::Start => record.start.map(format_time).unwrap_or_default(),
            Column::Stop => opt_display(record.stop),
            Column::TlpAttSeq => opt_display(tlp.and_then(|t| t.tlp_att_seq)),
            Column::TlpDecision => opt_str(&tlp.and_then(|t| t.tlp_decision.clone())),
            Column::TlpFrequency => opt_display(tlp.and_then(|t| t.tlp_frequency)),
            Column::TlpLineConfigId => opt_display(tlp.and_then(|t| t.tlp_line_config_id)),
            Column::TlpPointConfigId => opt_display(tlp.and_then(|t| t.tlp_point_config_id)),
            Column::TlpPriorityLevel => opt_str(&tlp.and_then(|t| t.tlp_priority_level.clone())),
            Column::TlpProtocol => opt_str(&tlp.and_then(|t| t.tlp_protocol.clone())),
            Column::TlpReason => opt_str(&tlp.and_then(|t| t.tlp_reason.clone())),
            Column::TlpRequestId => opt_display(tlp.and_then(|t| t.tlp_request_id)),
            Column::TlpRequestType => opt_str(&tlp.and_then(|t| t.tlp_request_type.clone())),
            Column::TlpSignalGroupNbr => opt_display(tlp.and_then(|t| t.tlp_signal_group_nbr)),
            Column::TopicLatitude => opt_f64(record.topic_latitude),
            Column::TopicLongitude => opt_f64(record.topic_longitude),
            Column::TopicPrefix => opt_str(&record.topic_prefix),
            Column::TopicVersion => opt_str(&record.topic_version),
            Column::Tsi => opt_display(record.tsi),
            Column::Tst => format_offset_datetime(&record.tst),
            Column::UniqueVehicleId => opt_str(&record.unique_vehicle_id),
            Column::Uuid => record.uuid.to_string(),
            Column::Veh => opt_display(record.veh),
            Column::VehicleNumber => opt_display(record.vehicle_number),
        }
    }
}

/// Header names for an ordered column list.
pub fn header(columns: &[Column]) -> Vec<&'static str> {
    columns.iter().map(Column::name).collect()
}

/// Serializes `record` in the column order of its own category.
pub fn render_row(record: &Record) -> Vec<String> {
    record
        .category
        .columns()
        .iter()
        .map(|column| column.render(record))
        .collect()
}

fn opt_str(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn opt_display<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

// Whole numbers keep one decimal ("24.0") so numeric columns stay visibly floating point.
fn opt_f64(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() && v.fract() == 0.0 => format!("{v:.1}"),
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

/// `HH:MM`, or `HH:MM:SS` when seconds are set.
pub fn format_time(time: NaiveTime) -> String {
    if time.second() == 0 && time.nanosecond() == 0 {
        time.format("%H:%M").to_string()
    } else {
        time.format("%H:%M:%S").to_string()
    }
}

/// ISO-8601 local date.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// ISO-8601 instant in UTC (`Z` suffix).
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn format_offset_datetime(value: &DateTime<FixedOffset>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventCategory, SignalPriority};
    use crate::test_utils::position_record;

    fn assert_sorted(columns: &[Column]) {
        let names = header(columns);
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        assert_sorted(BASE_COLUMNS);
        assert_sorted(SIGNAL_PRIORITY_COLUMNS);
    }

    #[test]
    fn schemas_have_unique_columns() {
        for columns in [BASE_COLUMNS, SIGNAL_PRIORITY_COLUMNS] {
            let mut names = header(columns);
            names.dedup();
            assert_eq!(names.len(), columns.len());
        }
        assert_eq!(BASE_COLUMNS.len(), 43);
        assert_eq!(SIGNAL_PRIORITY_COLUMNS.len(), 56);
    }

    #[test]
    fn signal_priority_schema_extends_base() {
        for column in BASE_COLUMNS {
            assert!(SIGNAL_PRIORITY_COLUMNS.contains(column));
        }
    }

    #[test]
    fn row_matches_header_length() {
        let record = position_record(1);
        assert_eq!(render_row(&record).len(), BASE_COLUMNS.len());

        let tlp = Record {
            category: EventCategory::SignalPriority,
            event_type: Some("TLR".to_string()),
            signal_priority: Some(SignalPriority {
                tlp_request_id: Some(7),
                tlp_decision: Some("ACK".to_string()),
                ..Default::default()
            }),
            ..position_record(1)
        };
        let row = render_row(&tlp);
        assert_eq!(row.len(), SIGNAL_PRIORITY_COLUMNS.len());

        let idx = SIGNAL_PRIORITY_COLUMNS
            .iter()
            .position(|c| *c == Column::TlpRequestId)
            .unwrap();
        assert_eq!(row[idx], "7");
    }

    #[test]
    fn missing_values_render_empty() {
        let record = position_record(1);
        assert_eq!(Column::Sid.render(&record), "");
        assert_eq!(Column::Headsign.render(&Record { headsign: None, ..record }), "");
    }

    #[test]
    fn formats_values() {
        assert_eq!(opt_f64(Some(24.0)), "24.0");
        assert_eq!(opt_f64(Some(60.12345)), "60.12345");
        assert_eq!(format_time(NaiveTime::from_hms_opt(8, 0, 0).unwrap()), "08:00");
        assert_eq!(format_time(NaiveTime::from_hms_opt(8, 0, 5).unwrap()), "08:00:05");
        assert_eq!(
            format_date(NaiveDate::from_ymd_opt(2021, 1, 1).unwrap()),
            "2021-01-01"
        );
    }
}
