mod category;
pub mod envelope;
pub mod schema;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use category::{EventCategory, REVENUE_JOURNEY_TYPE};
pub use envelope::{HfpData, HfpPayload, HfpTopic};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("failed to decode message body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("event has no event type")]
    MissingEventType,
    #[error("unknown event type {0}")]
    UnknownEventType(String),
    #[error("event has no tst")]
    MissingTst,
    #[error("invalid {field} value {value:?}: {source}")]
    InvalidTimestamp {
        field: &'static str,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("receivedAt {0} is out of range")]
    ReceivedAtOutOfRange(i64),
}

/// Fields only present on signal-priority (TLR / TLA) events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalPriority {
    pub tlp_request_id: Option<i32>,
    pub tlp_request_type: Option<String>,
    pub tlp_priority_level: Option<String>,
    pub tlp_reason: Option<String>,
    pub tlp_att_seq: Option<i32>,
    pub tlp_decision: Option<String>,
    pub sid: Option<i32>,
    pub signal_group_id: Option<i32>,
    pub tlp_signal_group_nbr: Option<i32>,
    pub tlp_line_config_id: Option<i32>,
    pub tlp_point_config_id: Option<i32>,
    pub tlp_frequency: Option<i32>,
    pub tlp_protocol: Option<String>,
}

/// A normalised HFP event. The category tag selects the column schema; the signal
/// priority extension is only populated for [`EventCategory::SignalPriority`].
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub category: EventCategory,
    pub uuid: Uuid,
    pub tst: DateTime<FixedOffset>,
    pub unique_vehicle_id: Option<String>,
    pub event_type: Option<String>,
    pub journey_type: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub topic_prefix: Option<String>,
    pub topic_version: Option<String>,
    pub is_ongoing: Option<bool>,
    pub mode: Option<String>,
    pub owner_operator_id: Option<i32>,
    pub vehicle_number: Option<i32>,
    pub route_id: Option<String>,
    pub direction_id: Option<i32>,
    pub headsign: Option<String>,
    pub journey_start_time: Option<NaiveTime>,
    pub next_stop_id: Option<String>,
    pub geohash_level: Option<i32>,
    pub topic_latitude: Option<f64>,
    pub topic_longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub desi: Option<String>,
    pub dir: Option<i32>,
    pub oper: Option<i32>,
    pub veh: Option<i32>,
    pub tsi: Option<i64>,
    pub spd: Option<f64>,
    pub hdg: Option<i32>,
    pub acc: Option<f64>,
    pub dl: Option<i32>,
    pub odo: Option<f64>,
    pub drst: Option<bool>,
    pub oday: Option<NaiveDate>,
    pub jrn: Option<i32>,
    pub line: Option<i32>,
    pub start: Option<NaiveTime>,
    pub location_quality_method: Option<String>,
    pub stop: Option<i32>,
    pub route: Option<String>,
    pub occu: Option<i32>,
    pub seq: Option<i32>,
    pub dr_type: Option<i32>,
    pub signal_priority: Option<SignalPriority>,
}

impl Record {
    /// A record with every optional attribute unset.
    pub fn new(category: EventCategory, tst: DateTime<FixedOffset>) -> Record {
        Record {
            category,
            uuid: Uuid::new_v4(),
            tst,
            unique_vehicle_id: None,
            event_type: None,
            journey_type: None,
            received_at: None,
            topic_prefix: None,
            topic_version: None,
            is_ongoing: None,
            mode: None,
            owner_operator_id: None,
            vehicle_number: None,
            route_id: None,
            direction_id: None,
            headsign: None,
            journey_start_time: None,
            next_stop_id: None,
            geohash_level: None,
            topic_latitude: None,
            topic_longitude: None,
            latitude: None,
            longitude: None,
            desi: None,
            dir: None,
            oper: None,
            veh: None,
            tsi: None,
            spd: None,
            hdg: None,
            acc: None,
            dl: None,
            odo: None,
            drst: None,
            oday: None,
            jrn: None,
            line: None,
            start: None,
            location_quality_method: None,
            stop: None,
            route: None,
            occu: None,
            seq: None,
            dr_type: None,
            signal_priority: None,
        }
    }

    /// Classifies and normalises a decoded envelope.
    pub fn parse(data: &HfpData) -> Result<Record, ParseError> {
        let topic = &data.topic;
        let payload = &data.payload;

        let event_type = topic
            .event_type
            .as_deref()
            .ok_or(ParseError::MissingEventType)?;
        let category = EventCategory::classify(topic.journey_type.as_deref(), event_type)
            .ok_or_else(|| ParseError::UnknownEventType(event_type.to_string()))?;

        let tst_raw = payload.tst.as_deref().ok_or(ParseError::MissingTst)?;
        let tst = DateTime::parse_from_rfc3339(tst_raw).map_err(|source| {
            ParseError::InvalidTimestamp {
                field: "tst",
                value: tst_raw.to_string(),
                source,
            }
        })?;

        let received_at = match topic.received_at {
            Some(millis) => Some(
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .ok_or(ParseError::ReceivedAtOutOfRange(millis))?,
            ),
            None => None,
        };

        let signal_priority = (category == EventCategory::SignalPriority).then(|| SignalPriority {
            tlp_request_id: payload.tlp_requestid,
            tlp_request_type: payload.tlp_requesttype.clone(),
            tlp_priority_level: payload.tlp_prioritylevel.clone(),
            tlp_reason: payload.tlp_reason.clone(),
            tlp_att_seq: payload.tlp_att_seq,
            tlp_decision: payload.tlp_decision.clone(),
            sid: payload.sid,
            signal_group_id: payload.signal_groupid,
            tlp_signal_group_nbr: payload.tlp_signalgroupnbr,
            tlp_line_config_id: payload.tlp_line_configid,
            tlp_point_config_id: payload.tlp_point_configid,
            tlp_frequency: payload.tlp_frequency,
            tlp_protocol: payload.tlp_protocol.clone(),
        });

        Ok(Record {
            category,
            uuid: Uuid::new_v4(),
            tst,
            unique_vehicle_id: topic.unique_vehicle_id.clone(),
            event_type: Some(event_type.to_string()),
            journey_type: topic.journey_type.clone(),
            received_at,
            topic_prefix: topic.topic_prefix.clone(),
            topic_version: topic.topic_version.clone(),
            is_ongoing: topic.temporal_type.as_deref().map(|t| t == "ongoing"),
            mode: topic.transport_mode.clone(),
            owner_operator_id: topic.operator_id,
            vehicle_number: topic.vehicle_number,
            route_id: topic.route_id.clone(),
            direction_id: topic.direction_id,
            headsign: topic.headsign.clone(),
            journey_start_time: parse_time("startTime", topic.start_time.as_deref())?,
            next_stop_id: topic.next_stop.clone(),
            geohash_level: topic.geohash_level,
            topic_latitude: topic.latitude,
            topic_longitude: topic.longitude,
            latitude: payload.lat,
            longitude: payload.long,
            desi: payload.desi.clone(),
            dir: payload.dir.as_deref().and_then(|d| d.trim().parse().ok()),
            oper: payload.oper,
            veh: payload.veh,
            tsi: payload.tsi,
            spd: payload.spd,
            hdg: payload.hdg,
            acc: payload.acc,
            dl: payload.dl,
            odo: payload.odo,
            drst: payload.drst.map(|d| d == 1),
            oday: parse_date("oday", payload.oday.as_deref())?,
            jrn: payload.jrn,
            line: payload.line,
            start: parse_time("start", payload.start.as_deref())?,
            location_quality_method: payload.loc.clone(),
            stop: payload.stop,
            route: payload.route.clone(),
            occu: payload.occu,
            seq: payload.seq,
            dr_type: payload.dr_type,
            signal_priority,
        })
    }

    pub fn is_revenue(&self) -> bool {
        self.journey_type.as_deref() == Some(REVENUE_JOURNEY_TYPE)
    }

    /// Time used to pick the record's time slot: receipt time, falling back to `tst`
    /// for records that never carried one (those are flagged invalid anyway).
    pub fn routing_time(&self) -> DateTime<Utc> {
        self.received_at
            .unwrap_or_else(|| self.tst.with_timezone(&Utc))
    }
}

fn parse_time(field: &'static str, value: Option<&str>) -> Result<Option<NaiveTime>, ParseError> {
    let Some(value) = value else {
        return Ok(None);
    };
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map(Some)
        .map_err(|source| ParseError::InvalidTimestamp {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_date(field: &'static str, value: Option<&str>) -> Result<Option<NaiveDate>, ParseError> {
    let Some(value) = value else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(Some)
        .map_err(|source| ParseError::InvalidTimestamp {
            field,
            value: value.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(event_type: &str, journey_type: &str) -> HfpData {
        HfpData {
            topic: HfpTopic {
                received_at: Some(1_609_480_800_123),
                event_type: Some(event_type.to_string()),
                journey_type: Some(journey_type.to_string()),
                unique_vehicle_id: Some("1/1".to_string()),
                temporal_type: Some("ongoing".to_string()),
                start_time: Some("08:05".to_string()),
                ..Default::default()
            },
            payload: HfpPayload {
                tst: Some("2021-01-01T08:00:00+02:00".to_string()),
                dir: Some("1".to_string()),
                drst: Some(1),
                oday: Some("2021-01-01".to_string()),
                start: Some("08:05:30".to_string()),
                tlp_requestid: Some(42),
                ..Default::default()
            },
        }
    }

    #[test]
    fn parses_position_event() {
        let record = Record::parse(&envelope("VP", "journey")).unwrap();

        assert_eq!(record.category, EventCategory::VehiclePosition);
        assert_eq!(record.event_type.as_deref(), Some("VP"));
        assert_eq!(record.tst.timestamp(), 1_609_480_800);
        assert_eq!(
            record.received_at.map(|r| r.timestamp_millis()),
            Some(1_609_480_800_123)
        );
        assert_eq!(record.is_ongoing, Some(true));
        assert_eq!(record.dir, Some(1));
        assert_eq!(record.drst, Some(true));
        assert_eq!(record.oday, NaiveDate::from_ymd_opt(2021, 1, 1));
        assert_eq!(record.journey_start_time, NaiveTime::from_hms_opt(8, 5, 0));
        assert_eq!(record.start, NaiveTime::from_hms_opt(8, 5, 30));
        assert!(record.signal_priority.is_none());
        assert!(record.is_revenue());
    }

    #[test]
    fn attaches_signal_priority_fields() {
        let record = Record::parse(&envelope("TLR", "journey")).unwrap();
        assert_eq!(record.category, EventCategory::SignalPriority);
        assert_eq!(
            record.signal_priority.and_then(|s| s.tlp_request_id),
            Some(42)
        );
    }

    #[test]
    fn non_numeric_dir_is_dropped() {
        let mut data = envelope("VP", "journey");
        data.payload.dir = Some("x".to_string());
        assert_eq!(Record::parse(&data).unwrap().dir, None);
    }

    #[test]
    fn rejects_unparseable_events() {
        let mut data = envelope("NOPE", "journey");
        assert!(matches!(
            Record::parse(&data),
            Err(ParseError::UnknownEventType(_))
        ));

        data = envelope("VP", "journey");
        data.payload.tst = None;
        assert!(matches!(Record::parse(&data), Err(ParseError::MissingTst)));

        data = envelope("VP", "journey");
        data.payload.oday = Some("01.01.2021".to_string());
        assert!(matches!(
            Record::parse(&data),
            Err(ParseError::InvalidTimestamp { field: "oday", .. })
        ));

        data.topic.event_type = None;
        assert!(matches!(
            Record::parse(&data),
            Err(ParseError::MissingEventType)
        ));
    }

    #[test]
    fn routing_time_falls_back_to_tst() {
        let mut record = Record::parse(&envelope("VP", "deadrun")).unwrap();
        assert!(!record.is_revenue());
        record.received_at = None;
        assert_eq!(record.routing_time(), record.tst.with_timezone(&Utc));
    }
}
