//! Wire envelope of an HFP message as delivered by the upstream topic.
//!
//! Every field is optional on the wire; normalisation into a [`super::Record`] decides
//! which ones are required.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HfpData {
    pub topic: HfpTopic,
    pub payload: HfpPayload,
}

impl HfpData {
    pub fn from_json(bytes: &[u8]) -> Result<HfpData, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HfpTopic {
    pub received_at: Option<i64>,
    pub topic_prefix: Option<String>,
    pub topic_version: Option<String>,
    pub journey_type: Option<String>,
    pub temporal_type: Option<String>,
    pub event_type: Option<String>,
    pub transport_mode: Option<String>,
    pub operator_id: Option<i32>,
    pub vehicle_number: Option<i32>,
    pub unique_vehicle_id: Option<String>,
    pub route_id: Option<String>,
    pub direction_id: Option<i32>,
    pub headsign: Option<String>,
    pub start_time: Option<String>,
    pub next_stop: Option<String>,
    pub geohash_level: Option<i32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HfpPayload {
    pub tst: Option<String>,
    pub desi: Option<String>,
    pub dir: Option<String>,
    pub oper: Option<i32>,
    pub veh: Option<i32>,
    pub tsi: Option<i64>,
    pub spd: Option<f64>,
    pub hdg: Option<i32>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
    pub acc: Option<f64>,
    pub dl: Option<i32>,
    pub odo: Option<f64>,
    pub drst: Option<i32>,
    pub oday: Option<String>,
    pub jrn: Option<i32>,
    pub line: Option<i32>,
    pub start: Option<String>,
    pub loc: Option<String>,
    pub stop: Option<i32>,
    pub route: Option<String>,
    pub occu: Option<i32>,
    pub seq: Option<i32>,
    pub dr_type: Option<i32>,

    // signal priority
    pub tlp_requestid: Option<i32>,
    pub tlp_requesttype: Option<String>,
    pub tlp_prioritylevel: Option<String>,
    pub tlp_reason: Option<String>,
    pub tlp_att_seq: Option<i32>,
    pub tlp_decision: Option<String>,
    pub sid: Option<i32>,
    pub signal_groupid: Option<i32>,
    pub tlp_signalgroupnbr: Option<i32>,
    pub tlp_line_configid: Option<i32>,
    pub tlp_point_configid: Option<i32>,
    pub tlp_frequency: Option<i32>,
    pub tlp_protocol: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_camel_case_envelope() {
        let json = br#"{
            "topic": {"receivedAt": 1609480800000, "eventType": "TLR", "journeyType": "journey",
                      "uniqueVehicleId": "1/1", "temporalType": "ongoing"},
            "payload": {"tst": "2021-01-01T06:00:00Z", "tlpRequestid": 12, "signalGroupid": 3,
                        "tlpSignalgroupnbr": 4, "drType": 1}
        }"#;

        let data = HfpData::from_json(json).unwrap();
        assert_eq!(data.topic.received_at, Some(1_609_480_800_000));
        assert_eq!(data.topic.event_type.as_deref(), Some("TLR"));
        assert_eq!(data.payload.tlp_requestid, Some(12));
        assert_eq!(data.payload.signal_groupid, Some(3));
        assert_eq!(data.payload.tlp_signalgroupnbr, Some(4));
        assert_eq!(data.payload.dr_type, Some(1));
        assert_eq!(data.payload.oday, None);
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let data = HfpData::from_json(br#"{"topic": {}, "payload": {}}"#).unwrap();
        assert!(data.payload.tst.is_none());
        assert!(HfpData::from_json(b"not json").is_err());
    }
}
