use crate::activity::ActivityLog;
use crate::metrics_defs::INVALID_GMT_OFFSETS;
use crate::types::{DataPoint, Location, NormalizedObservation, TransmissionRecord};
use chrono::{FixedOffset, Offset, TimeZone, Utc};
use serde_json::{Map, Value};
use shared::counter;
use std::collections::HashMap;
use std::ops::RangeInclusive;

pub const VALID_GMT_OFFSETS: RangeInclusive<i32> = -12..=14;
pub const OBSERVATION_TYPE: &str = "tracking-device";
const ACTION: &str = "process";

/// Picks the GMT offset of every device seen in `transmissions`.
///
/// The first in-range offset reported for a device wins. A device that only
/// reported out-of-range offsets falls back to UTC and produces one warning.
/// Devices without transmissions are absent from the map and default to UTC.
pub fn select_gmt_offsets(
    transmissions: &[TransmissionRecord],
    integration_id: &str,
    activity: &ActivityLog,
) -> HashMap<String, i32> {
    if transmissions.is_empty() {
        activity.warning(
            integration_id,
            ACTION,
            "No transmissions available, all devices default to UTC",
        );
        return HashMap::new();
    }

    let mut valid: HashMap<String, i32> = HashMap::new();
    let mut rejected: HashMap<String, i32> = HashMap::new();
    for record in transmissions {
        let serial = &record.collar_serial_num;
        if valid.contains_key(serial) {
            continue;
        }
        match record.gmt_offset {
            Some(offset) if VALID_GMT_OFFSETS.contains(&offset) => {
                valid.insert(serial.clone(), offset);
                rejected.remove(serial);
            }
            Some(offset) => {
                rejected.entry(serial.clone()).or_insert(offset);
            }
            None => {}
        }
    }

    let mut rejected: Vec<_> = rejected.into_iter().collect();
    rejected.sort();
    for (serial, offset) in rejected {
        counter!(INVALID_GMT_OFFSETS).increment(1);
        activity.warning(
            integration_id,
            ACTION,
            format!("GMT offset invalid for device '{serial}' value '{offset}'. Defaulting to UTC."),
        );
        valid.insert(serial, 0);
    }
    valid
}

/// Converts the fixes of one device into downstream observations, attaching
/// `gmt_offset_hours` to their wall-clock timestamps.
pub fn normalize(
    serial_num: &str,
    points: &[DataPoint],
    gmt_offset_hours: i32,
) -> Vec<NormalizedObservation> {
    let offset = FixedOffset::east_opt(gmt_offset_hours * 3600).unwrap_or_else(|| Utc.fix());

    points
        .iter()
        .filter_map(|point| {
            let Some(recorded_at) = offset.from_local_datetime(&point.recorded_at).single()
            else {
                tracing::warn!(
                    device = serial_num,
                    recorded_at = %point.recorded_at,
                    "Unrepresentable timestamp, dropping fix"
                );
                return None;
            };
            Some(NormalizedObservation {
                source: serial_num.to_string(),
                source_name: serial_num.to_string(),
                kind: OBSERVATION_TYPE.to_string(),
                recorded_at,
                location: Location {
                    lat: point.latitude,
                    lon: point.longitude,
                },
                additional: additional_fields(point),
            })
        })
        .collect()
}

fn additional_fields(point: &DataPoint) -> Map<String, Value> {
    let text = [
        ("num_sats", &point.num_sats),
        ("hdop", &point.hdop),
        ("fix_time", &point.fix_time),
        ("dimension", &point.dimension),
        ("activity", &point.activity),
        ("temperature", &point.temperature),
    ];
    let flags = [
        ("mortality", point.mortality),
        ("low_batt_voltage", point.low_batt_voltage),
    ];

    let mut additional = Map::new();
    for (key, value) in text {
        if let Some(value) = value {
            additional.insert(key.to_string(), Value::String(value.clone()));
        }
    }
    for (key, value) in flags {
        if let Some(value) = value {
            additional.insert(key.to_string(), Value::Bool(value));
        }
    }
    additional
}

pub fn batches<T>(items: &[T], batch_size: usize) -> impl Iterator<Item = &[T]> {
    items.chunks(batch_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Level;
    use chrono::{DateTime, NaiveDate};

    fn transmission(serial: &str, offset: Option<i32>) -> TransmissionRecord {
        TransmissionRecord {
            date_sent: DateTime::<Utc>::UNIX_EPOCH,
            collar_serial_num: serial.to_string(),
            number_fixes: None,
            batt_voltage: None,
            mortality: None,
            break_off: None,
            sat_errors: None,
            year_base: None,
            day_base: None,
            gmt_offset: offset,
            low_batt_voltage: None,
        }
    }

    fn point(hour: u32) -> DataPoint {
        DataPoint {
            serial_num: "052194".to_string(),
            latitude: Some(5.52827),
            longitude: Some(-68.52625),
            recorded_at: NaiveDate::from_ymd_opt(2024, 5, 31)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
            num_sats: Some("08".to_string()),
            hdop: None,
            fix_time: None,
            dimension: None,
            activity: None,
            temperature: Some("+24".to_string()),
            mortality: Some(false),
            low_batt_voltage: None,
        }
    }

    #[test]
    fn test_invalid_offsets_are_zeroed() {
        let activity = ActivityLog::default();
        let offsets = select_gmt_offsets(
            &[
                transmission("A", Some(0)),
                transmission("B", Some(25)),
                transmission("C", Some(-30)),
            ],
            "INT1",
            &activity,
        );

        assert_eq!(
            offsets,
            HashMap::from([("A".into(), 0), ("B".into(), 0), ("C".into(), 0)])
        );
        let entries = activity.entries("INT1");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.level == Level::Warning));
        assert!(entries[0].title.contains("'B'"));
        assert!(entries[1].title.contains("'C'"));
        // Warnings do not affect health.
        assert!(activity.is_healthy("INT1"));
    }

    #[test]
    fn test_first_valid_offset_wins() {
        let activity = ActivityLog::default();
        let offsets = select_gmt_offsets(
            &[
                transmission("A", Some(99)),
                transmission("A", None),
                transmission("A", Some(-5)),
                transmission("A", Some(3)),
                transmission("B", Some(14)),
                transmission("C", Some(-12)),
            ],
            "INT1",
            &activity,
        );

        assert_eq!(offsets["A"], -5);
        assert_eq!(offsets["B"], 14);
        assert_eq!(offsets["C"], -12);
        assert!(activity.entries("INT1").is_empty());
    }

    #[test]
    fn test_no_transmissions_warns() {
        let activity = ActivityLog::default();
        assert!(select_gmt_offsets(&[], "INT1", &activity).is_empty());
        assert_eq!(activity.entries("INT1").len(), 1);
    }

    #[test]
    fn test_normalize() {
        let observations = normalize("052194", &[point(0), point(8)], 3);
        assert_eq!(observations.len(), 2);

        let json = serde_json::to_value(&observations[0]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "source": "052194",
                "source_name": "052194",
                "type": "tracking-device",
                "recorded_at": "2024-05-31T00:00:00+03:00",
                "location": {"lat": 5.52827, "lon": -68.52625},
                "additional": {"num_sats": "08", "temperature": "+24", "mortality": false}
            })
        );
        assert_eq!(
            observations[1].recorded_at.with_timezone(&Utc).to_rfc3339(),
            "2024-05-31T05:00:00+00:00"
        );
    }

    #[test]
    fn test_batches() {
        let items: Vec<u32> = (0..5).collect();
        let sizes: Vec<usize> = batches(&items, 2).map(<[u32]>::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batches(&items, 0).count(), 5);
        assert_eq!(batches::<u32>(&[], 200).count(), 0);
    }
}
