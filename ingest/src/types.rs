use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const FILE_EXTENSION: &str = ".xml";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%6f";

/// The two raw payloads pulled from the vendor on every retrieval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileKind {
    DataPoints,
    Transmissions,
}

impl FileKind {
    pub const fn suffix(&self) -> &'static str {
        match self {
            FileKind::DataPoints => "data_points",
            FileKind::Transmissions => "transmissions",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("invalid file name: {0}")]
pub struct FileNameError(pub String);

/// Name of a raw payload blob: `{timestamp}_{integration_id}_{kind}.xml`.
///
/// A data points file and its transmissions companion always share the
/// `{timestamp}_{integration_id}` prefix, which is how they are re-associated
/// during processing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileName {
    timestamp: String,
    integration_id: String,
    kind: FileKind,
}

impl FileName {
    pub fn new(created_at: DateTime<Utc>, integration_id: &str, kind: FileKind) -> Self {
        FileName {
            timestamp: created_at.format(TIMESTAMP_FORMAT).to_string(),
            integration_id: integration_id.to_string(),
            kind,
        }
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn integration_id(&self) -> &str {
        &self.integration_id
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn prefix(&self) -> String {
        format!("{}_{}", self.timestamp, self.integration_id)
    }

    pub fn with_kind(&self, kind: FileKind) -> FileName {
        FileName {
            kind,
            ..self.clone()
        }
    }

    /// The other file of the pair.
    pub fn companion(&self) -> FileName {
        match self.kind {
            FileKind::DataPoints => self.with_kind(FileKind::Transmissions),
            FileKind::Transmissions => self.with_kind(FileKind::DataPoints),
        }
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}{}",
            self.timestamp,
            self.integration_id,
            self.kind.suffix(),
            FILE_EXTENSION
        )
    }
}

impl FromStr for FileName {
    type Err = FileNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FileNameError(s.to_string());
        let stem = s.strip_suffix(FILE_EXTENSION).ok_or_else(invalid)?;

        let (prefix, kind) = [FileKind::DataPoints, FileKind::Transmissions]
            .into_iter()
            .find_map(|kind| {
                stem.strip_suffix(kind.suffix())
                    .and_then(|rest| rest.strip_suffix('_'))
                    .map(|prefix| (prefix, kind))
            })
            .ok_or_else(invalid)?;

        let (timestamp, integration_id) = prefix.split_once('_').ok_or_else(invalid)?;
        if timestamp.is_empty()
            || !timestamp.bytes().all(|b| b.is_ascii_digit())
            || integration_id.is_empty()
        {
            return Err(invalid());
        }

        Ok(FileName {
            timestamp: timestamp.to_string(),
            integration_id: integration_id.to_string(),
            kind,
        })
    }
}

/// Lifecycle state of a tracked data points file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Processed,
}

impl FileStatus {
    /// Lookup order used when resolving the status of a file.
    pub const ALL: [FileStatus; 3] = [
        FileStatus::Pending,
        FileStatus::InProgress,
        FileStatus::Processed,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::InProgress => "in_progress",
            FileStatus::Processed => "processed",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown file status '{s}'"))
    }
}

/// One GPS fix reported by a collar.
#[derive(Clone, Debug, PartialEq)]
pub struct DataPoint {
    pub serial_num: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Wall-clock time in the device's own timezone.
    pub recorded_at: NaiveDateTime,
    pub num_sats: Option<String>,
    pub hdop: Option<String>,
    pub fix_time: Option<String>,
    pub dimension: Option<String>,
    pub activity: Option<String>,
    pub temperature: Option<String>,
    pub mortality: Option<bool>,
    pub low_batt_voltage: Option<bool>,
}

/// A collar check-in carrying battery state and the device's GMT offset.
#[derive(Clone, Debug, PartialEq)]
pub struct TransmissionRecord {
    pub date_sent: DateTime<Utc>,
    pub collar_serial_num: String,
    pub number_fixes: Option<i64>,
    pub batt_voltage: Option<f64>,
    pub mortality: Option<String>,
    pub break_off: Option<String>,
    pub sat_errors: Option<String>,
    pub year_base: Option<String>,
    pub day_base: Option<String>,
    /// Signed hours.
    pub gmt_offset: Option<i32>,
    pub low_batt_voltage: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Location {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// Observation in the shape accepted by the downstream tracking platform.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NormalizedObservation {
    pub source: String,
    pub source_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub recorded_at: DateTime<FixedOffset>,
    pub location: Location,
    pub additional: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_name_format() {
        let created_at = Utc
            .with_ymd_and_hms(2024, 12, 6, 12, 12, 17)
            .unwrap()
            .checked_add_signed(chrono::Duration::microseconds(722379))
            .unwrap();
        let name = FileName::new(created_at, "INT1", FileKind::DataPoints);

        assert_eq!(name.to_string(), "20241206121217722379_INT1_data_points.xml");
        assert_eq!(name.prefix(), "20241206121217722379_INT1");
        assert_eq!(
            name.companion().to_string(),
            "20241206121217722379_INT1_transmissions.xml"
        );
    }

    #[test]
    fn test_file_name_parse() {
        let name: FileName = "20241206121217_INT1_data_points.xml".parse().unwrap();
        assert_eq!(name.timestamp(), "20241206121217");
        assert_eq!(name.integration_id(), "INT1");
        assert_eq!(name.kind(), FileKind::DataPoints);

        let name: FileName =
            "20241206121217722379_1eb8ba40-6312-4093-9b47-7786320b11fb_transmissions.xml"
                .parse()
                .unwrap();
        assert_eq!(
            name.integration_id(),
            "1eb8ba40-6312-4093-9b47-7786320b11fb"
        );
        assert_eq!(name.kind(), FileKind::Transmissions);
        assert_eq!(name.companion().kind(), FileKind::DataPoints);
    }

    #[test]
    fn test_file_name_parse_errors() {
        for invalid in [
            "test_file.xml",
            "20241206121217_INT1_data_points.json",
            "20241206121217_data_points.xml",
            "2024x206121217_INT1_data_points.xml",
            "_INT1_transmissions.xml",
            "20241206121217__transmissions.xml",
        ] {
            assert_eq!(
                invalid.parse::<FileName>(),
                Err(FileNameError(invalid.to_string())),
                "{invalid}"
            );
        }
    }

    #[test]
    fn test_file_status_round_trip_names() {
        assert_eq!("in_progress".parse::<FileStatus>(), Ok(FileStatus::InProgress));
        assert!("done".parse::<FileStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&FileStatus::Processed).unwrap(),
            "\"processed\""
        );
    }
}
