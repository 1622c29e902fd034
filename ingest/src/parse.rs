//! Decoding of the vendor's XML payloads.
//!
//! Both endpoints answer with a serialized .NET `DataSet`:
//!
//! ```text
//! <DataSet>
//!   <xs:schema>...</xs:schema>
//!   <diffgr:diffgram>
//!     <NewDataSet>
//!       <Table>...</Table>
//!       <Table>...</Table>
//!     </NewDataSet>
//!   </diffgr:diffgram>
//! </DataSet>
//! ```
//!
//! Rows are collected while streaming, so a table holding a single row yields a
//! one-element list exactly like the multi-row case. A well-formed envelope
//! without `diffgram`, `NewDataSet` or `Table` rows is an empty result, not an error.

use crate::types::{DataPoint, FileKind, TransmissionRecord};
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::Reader;
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesRef, Event};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

const ROOT: &str = "DataSet";
const ROW_PATH: [&str; 3] = ["DataSet", "diffgram", "NewDataSet"];
const ROW: &str = "Table";

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("unknown entity &{0};")]
    UnknownEntity(String),

    #[error("document ended inside <{0}>")]
    Unclosed(String),

    #[error("missing <{0}> envelope")]
    MissingEnvelope(&'static str),

    #[error("row {row}: missing required field {field}")]
    MissingField { row: usize, field: &'static str },

    #[error("row {row}: invalid value {value:?} for {field}")]
    InvalidValue {
        row: usize,
        field: &'static str,
        value: String,
    },

    #[error("row {row}: {field} {value} is out of range")]
    OutOfRange {
        row: usize,
        field: &'static str,
        value: f64,
    },
}

/// The payload could not be decoded. Fatal for the file it came from.
#[derive(thiserror::Error, Debug)]
#[error("bad {payload} payload: {source}")]
pub struct BadPayload {
    pub payload: FileKind,
    #[source]
    pub source: ParseError,
}

/// Fixes grouped by device serial number, each list in document order.
pub type DataPointsByDevice = BTreeMap<String, Vec<DataPoint>>;

pub fn parse_data_points(xml: impl AsRef<[u8]>) -> Result<DataPointsByDevice, BadPayload> {
    let bad = |source| BadPayload {
        payload: FileKind::DataPoints,
        source,
    };

    let rows = read_rows(xml.as_ref()).map_err(bad)?;
    let mut by_device = DataPointsByDevice::new();
    for (index, row) in rows.into_iter().enumerate() {
        let point = Row::new(index, row).data_point().map_err(bad)?;
        by_device
            .entry(point.serial_num.clone())
            .or_default()
            .push(point);
    }

    for (serial_num, points) in &by_device {
        tracing::debug!(device = %serial_num, count = points.len(), "extracted data points");
    }
    Ok(by_device)
}

pub fn parse_transmissions(
    xml: impl AsRef<[u8]>,
) -> Result<Vec<TransmissionRecord>, BadPayload> {
    let bad = |source| BadPayload {
        payload: FileKind::Transmissions,
        source,
    };

    read_rows(xml.as_ref())
        .map_err(bad)?
        .into_iter()
        .enumerate()
        .map(|(index, row)| Row::new(index, row).transmission().map_err(bad))
        .collect()
}

/// Streams the document and returns the field map of every `Table` row.
///
/// Field text arrives in pieces (text, entity references, CDATA) and is
/// concatenated untrimmed; `Row` trims the finished value.
fn read_rows(xml: &[u8]) -> Result<Vec<HashMap<String, String>>, ParseError> {
    let mut reader = Reader::from_reader(xml);

    let mut path: Vec<String> = Vec::new();
    let mut seen_root = false;
    let mut rows = Vec::new();
    let mut row: Option<HashMap<String, String>> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = reader
                    .decoder()
                    .decode(e.local_name().as_ref())
                    .map_err(quick_xml::Error::from)?
                    .into_owned();
                if path.is_empty() {
                    if seen_root || name != ROOT {
                        return Err(ParseError::MissingEnvelope(ROOT));
                    }
                    seen_root = true;
                }
                if name == ROW && path == ROW_PATH {
                    row = Some(HashMap::new());
                }
                path.push(name);
            }
            Event::Empty(e) => {
                let name = reader
                    .decoder()
                    .decode(e.local_name().as_ref())
                    .map_err(quick_xml::Error::from)?
                    .into_owned();
                if path.is_empty() {
                    if seen_root || name != ROOT {
                        return Err(ParseError::MissingEnvelope(ROOT));
                    }
                    seen_root = true;
                } else if name == ROW && path == ROW_PATH {
                    rows.push(HashMap::new());
                }
            }
            Event::Text(e) => {
                let text = e.decode().map_err(quick_xml::Error::from)?;
                push_field_text(&mut row, &path, &text);
            }
            Event::CData(e) => {
                let text = e.decode().map_err(quick_xml::Error::from)?;
                push_field_text(&mut row, &path, &text);
            }
            Event::GeneralRef(e) => {
                let text = resolve_reference(&e)?;
                push_field_text(&mut row, &path, &text);
            }
            Event::End(_) => {
                path.pop();
                if path == ROW_PATH
                    && let Some(fields) = row.take()
                {
                    rows.push(fields);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = path.pop() {
        return Err(ParseError::Unclosed(open));
    }
    if !seen_root {
        return Err(ParseError::MissingEnvelope(ROOT));
    }
    Ok(rows)
}

/// Field values sit directly below a row: DataSet/diffgram/NewDataSet/Table/<field>
fn push_field_text(row: &mut Option<HashMap<String, String>>, path: &[String], text: &str) {
    if let (Some(fields), Some(field)) = (row.as_mut(), path.get(ROW_PATH.len() + 1))
        && path.len() == ROW_PATH.len() + 2
    {
        fields.entry(field.clone()).or_default().push_str(text);
    }
}

fn resolve_reference(reference: &BytesRef<'_>) -> Result<String, ParseError> {
    if let Some(ch) = reference.resolve_char_ref()? {
        return Ok(ch.to_string());
    }
    let name = reference.decode().map_err(quick_xml::Error::from)?;
    resolve_predefined_entity(&name)
        .map(str::to_string)
        .ok_or_else(|| ParseError::UnknownEntity(name.into_owned()))
}

/// Typed access to the fields of one table row.
struct Row {
    index: usize,
    fields: HashMap<String, String>,
}

impl Row {
    fn new(index: usize, fields: HashMap<String, String>) -> Self {
        Row { index, fields }
    }

    fn optional(&self, field: &'static str) -> Option<String> {
        self.fields
            .get(field)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn required(&self, field: &'static str) -> Result<String, ParseError> {
        self.optional(field).ok_or(ParseError::MissingField {
            row: self.index,
            field,
        })
    }

    fn invalid(&self, field: &'static str, value: String) -> ParseError {
        ParseError::InvalidValue {
            row: self.index,
            field,
            value,
        }
    }

    fn number<T: FromStr>(&self, field: &'static str) -> Result<Option<T>, ParseError> {
        self.optional(field)
            .map(|value| value.parse::<T>().map_err(|_| self.invalid(field, value)))
            .transpose()
    }

    fn bounded(&self, field: &'static str, min: f64, max: f64) -> Result<Option<f64>, ParseError> {
        match self.number::<f64>(field)? {
            Some(value) if !(min..=max).contains(&value) => Err(ParseError::OutOfRange {
                row: self.index,
                field,
                value,
            }),
            value => Ok(value),
        }
    }

    fn boolean(&self, field: &'static str) -> Result<Option<bool>, ParseError> {
        self.optional(field)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(self.invalid(field, value)),
            })
            .transpose()
    }

    fn naive_datetime(&self, field: &'static str) -> Result<NaiveDateTime, ParseError> {
        let value = self.required(field)?;
        parse_naive_datetime(&value).ok_or_else(|| self.invalid(field, value))
    }

    fn utc_datetime(&self, field: &'static str) -> Result<DateTime<Utc>, ParseError> {
        let value = self.required(field)?;
        match DateTime::parse_from_rfc3339(&value) {
            Ok(dt) => Ok(dt.with_timezone(&Utc)),
            Err(_) => parse_naive_datetime(&value)
                .map(|naive| naive.and_utc())
                .ok_or_else(|| self.invalid(field, value)),
        }
    }

    fn data_point(&self) -> Result<DataPoint, ParseError> {
        Ok(DataPoint {
            serial_num: self.required("AtsSerialNum")?,
            longitude: self.bounded("Longitude", -180.0, 360.0)?,
            latitude: self.bounded("Latitude", -90.0, 90.0)?,
            recorded_at: self.naive_datetime("DateYearAndJulian")?,
            num_sats: self.optional("NumSats"),
            hdop: self.optional("Hdop"),
            fix_time: self.optional("FixTime"),
            dimension: self.optional("Dimension"),
            activity: self.optional("Activity"),
            temperature: self.optional("Temperature"),
            mortality: self.boolean("Mortality")?,
            low_batt_voltage: self.boolean("LowBattVoltage")?,
        })
    }

    fn transmission(&self) -> Result<TransmissionRecord, ParseError> {
        Ok(TransmissionRecord {
            date_sent: self.utc_datetime("DateSent")?,
            collar_serial_num: self.required("CollarSerialNum")?,
            number_fixes: self.number("NumberFixes")?,
            batt_voltage: self.number("BattVoltage")?,
            mortality: self.optional("Mortality"),
            break_off: self.optional("BreakOff"),
            sat_errors: self.optional("SatErrors"),
            year_base: self.optional("YearBase"),
            day_base: self.optional("DayBase"),
            gmt_offset: self.number("GmtOffset")?,
            low_batt_voltage: self.boolean("LowBattVoltage")?,
        })
    }
}

/// Accepts ISO 8601 timestamps with or without an offset. An offset, when
/// present, is dropped: fixes are localized later with the device's GMT offset.
fn parse_naive_datetime(value: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .into_iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
}
