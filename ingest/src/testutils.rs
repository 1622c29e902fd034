//! Fixtures and in-memory collaborators shared by the unit tests.

use crate::activity::ActivityLog;
use crate::config::Config;
use crate::blob_store::{BlobStore, MemoryBlobStore};
use crate::group_store::{GroupStore, MemoryGroupStore};
use crate::lifecycle::Lifecycle;
use crate::processing::Processor;
use crate::sender::{ObservationSender, SenderError};
use crate::types::NormalizedObservation;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

pub const INTEGRATION_ID: &str = "1eb8ba40-6312-4093-9b47-7786320b11fb";
pub const DATA_FILE_NAME: &str =
    "20241206121217722379_1eb8ba40-6312-4093-9b47-7786320b11fb_data_points.xml";
pub const TRANSMISSIONS_FILE_NAME: &str =
    "20241206121217722379_1eb8ba40-6312-4093-9b47-7786320b11fb_transmissions.xml";

const HEADER: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<DataSet xmlns="http://tempuri.org/">
  <xs:schema id="NewDataSet" xmlns="" xmlns:xs="http://www.w3.org/2001/XMLSchema" xmlns:msdata="urn:schemas-microsoft-com:xml-msdata">
    <xs:element name="NewDataSet" msdata:IsDataSet="true" msdata:UseCurrentLocale="true" />
  </xs:schema>
  <diffgr:diffgram xmlns:msdata="urn:schemas-microsoft-com:xml-msdata" xmlns:diffgr="urn:schemas-microsoft-com:xml-diffgram-v1">"#;

pub const DATA_POINTS_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<DataSet xmlns="http://tempuri.org/">
  <xs:schema id="NewDataSet" xmlns="" xmlns:xs="http://www.w3.org/2001/XMLSchema" xmlns:msdata="urn:schemas-microsoft-com:xml-msdata">
    <xs:element name="NewDataSet" msdata:IsDataSet="true" msdata:UseCurrentLocale="true" />
  </xs:schema>
  <diffgr:diffgram xmlns:msdata="urn:schemas-microsoft-com:xml-msdata" xmlns:diffgr="urn:schemas-microsoft-com:xml-diffgram-v1">
    <NewDataSet xmlns="">
      <Table diffgr:id="Table1" msdata:rowOrder="0">
        <AtsSerialNum>052194</AtsSerialNum>
        <Longitude>-68.52625</Longitude>
        <Latitude>5.52827</Latitude>
        <DateYearAndJulian>2024-05-31T00:00:00</DateYearAndJulian>
        <NumSats>08</NumSats>
        <Hdop>0.9</Hdop>
        <FixTime>039</FixTime>
        <Dimension>3</Dimension>
        <Activity>02</Activity>
        <Temperature>+24</Temperature>
        <Mortality>false</Mortality>
        <LowBattVoltage>false</LowBattVoltage>
      </Table>
      <Table diffgr:id="Table2" msdata:rowOrder="1">
        <AtsSerialNum>052194</AtsSerialNum>
        <Longitude>-68.52596</Longitude>
        <Latitude>5.52827</Latitude>
        <DateYearAndJulian>2024-05-31T08:00:00</DateYearAndJulian>
        <NumSats>10</NumSats>
        <Hdop>0.8</Hdop>
        <FixTime>039</FixTime>
        <Dimension>3</Dimension>
        <Activity>02</Activity>
        <Temperature>+24</Temperature>
        <Mortality>false</Mortality>
        <LowBattVoltage>false</LowBattVoltage>
      </Table>
      <Table diffgr:id="Table3" msdata:rowOrder="2">
        <AtsSerialNum>052191</AtsSerialNum>
        <Longitude>-68.26540</Longitude>
        <Latitude>5.44309</Latitude>
        <DateYearAndJulian>2024-10-26T16:00:00</DateYearAndJulian>
        <NumSats>07</NumSats>
        <Hdop>1.1</Hdop>
        <FixTime>039</FixTime>
        <Dimension>3</Dimension>
        <Activity>00</Activity>
        <Temperature>+28</Temperature>
        <Mortality>true</Mortality>
        <LowBattVoltage>false</LowBattVoltage>
      </Table>
    </NewDataSet>
  </diffgr:diffgram>
</DataSet>"#;

pub const DATA_POINTS_SINGLE_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<DataSet xmlns="http://tempuri.org/">
  <diffgr:diffgram xmlns:msdata="urn:schemas-microsoft-com:xml-msdata" xmlns:diffgr="urn:schemas-microsoft-com:xml-diffgram-v1">
    <NewDataSet xmlns="">
      <Table diffgr:id="Table1" msdata:rowOrder="0">
        <AtsSerialNum>052194</AtsSerialNum>
        <Longitude>-68.52625</Longitude>
        <Latitude>5.52827</Latitude>
        <DateYearAndJulian>2024-05-31T00:00:00</DateYearAndJulian>
        <NumSats>08</NumSats>
        <Hdop>0.9</Hdop>
        <FixTime>039</FixTime>
        <Dimension>3</Dimension>
        <Activity>02</Activity>
        <Temperature>+24</Temperature>
        <Mortality>false</Mortality>
        <LowBattVoltage>false</LowBattVoltage>
      </Table>
    </NewDataSet>
  </diffgr:diffgram>
</DataSet>"#;

pub const DATA_POINTS_EMPTY_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<DataSet xmlns="http://tempuri.org/">
  <diffgr:diffgram xmlns:msdata="urn:schemas-microsoft-com:xml-msdata" xmlns:diffgr="urn:schemas-microsoft-com:xml-diffgram-v1">
    <NewDataSet xmlns="" />
  </diffgr:diffgram>
</DataSet>"#;

pub const DATA_POINTS_INVALID_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<DataSet xmlns="http://tempuri.org/">
  <diffgr:diffgram xmlns:msdata="urn:schemas-microsoft-com:xml-msdata" xmlns:diffgr="urn:schemas-microsoft-com:xml-diffgram-v1">
    <NewDataSet xmlns="">
      <Table diffgr:id="Table1" msdata:rowOrder="0">
        <AtsSerialNum>052194</AtsSerialNum>
        <Longitude>-68.52625</Latitude>
      </Table>
    </NewDataSet>
  </diffgr:diffgram>
</DataSet>"#;

pub const TRANSMISSIONS_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<DataSet xmlns="http://tempuri.org/">
  <diffgr:diffgram xmlns:msdata="urn:schemas-microsoft-com:xml-msdata" xmlns:diffgr="urn:schemas-microsoft-com:xml-diffgram-v1">
    <NewDataSet xmlns="">
      <Table diffgr:id="Table1" msdata:rowOrder="0">
        <DateSent>2024-10-26T23:12:10.74+00:00</DateSent>
        <CollarSerialNum>052191</CollarSerialNum>
        <NumberFixes>21</NumberFixes>
        <BattVoltage>7.056</BattVoltage>
        <Mortality>THIS COLLAR IS IN MORTALITY !!</Mortality>
        <BreakOff>No</BreakOff>
        <SatErrors>0</SatErrors>
        <YearBase>24</YearBase>
        <DayBase>294</DayBase>
        <GmtOffset>0</GmtOffset>
        <LowBattVoltage>false</LowBattVoltage>
      </Table>
      <Table diffgr:id="Table2" msdata:rowOrder="1">
        <DateSent>2024-08-07T11:12:22.43+00:00</DateSent>
        <CollarSerialNum>052194</CollarSerialNum>
        <NumberFixes>9</NumberFixes>
        <BattVoltage>6.984</BattVoltage>
        <Mortality>No</Mortality>
        <BreakOff>No</BreakOff>
        <SatErrors>7</SatErrors>
        <YearBase>24</YearBase>
        <DayBase>217</DayBase>
        <GmtOffset>3</GmtOffset>
        <LowBattVoltage>false</LowBattVoltage>
      </Table>
    </NewDataSet>
  </diffgr:diffgram>
</DataSet>"#;

pub const TRANSMISSIONS_INVALID_OFFSETS_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<DataSet xmlns="http://tempuri.org/">
  <diffgr:diffgram xmlns:msdata="urn:schemas-microsoft-com:xml-msdata" xmlns:diffgr="urn:schemas-microsoft-com:xml-diffgram-v1">
    <NewDataSet xmlns="">
      <Table diffgr:id="Table1" msdata:rowOrder="0">
        <DateSent>2024-10-26T23:12:10.74+00:00</DateSent>
        <CollarSerialNum>052191</CollarSerialNum>
        <GmtOffset>25</GmtOffset>
      </Table>
      <Table diffgr:id="Table2" msdata:rowOrder="1">
        <DateSent>2024-08-07T11:12:22.43+00:00</DateSent>
        <CollarSerialNum>052194</CollarSerialNum>
        <GmtOffset>-25</GmtOffset>
      </Table>
    </NewDataSet>
  </diffgr:diffgram>
</DataSet>"#;

pub const TRANSMISSIONS_SINGLE_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<DataSet xmlns="http://tempuri.org/">
  <diffgr:diffgram xmlns:msdata="urn:schemas-microsoft-com:xml-msdata" xmlns:diffgr="urn:schemas-microsoft-com:xml-diffgram-v1">
    <NewDataSet xmlns="">
      <Table diffgr:id="Table1" msdata:rowOrder="0">
        <DateSent>2024-10-26T23:12:10.74+00:00</DateSent>
        <CollarSerialNum>052191</CollarSerialNum>
        <GmtOffset>0</GmtOffset>
      </Table>
    </NewDataSet>
  </diffgr:diffgram>
</DataSet>"#;

pub const TRANSMISSIONS_EMPTY_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<DataSet xmlns="http://tempuri.org/">
  <diffgr:diffgram xmlns:msdata="urn:schemas-microsoft-com:xml-msdata" xmlns:diffgr="urn:schemas-microsoft-com:xml-diffgram-v1" />
</DataSet>"#;

/// Builds a data points document with `rows` fixes for one device.
pub fn data_points_xml(serial_num: &str, rows: usize) -> String {
    let mut xml = String::from(HEADER);
    xml.push_str("<NewDataSet xmlns=\"\">");
    for i in 0..rows {
        xml.push_str(&format!(
            "<Table><AtsSerialNum>{serial_num}</AtsSerialNum><Longitude>-68.5</Longitude>\
             <Latitude>5.5</Latitude><DateYearAndJulian>2024-05-31T{:02}:00:00</DateYearAndJulian></Table>",
            i % 24
        ));
    }
    xml.push_str("</NewDataSet></diffgr:diffgram></DataSet>");
    xml
}

/// Records every batch instead of sending it.
#[derive(Default)]
pub struct RecordingSender {
    batches: Mutex<Vec<(String, Vec<NormalizedObservation>)>>,
    fail_after: Option<usize>,
}

impl RecordingSender {
    /// Accepts `batches` batches, then fails every following send.
    pub fn failing_after(batches: usize) -> Self {
        RecordingSender {
            batches: Mutex::new(Vec::new()),
            fail_after: Some(batches),
        }
    }

    pub fn batches(&self) -> Vec<(String, Vec<NormalizedObservation>)> {
        self.batches.lock().clone()
    }

    pub fn observations(&self) -> Vec<NormalizedObservation> {
        self.batches
            .lock()
            .iter()
            .flat_map(|(_, batch)| batch.clone())
            .collect()
    }
}

#[async_trait]
impl ObservationSender for RecordingSender {
    async fn send(
        &self,
        integration_id: &str,
        batch: &[NormalizedObservation],
    ) -> Result<(), SenderError> {
        let mut batches = self.batches.lock();
        if self.fail_after.is_some_and(|limit| batches.len() >= limit) {
            return Err(SenderError::Rejected {
                status: 500,
                body: "unavailable".into(),
            });
        }
        batches.push((integration_id.to_string(), batch.to_vec()));
        Ok(())
    }
}

/// In-memory stores, sender and activity log wired into a processor.
pub struct TestServices {
    pub blobs: Arc<MemoryBlobStore>,
    pub groups: Arc<MemoryGroupStore>,
    pub sender: Arc<RecordingSender>,
    pub activity: ActivityLog,
    pub lifecycle: Lifecycle,
    pub processor: Processor,
}

impl TestServices {
    pub fn new(batch_size: usize) -> Self {
        Self::with_sender(batch_size, RecordingSender::default())
    }

    pub fn with_sender(batch_size: usize, sender: RecordingSender) -> Self {
        let blobs = Arc::new(MemoryBlobStore::default());
        let groups = Arc::new(MemoryGroupStore::default());
        let sender = Arc::new(sender);
        let activity = ActivityLog::default();
        let lifecycle = Lifecycle::new(
            groups.clone() as Arc<dyn GroupStore>,
            blobs.clone() as Arc<dyn BlobStore>,
        );
        let processor = Processor::new(
            lifecycle.clone(),
            blobs.clone() as Arc<dyn BlobStore>,
            sender.clone() as Arc<dyn ObservationSender>,
            activity.clone(),
            batch_size,
        );

        TestServices {
            blobs,
            groups,
            sender,
            activity,
            lifecycle,
            processor,
        }
    }

    /// Stores a data points file and its companion, and registers the data file as pending.
    pub async fn seed(&self, data_file: &str, data_xml: &str, transmissions_xml: Option<&str>) {
        let name: crate::types::FileName = data_file.parse().unwrap();
        let integration_id = name.integration_id();
        self.blobs
            .put(integration_id, data_file, data_xml.as_bytes().to_vec().into(), Default::default())
            .await
            .unwrap();
        if let Some(xml) = transmissions_xml {
            self.blobs
                .put(
                    integration_id,
                    &name.companion().to_string(),
                    xml.as_bytes().to_vec().into(),
                    Default::default(),
                )
                .await
                .unwrap();
        }
        self.lifecycle.register_pending(data_file).await.unwrap();
    }
}

/// Config with in-memory stores and one integration, `INTEGRATION_ID`.
pub fn test_config() -> Config {
    serde_yaml::from_str(&format!(
        r#"
blob_store:
  type: memory
group_store:
  type: memory
sender:
  url: http://127.0.0.1:9000/v2/observations/
  api_key: secret
integrations:
  - id: {INTEGRATION_ID}
    username: ats-user
    password: ats-password
    data_endpoint: http://127.0.0.1:9001/data
    transmissions_endpoint: http://127.0.0.1:9001/transmissions
"#
    ))
    .unwrap()
}
