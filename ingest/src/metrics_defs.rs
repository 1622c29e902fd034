//! Metrics definitions for collar ingestion.

use shared::metrics_defs::{MetricDef, MetricType};

pub const FILES_RETRIEVED: MetricDef = MetricDef {
    name: "ingest.files.retrieved",
    metric_type: MetricType::Counter,
    description: "Number of data points files pulled from the vendor and stored",
};

pub const FILES_CLAIMED: MetricDef = MetricDef {
    name: "ingest.files.claimed",
    metric_type: MetricType::Counter,
    description: "Number of pending files claimed for processing",
};

pub const FILES_CLAIM_SKIPPED: MetricDef = MetricDef {
    name: "ingest.files.claim_skipped",
    metric_type: MetricType::Counter,
    description: "Number of claims that found the file no longer pending",
};

pub const FILES_FINALIZED: MetricDef = MetricDef {
    name: "ingest.files.finalized",
    metric_type: MetricType::Counter,
    description: "Number of files moved to processed",
};

pub const FILES_FAILED: MetricDef = MetricDef {
    name: "ingest.files.failed",
    metric_type: MetricType::Counter,
    description: "Number of claimed files whose processing failed",
};

pub const OBSERVATIONS_SENT: MetricDef = MetricDef {
    name: "ingest.observations.sent",
    metric_type: MetricType::Counter,
    description: "Number of observations accepted by the downstream platform",
};

pub const INVALID_GMT_OFFSETS: MetricDef = MetricDef {
    name: "ingest.transmissions.invalid_offset",
    metric_type: MetricType::Counter,
    description: "Number of devices whose reported GMT offset was rejected",
};

pub const FILE_PROCESSING_DURATION: MetricDef = MetricDef {
    name: "ingest.file.duration",
    metric_type: MetricType::Histogram,
    description: "Time to process one claimed file in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[
    FILES_RETRIEVED,
    FILES_CLAIMED,
    FILES_CLAIM_SKIPPED,
    FILES_FINALIZED,
    FILES_FAILED,
    OBSERVATIONS_SENT,
    INVALID_GMT_OFFSETS,
    FILE_PROCESSING_DURATION,
];
