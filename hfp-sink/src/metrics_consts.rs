// ==== Ingestion metrics ====
/// Counter for records accepted by the message handler and enqueued
pub const RECORDS_ENQUEUED_COUNTER: &str = "hfp_records_enqueued_total";

/// Counter for messages that failed decoding or classification (label: reason)
pub const PARSE_FAILURES_COUNTER: &str = "hfp_parse_failures_total";

/// Gauge for records waiting in the ingestion queue
pub const QUEUE_DEPTH_GAUGE: &str = "hfp_queue_depth";

// ==== Write cycle metrics ====
/// Counter for rows written to bucket files (label: category)
pub const ROWS_WRITTEN_COUNTER: &str = "hfp_rows_written_total";

/// Counter for records skipped by the per-file deduplicator (label: category)
pub const DUPLICATES_SKIPPED_COUNTER: &str = "hfp_duplicates_skipped_total";

/// Counter for records failing a validator, routed to an invalid bucket (label: validator)
pub const INVALID_RECORDS_COUNTER: &str = "hfp_invalid_records_total";

/// Counter for records that could not be written
pub const WRITE_FAULTS_COUNTER: &str = "hfp_write_faults_total";

/// Histogram for the duration of one drain-and-write cycle
pub const WRITE_CYCLE_DURATION_HISTOGRAM: &str = "hfp_write_cycle_duration_seconds";

/// Histogram for the number of records drained per write cycle
pub const WRITE_CYCLE_RECORDS_HISTOGRAM: &str = "hfp_write_cycle_records";

/// Gauge for buckets currently held open in the registry
pub const OPEN_BUCKETS_GAUGE: &str = "hfp_open_buckets";

// ==== Upload metrics ====
/// Counter for bucket uploads (label: result = success/failure, sink)
pub const UPLOADS_COUNTER: &str = "hfp_uploads_total";

/// Histogram for close + upload duration of one bucket
pub const UPLOAD_DURATION_HISTOGRAM: &str = "hfp_upload_duration_seconds";

/// Counter for buckets dropped after their file could not be finalized
pub const DISCARDED_BUCKETS_COUNTER: &str = "hfp_discarded_buckets_total";

/// Gauge for consecutive upload cycles without a single successful upload
pub const EMPTY_UPLOAD_CYCLES_GAUGE: &str = "hfp_empty_upload_cycles";

// ==== Acknowledgement metrics ====
/// Counter for message acknowledgements (label: result = success/failure)
pub const ACKS_COUNTER: &str = "hfp_acks_total";

/// Counter for Kafka offsets stored for commit (label: partition)
pub const OFFSETS_STORED_COUNTER: &str = "hfp_offsets_stored_total";

/// Gauge for the age in seconds of the oldest received but unacknowledged message
pub const OLDEST_PENDING_AGE_GAUGE: &str = "hfp_oldest_pending_age_seconds";

/// Counter for partitions revoked from this consumer
pub const PARTITIONS_REVOKED_COUNTER: &str = "hfp_partitions_revoked_total";

// ==== HTTP metrics ====
/// Counter for requests to the HTTP server, labelled by route and status
pub const HTTP_REQUESTS_COUNTER: &str = "hfp_http_requests_total";

/// Histogram for HTTP request durations in seconds
pub const HTTP_REQUEST_DURATION_HISTOGRAM: &str = "hfp_http_request_duration_seconds";
