//! Metrics module
//!
//! Prometheus counters for the spool pipeline, exposed by [`server`].

pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec,
    register_int_gauge, Counter, CounterVec, Histogram, HistogramVec, IntGauge,
};

lazy_static! {
    // Buffer metrics
    pub static ref BYTES_BUFFERED_TOTAL: Counter = register_counter!(
        "mizuchi_spool_bytes_buffered_total",
        "Total bytes written to local buffer files"
    ).unwrap();

    pub static ref OPEN_BUFFER_FILES: IntGauge = register_int_gauge!(
        "mizuchi_spool_open_buffer_files",
        "Buffer files currently open for writing"
    ).unwrap();

    pub static ref ROTATIONS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_spool_rotations_total",
        "Buffer files closed for upload",
        &["trigger"]  // "write", "periodic" or "close"
    ).unwrap();

    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_spool_uploads_total",
        "Total number of uploads",
        &["pool", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "mizuchi_spool_upload_bytes_total",
        "Total bytes uploaded"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "mizuchi_spool_upload_duration_seconds",
        "Upload duration in seconds",
        &["method"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    pub static ref CALLER_RUNS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_spool_caller_runs_total",
        "Uploads run on the submitting task because the queue was full",
        &["pool"]
    ).unwrap();

    // Multipart metrics
    pub static ref MULTIPART_UPLOADS: CounterVec = register_counter_vec!(
        "mizuchi_spool_multipart_uploads_total",
        "Total multipart uploads",
        &["status"]
    ).unwrap();

    pub static ref MULTIPART_PARTS: Histogram = register_histogram!(
        "mizuchi_spool_multipart_parts",
        "Number of parts per multipart upload",
        vec![1.0, 2.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    ).unwrap();

    // Recovery metrics
    pub static ref RECOVERED_FILES_TOTAL: Counter = register_counter!(
        "mizuchi_spool_recovered_files_total",
        "Orphaned buffer files found at startup"
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_spool_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record bytes appended to a buffer file
pub fn record_buffered(bytes: u64) {
    BYTES_BUFFERED_TOTAL.inc_by(bytes as f64);
}

pub fn set_open_buffer_files(count: usize) {
    OPEN_BUFFER_FILES.set(count as i64);
}

/// Record a buffer file being closed and handed to the uploader
pub fn record_rotation(trigger: &str) {
    ROTATIONS_TOTAL.with_label_values(&[trigger]).inc();
}

/// Record a successful upload
pub fn record_upload_success(pool: &str, bytes: u64) {
    UPLOADS_TOTAL.with_label_values(&[pool, "success"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a failed upload
pub fn record_upload_failure(pool: &str) {
    UPLOADS_TOTAL.with_label_values(&[pool, "failure"]).inc();
}

/// Record upload duration
pub fn record_upload_duration(method: &str, duration_secs: f64) {
    UPLOAD_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

pub fn record_caller_runs(pool: &str) {
    CALLER_RUNS_TOTAL.with_label_values(&[pool]).inc();
}

/// Record a successful multipart upload
pub fn record_multipart_upload_success(parts_count: usize) {
    MULTIPART_UPLOADS.with_label_values(&["success"]).inc();
    MULTIPART_PARTS.observe(parts_count as f64);
}

/// Record a failed multipart upload
pub fn record_multipart_upload_failure() {
    MULTIPART_UPLOADS.with_label_values(&["failure"]).inc();
}

pub fn record_recovered_files(count: usize) {
    RECOVERED_FILES_TOTAL.inc_by(count as f64);
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}
