pub mod json;
pub mod waveform;

pub use json::{JsonSample, JsonStream, JsonStreamDocument, to_json_document};
pub use waveform::{
    DEFAULT_RECORD_SIZE, DEFAULT_TRACE_MERGE_TOLERANCE, WaveformExportError, merge_traces,
    write_records,
};
