//! Standard waveform binary record export: a concatenated stream of
//! fixed-size records, one or more per packet, encoded in the widest
//! numeric type present across the packet list.

use std::collections::BTreeMap;
use std::time::Duration;

use itertools::Itertools;
use seismo_common::{Packet, SampleArray, SampleSlice};

pub const DEFAULT_RECORD_SIZE: usize = 512;

/// Default gap tolerance under which two consecutive packets on the same
/// stream are merged into a single trace before being split into records.
pub const DEFAULT_TRACE_MERGE_TOLERANCE: Duration = Duration::from_millis(1);

const NAME_FIELD_LEN: usize = 8;
/// network + station + channel + location + start_time_ns + sampling_rate
/// + n_samples + data_type tag + reserved.
const HEADER_LEN: usize = NAME_FIELD_LEN * 4 + 8 + 8 + 4 + 1 + 3;

#[derive(Debug, thiserror::Error)]
pub enum WaveformExportError {
    #[error("record size {0} is too small to hold the record header ({HEADER_LEN} bytes)")]
    RecordTooSmall(usize),
    #[error("identifier `{0}` exceeds the {NAME_FIELD_LEN}-byte field width")]
    IdentifierTooLong(String),
}

/// The widest numeric encoding selected across a packet list. Int64 samples
/// are always widened to float64 on export; there is no standalone int64
/// wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExportType {
    Int32,
    Float32,
    Float64,
}

impl ExportType {
    fn tag(self) -> char {
        match self {
            ExportType::Int32 => 'i',
            ExportType::Float32 => 'f',
            ExportType::Float64 => 'd',
        }
    }

    fn sample_width(self) -> usize {
        match self {
            ExportType::Int32 => 4,
            ExportType::Float32 => 4,
            ExportType::Float64 => 8,
        }
    }
}

fn widest_type(packets: &[Packet]) -> ExportType {
    let mut widest = ExportType::Int32;
    for p in packets {
        let candidate = match p.view() {
            SampleSlice::F64(_) | SampleSlice::I64(_) => ExportType::Float64,
            SampleSlice::F32(_) => ExportType::Float32,
            SampleSlice::I32(_) | SampleSlice::Empty | SampleSlice::Text(_) => ExportType::Int32,
        };
        if candidate == ExportType::Float64 {
            return ExportType::Float64;
        }
        if candidate == ExportType::Float32 && widest == ExportType::Int32 {
            widest = ExportType::Float32;
        }
    }
    widest
}

fn widen(data: SampleSlice<'_>, export_type: ExportType) -> Vec<u8> {
    match export_type {
        ExportType::Int32 => match data {
            SampleSlice::I32(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
            _ => Vec::new(),
        },
        ExportType::Float32 => match data {
            SampleSlice::F32(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
            SampleSlice::I32(v) => v.iter().flat_map(|s| (*s as f32).to_le_bytes()).collect(),
            _ => Vec::new(),
        },
        ExportType::Float64 => match data {
            SampleSlice::F64(v) => v.iter().flat_map(|s| s.to_le_bytes()).collect(),
            SampleSlice::I64(v) => v.iter().flat_map(|s| (*s as f64).to_le_bytes()).collect(),
            SampleSlice::F32(v) => v
                .iter()
                .flat_map(|s| (*s as f64).to_le_bytes())
                .collect(),
            SampleSlice::I32(v) => v
                .iter()
                .flat_map(|s| (*s as f64).to_le_bytes())
                .collect(),
            SampleSlice::Empty | SampleSlice::Text(_) => Vec::new(),
        },
    }
}

fn pack_name_field(name: &str) -> Result<[u8; NAME_FIELD_LEN], WaveformExportError> {
    if name.len() > NAME_FIELD_LEN {
        return Err(WaveformExportError::IdentifierTooLong(name.to_string()));
    }
    let mut field = [0u8; NAME_FIELD_LEN];
    field[..name.len()].copy_from_slice(name.as_bytes());
    Ok(field)
}

/// Groups `packets` by canonical stream identity and merges consecutive,
/// same-rate, same-type packets whose gap (`next.start - prev.end`) is
/// within `tolerance` into a single trace, concatenating their sample
/// arrays. Packets that can't be merged (different type, different rate, or
/// too large a gap) pass through unchanged. Grounded in spec.md §4.H:
/// "Records for the same stream are merged into a trace list under a
/// configurable time tolerance."
pub fn merge_traces(packets: &[Packet], tolerance: Duration) -> Vec<Packet> {
    let tolerance_us = tolerance.as_micros() as i64;

    let mut by_stream: BTreeMap<(String, String, String, String), Vec<&Packet>> = BTreeMap::new();
    for p in packets {
        let key = (
            p.network().unwrap_or_default().to_string(),
            p.station().unwrap_or_default().to_string(),
            p.channel().unwrap_or_default().to_string(),
            p.location().unwrap_or_default().to_string(),
        );
        by_stream.entry(key).or_default().push(p);
    }

    let mut out = Vec::with_capacity(packets.len());
    for (_, mut group) in by_stream {
        group.sort_by_key(|p| p.start_time());
        let merged = group
            .into_iter()
            .map(|p| p.clone())
            .coalesce(|a, b| merge_pair(a, b, tolerance_us));
        out.extend(merged);
    }
    out
}

/// Merges `b` into `a` when they share a sampling rate and sample type and
/// `b`'s start lies within `tolerance_us` of where `a`'s next sample would
/// fall (`a.end + one sample period`); otherwise returns both unchanged, as
/// [`Itertools::coalesce`] expects.
fn merge_pair(mut a: Packet, b: Packet, tolerance_us: i64) -> Result<Packet, (Packet, Packet)> {
    let (Some(rate_a), Some(rate_b)) = (a.sampling_rate(), b.sampling_rate()) else {
        return Err((a, b));
    };
    if rate_a != rate_b {
        return Err((a, b));
    }
    let Ok(end_a) = a.end_time() else {
        return Err((a, b));
    };
    let period_us = (1_000_000.0 / rate_a).round() as i64;
    let expected_next_start = end_a + period_us;
    if (b.start_time() - expected_next_start).abs() > tolerance_us {
        return Err((a, b));
    }
    match concat_samples(a.data(), b.data()) {
        Some(merged) => {
            a.set_data(merged);
            Ok(a)
        }
        None => Err((a, b)),
    }
}

fn concat_samples(a: &SampleArray, b: &SampleArray) -> Option<SampleArray> {
    match (a, b) {
        (SampleArray::I32(x), SampleArray::I32(y)) => {
            Some(SampleArray::I32(x.iter().chain(y).copied().collect()))
        }
        (SampleArray::I64(x), SampleArray::I64(y)) => {
            Some(SampleArray::I64(x.iter().chain(y).copied().collect()))
        }
        (SampleArray::F32(x), SampleArray::F32(y)) => {
            Some(SampleArray::F32(x.iter().chain(y).copied().collect()))
        }
        (SampleArray::F64(x), SampleArray::F64(y)) => {
            Some(SampleArray::F64(x.iter().chain(y).copied().collect()))
        }
        _ => None,
    }
}

/// Produces the concatenated record stream for `packets`, first merging
/// same-stream traces under `merge_tolerance` (§4.H), then splitting any
/// packet whose encoded payload would overflow one record into several
/// consecutive records sharing its identity and sample-type tag.
pub fn write_records(
    packets: &[Packet],
    record_size: usize,
    merge_tolerance: Duration,
) -> Result<Vec<u8>, WaveformExportError> {
    if record_size < HEADER_LEN {
        return Err(WaveformExportError::RecordTooSmall(record_size));
    }
    let merged = merge_traces(packets, merge_tolerance);
    let packets = &merged[..];
    let export_type = widest_type(packets);
    let payload_capacity = record_size - HEADER_LEN;
    let samples_per_record = (payload_capacity / export_type.sample_width()).max(1);

    let mut out = Vec::with_capacity(packets.len() * record_size);
    for packet in packets {
        let network = pack_name_field(packet.network().unwrap_or_default())?;
        let station = pack_name_field(packet.station().unwrap_or_default())?;
        let channel = pack_name_field(packet.channel().unwrap_or_default())?;
        let location_raw = packet.location().unwrap_or_default();
        let location_tag = if location_raw.is_empty() {
            "--"
        } else {
            location_raw
        };
        let location = pack_name_field(location_tag)?;

        let widened = widen(packet.view(), export_type);
        let n_total = packet.len();
        let rate = packet.sampling_rate().unwrap_or(0.0);
        let start_ns = packet.start_time().saturating_mul(1_000);
        let period_ns = if rate > 0.0 {
            (1_000_000_000.0 / rate).round() as i64
        } else {
            0
        };

        if n_total == 0 {
            out.extend(build_record(
                record_size,
                &network,
                &station,
                &channel,
                &location,
                start_ns,
                rate,
                0,
                export_type,
                &[],
            ));
            continue;
        }

        let mut offset = 0usize;
        let mut sample_index = 0usize;
        let sample_width = export_type.sample_width();
        while sample_index < n_total {
            let n_this = samples_per_record.min(n_total - sample_index);
            let byte_len = n_this * sample_width;
            let chunk = &widened[offset..offset + byte_len];
            let record_start_ns = start_ns + (sample_index as i64) * period_ns;
            out.extend(build_record(
                record_size,
                &network,
                &station,
                &channel,
                &location,
                record_start_ns,
                rate,
                n_this as u32,
                export_type,
                chunk,
            ));
            offset += byte_len;
            sample_index += n_this;
        }
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    record_size: usize,
    network: &[u8; NAME_FIELD_LEN],
    station: &[u8; NAME_FIELD_LEN],
    channel: &[u8; NAME_FIELD_LEN],
    location: &[u8; NAME_FIELD_LEN],
    start_ns: i64,
    sampling_rate: f64,
    n_samples: u32,
    export_type: ExportType,
    payload: &[u8],
) -> Vec<u8> {
    let mut record = vec![0u8; record_size];
    let mut pos = 0;
    for field in [network, station, channel, location] {
        record[pos..pos + NAME_FIELD_LEN].copy_from_slice(field);
        pos += NAME_FIELD_LEN;
    }
    record[pos..pos + 8].copy_from_slice(&start_ns.to_le_bytes());
    pos += 8;
    record[pos..pos + 8].copy_from_slice(&sampling_rate.to_le_bytes());
    pos += 8;
    record[pos..pos + 4].copy_from_slice(&n_samples.to_le_bytes());
    pos += 4;
    record[pos] = export_type.tag() as u8;
    pos += 1 + 3; // skip reserved bytes
    record[pos..pos + payload.len()].copy_from_slice(payload);
    record
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use seismo_common::SampleArray;

    use super::*;

    #[rstest]
    #[case(1)]
    #[case(10)]
    #[case(500)]
    #[case(10_000)]
    fn record_stream_is_always_a_multiple_of_record_size(#[case] n: usize) {
        let packets = vec![packet(n)];
        let bytes = write_records(&packets, DEFAULT_RECORD_SIZE, DEFAULT_TRACE_MERGE_TOLERANCE).unwrap();
        assert_eq!(bytes.len() % DEFAULT_RECORD_SIZE, 0);
        assert!(!bytes.is_empty());
    }

    fn packet(n: usize) -> Packet {
        let mut p = Packet::new();
        p.set_network("IU").unwrap();
        p.set_station("ANMO").unwrap();
        p.set_channel("BHZ").unwrap();
        p.set_sampling_rate(100.0).unwrap();
        p.set_start_time(0);
        p.set_data(SampleArray::I32((0..n as i32).collect()));
        p
    }

    #[test]
    fn single_small_packet_is_one_record() {
        let packets = vec![packet(10)];
        let bytes = write_records(&packets, DEFAULT_RECORD_SIZE, DEFAULT_TRACE_MERGE_TOLERANCE).unwrap();
        assert_eq!(bytes.len(), DEFAULT_RECORD_SIZE);
        assert_eq!(bytes[HEADER_LEN - 4] as char, 'i');
    }

    #[test]
    fn oversized_packet_splits_into_multiple_records() {
        let packets = vec![packet(10_000)];
        let bytes = write_records(&packets, DEFAULT_RECORD_SIZE, DEFAULT_TRACE_MERGE_TOLERANCE).unwrap();
        assert_eq!(bytes.len() % DEFAULT_RECORD_SIZE, 0);
        assert!(bytes.len() / DEFAULT_RECORD_SIZE > 1);
    }

    #[test]
    fn rejects_record_size_smaller_than_header() {
        let packets = vec![packet(1)];
        let err = write_records(&packets, 8, DEFAULT_TRACE_MERGE_TOLERANCE).unwrap_err();
        assert!(matches!(err, WaveformExportError::RecordTooSmall(8)));
    }

    #[test]
    fn identifier_too_long_is_rejected() {
        let mut p = packet(1);
        p.set_network("TOOLONGNETWORKNAME").unwrap();
        let err = write_records(&[p], DEFAULT_RECORD_SIZE, DEFAULT_TRACE_MERGE_TOLERANCE).unwrap_err();
        assert!(matches!(err, WaveformExportError::IdentifierTooLong(_)));
    }

    #[test]
    fn adjacent_packets_within_tolerance_merge_into_one_trace() {
        let mut a = packet(10);
        a.set_start_time(0);
        let mut b = packet(10);
        // a spans samples 0..10 at 100Hz, ending at sample index 9 (90_000us);
        // b starts one sample period later, a contiguous continuation.
        b.set_start_time(100_000);
        let merged = merge_traces(&[a, b], Duration::from_micros(1));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].len(), 20);
        assert_eq!(merged[0].start_time(), 0);
    }

    #[test]
    fn packets_beyond_tolerance_stay_separate() {
        let mut a = packet(10);
        a.set_start_time(0);
        let mut b = packet(10);
        b.set_start_time(10_000_000);
        let merged = merge_traces(&[a, b], Duration::from_micros(1));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn different_streams_never_merge() {
        let mut a = packet(10);
        a.set_start_time(0);
        let mut b = packet(10);
        b.set_station("COLA").unwrap();
        b.set_start_time(100_000);
        let merged = merge_traces(&[a, b], Duration::from_secs(3600));
        assert_eq!(merged.len(), 2);
    }
}
