//! The [`Packet`] type: a single waveform fragment carrying samples from one
//! channel over `[start_time, end_time]`, plus the typed sample array it
//! carries and the errors its accessors can raise.

use compact_str::CompactString;
use time::OffsetDateTime;

/// Microsecond-resolution timestamp since the Unix epoch. Matches the
/// resolution the original packet format stores start/end times at.
pub type Timestamp = i64;

pub const MICROS_PER_SECOND: i64 = 1_000_000;

pub fn timestamp_from_seconds(seconds: f64) -> Timestamp {
    (seconds * MICROS_PER_SECOND as f64).round() as Timestamp
}

pub fn timestamp_to_offset_date_time(t: Timestamp) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(t as i128 * 1_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Strips interior and exterior whitespace and uppercases, matching the
/// normalization every station/network/channel identifier goes through
/// before being stored or compared.
pub fn normalize_identifier(raw: &str) -> CompactString {
    let stripped: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    CompactString::from(stripped.to_uppercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer32,
    Integer64,
    Float,
    Double,
    Text,
}

impl DataType {
    /// The one-character tag used on the wire and in the stored row.
    pub fn tag(self) -> char {
        match self {
            DataType::Integer32 => 'i',
            DataType::Integer64 => 'l',
            DataType::Float => 'f',
            DataType::Double => 'd',
            DataType::Text => 't',
        }
    }

    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'i' => Some(DataType::Integer32),
            'l' => Some(DataType::Integer64),
            'f' => Some(DataType::Float),
            'd' => Some(DataType::Double),
            't' => Some(DataType::Text),
            _ => None,
        }
    }
}

/// Owned, typed sample storage. A packet carries exactly one of these at a
/// time; setting new data replaces whichever variant was there before.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum SampleArray {
    Empty,
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Text(Vec<u8>),
}

/// Bitwise comparison for tests: `SampleArray` deliberately has no
/// `PartialEq` impl since the F32/F64 variants carry floats, where
/// equality is rarely the comparison a caller actually wants. Exposed
/// (rather than `#[cfg(test)]`) so downstream crates' tests can use it too.
pub fn samples_bitwise_eq(a: &SampleArray, b: &SampleArray) -> bool {
    match (a, b) {
        (SampleArray::Empty, SampleArray::Empty) => true,
        (SampleArray::I32(a), SampleArray::I32(b)) => a == b,
        (SampleArray::I64(a), SampleArray::I64(b)) => a == b,
        (SampleArray::F32(a), SampleArray::F32(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
        }
        (SampleArray::F64(a), SampleArray::F64(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
        }
        (SampleArray::Text(a), SampleArray::Text(b)) => a == b,
        _ => false,
    }
}

impl SampleArray {
    pub fn len(&self) -> usize {
        match self {
            SampleArray::Empty => 0,
            SampleArray::I32(v) => v.len(),
            SampleArray::I64(v) => v.len(),
            SampleArray::F32(v) => v.len(),
            SampleArray::F64(v) => v.len(),
            SampleArray::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            SampleArray::Empty => None,
            SampleArray::I32(_) => Some(DataType::Integer32),
            SampleArray::I64(_) => Some(DataType::Integer64),
            SampleArray::F32(_) => Some(DataType::Float),
            SampleArray::F64(_) => Some(DataType::Double),
            SampleArray::Text(_) => Some(DataType::Text),
        }
    }

    pub fn view(&self) -> SampleSlice<'_> {
        match self {
            SampleArray::Empty => SampleSlice::Empty,
            SampleArray::I32(v) => SampleSlice::I32(v),
            SampleArray::I64(v) => SampleSlice::I64(v),
            SampleArray::F32(v) => SampleSlice::F32(v),
            SampleArray::F64(v) => SampleSlice::F64(v),
            SampleArray::Text(v) => SampleSlice::Text(v),
        }
    }
}

/// Borrowed mirror of [`SampleArray`], used internally by the codec and
/// export layers so encoding a packet's samples never needs to clone them.
#[derive(Debug, Clone, Copy)]
pub enum SampleSlice<'a> {
    Empty,
    I32(&'a [i32]),
    I64(&'a [i64]),
    F32(&'a [f32]),
    F64(&'a [f64]),
    Text(&'a [u8]),
}

impl SampleSlice<'_> {
    pub fn len(&self) -> usize {
        match self {
            SampleSlice::Empty => 0,
            SampleSlice::I32(v) => v.len(),
            SampleSlice::I64(v) => v.len(),
            SampleSlice::F32(v) => v.len(),
            SampleSlice::F64(v) => v.len(),
            SampleSlice::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            SampleSlice::Empty => None,
            SampleSlice::I32(_) => Some(DataType::Integer32),
            SampleSlice::I64(_) => Some(DataType::Integer64),
            SampleSlice::F32(_) => Some(DataType::Float),
            SampleSlice::F64(_) => Some(DataType::Double),
            SampleSlice::Text(_) => Some(DataType::Text),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PacketError {
    #[error("sampling rate must be positive")]
    InvalidSamplingRate,
    #[error("start time must be before end time")]
    NonPositiveWindow,
    #[error("sampling rate has not been set")]
    SamplingRateUnset,
    #[error("network has not been set")]
    NetworkUnset,
    #[error("station has not been set")]
    StationUnset,
    #[error("channel has not been set")]
    ChannelUnset,
    #[error("{field} must not be empty after normalization")]
    EmptyIdentifier { field: &'static str },
}

/// A single waveform fragment: identity (network/station/channel/location),
/// timing, sampling rate, and one typed sample array.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Packet {
    network: Option<CompactString>,
    station: Option<CompactString>,
    channel: Option<CompactString>,
    location: Option<CompactString>,
    start_time: Timestamp,
    sampling_rate: f64,
    data: SampleArray,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    pub fn new() -> Self {
        Packet {
            network: None,
            station: None,
            channel: None,
            location: None,
            start_time: 0,
            sampling_rate: 0.0,
            data: SampleArray::Empty,
        }
    }

    pub fn set_network(&mut self, network: &str) -> Result<(), PacketError> {
        let normalized = normalize_identifier(network);
        if normalized.is_empty() {
            return Err(PacketError::EmptyIdentifier { field: "network" });
        }
        self.network = Some(normalized);
        Ok(())
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub fn set_station(&mut self, station: &str) -> Result<(), PacketError> {
        let normalized = normalize_identifier(station);
        if normalized.is_empty() {
            return Err(PacketError::EmptyIdentifier { field: "station" });
        }
        self.station = Some(normalized);
        Ok(())
    }

    pub fn station(&self) -> Option<&str> {
        self.station.as_deref()
    }

    pub fn set_channel(&mut self, channel: &str) -> Result<(), PacketError> {
        let normalized = normalize_identifier(channel);
        if normalized.is_empty() {
            return Err(PacketError::EmptyIdentifier { field: "channel" });
        }
        self.channel = Some(normalized);
        Ok(())
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Location is the one identifier that may be left unset entirely
    /// (`have_location()` stays false); a stream with no location and a
    /// stream with an empty location are the same thing downstream. A
    /// caller that does call this setter gets the same reject-empty rule
    /// as network/station/channel — there is no way to explicitly set an
    /// empty location.
    pub fn set_location(&mut self, location: &str) -> Result<(), PacketError> {
        let normalized = normalize_identifier(location);
        if normalized.is_empty() {
            return Err(PacketError::EmptyIdentifier { field: "location" });
        }
        self.location = Some(normalized);
        Ok(())
    }

    pub fn have_location(&self) -> bool {
        self.location.is_some()
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn set_sampling_rate(&mut self, rate: f64) -> Result<(), PacketError> {
        if rate <= 0.0 {
            return Err(PacketError::InvalidSamplingRate);
        }
        self.sampling_rate = rate;
        Ok(())
    }

    pub fn sampling_rate(&self) -> Option<f64> {
        (self.sampling_rate > 0.0).then_some(self.sampling_rate)
    }

    pub fn set_start_time(&mut self, start_time: Timestamp) {
        self.start_time = start_time;
    }

    pub fn set_start_time_seconds(&mut self, seconds: f64) {
        self.start_time = timestamp_from_seconds(seconds);
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// `start_time + round((n-1)/rate * 1e6)` microseconds, or `start_time`
    /// itself if the packet is empty or the sampling rate is unset.
    pub fn end_time(&self) -> Result<Timestamp, PacketError> {
        let n = self.data.len();
        if n == 0 {
            return Ok(self.start_time);
        }
        let rate = self
            .sampling_rate()
            .ok_or(PacketError::SamplingRateUnset)?;
        let duration_us = (((n - 1) as f64) / rate * 1_000_000.0).round() as i64;
        Ok(self.start_time + duration_us)
    }

    pub fn set_data(&mut self, data: SampleArray) {
        self.data = data;
    }

    pub fn data(&self) -> &SampleArray {
        &self.data
    }

    /// Borrowed view over the active sample variant; prefer this over
    /// [`Packet::data`] at encode/export sites that only need to read
    /// samples, so they share one dispatch with callers working off a
    /// bare [`SampleArray`].
    pub fn view(&self) -> SampleSlice<'_> {
        self.data.view()
    }

    /// The one-character wire/row tag for the active sample variant, or
    /// `None` if no data has been set (the `Unknown` state of Design Note §9).
    pub fn data_type_tag(&self) -> Option<char> {
        self.data.data_type().map(DataType::tag)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn clear_data(&mut self) {
        self.data = SampleArray::Empty;
    }

    /// Clips the packet to `[start, end)`. No-op if the sampling rate is
    /// unset or the packet is empty; clears entirely if the window is
    /// disjoint from the packet's own span.
    pub fn trim(&mut self, start: Timestamp, end: Timestamp) -> Result<(), PacketError> {
        if start >= end {
            return Err(PacketError::NonPositiveWindow);
        }
        let Some(rate) = self.sampling_rate() else {
            return Ok(());
        };
        if self.is_empty() {
            return Ok(());
        }
        let current_end = self.end_time()?;
        if self.start_time >= start && current_end <= end {
            return Ok(());
        }
        if start > current_end || end < self.start_time {
            self.clear_data();
            return Ok(());
        }

        let n = self.len() as i64;
        let sampling_period_us = (1_000_000.0 / rate).round();

        let mut i_start = 0i64;
        if self.start_time < start {
            let delta = (start - self.start_time) as f64;
            i_start = (delta / sampling_period_us).floor() as i64;
            i_start = i_start.clamp(0, n - 1);
        }

        let mut i_end = n;
        if current_end > end {
            let delta = (end - self.start_time) as f64;
            i_end = (delta / sampling_period_us).ceil() as i64 + 1;
            i_end = i_end.clamp(i_start, n);
        }

        if i_start > 0 || i_end < n {
            if i_start < i_end {
                self.data = slice_samples(&self.data, i_start as usize, i_end as usize);
            } else {
                self.clear_data();
            }
            if i_start > 0 {
                let period_us = sampling_period_us as i64;
                self.start_time += i_start * period_us;
            }
        }
        Ok(())
    }
}

fn slice_samples(data: &SampleArray, start: usize, end: usize) -> SampleArray {
    match data {
        SampleArray::Empty => SampleArray::Empty,
        SampleArray::I32(v) => SampleArray::I32(v[start..end].to_vec()),
        SampleArray::I64(v) => SampleArray::I64(v[start..end].to_vec()),
        SampleArray::F32(v) => SampleArray::F32(v[start..end].to_vec()),
        SampleArray::F64(v) => SampleArray::F64(v[start..end].to_vec()),
        SampleArray::Text(v) => SampleArray::Text(v[start..end].to_vec()),
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1, 100.0, 0)]
    #[case(100, 100.0, 990_000)]
    #[case(10, 10.0, 900_000)]
    #[case(1000, 1000.0, 999_000)]
    fn end_time_matches_spec_formula(#[case] n: usize, #[case] rate: f64, #[case] expected_us: i64) {
        let mut p = Packet::new();
        p.set_sampling_rate(rate).unwrap();
        p.set_start_time(0);
        p.set_data(SampleArray::I32((0..n as i32).collect()));
        assert_eq!(p.end_time().unwrap(), expected_us);
    }

    fn sample_packet() -> Packet {
        let mut p = Packet::new();
        p.set_network("iu").unwrap();
        p.set_station(" anmo ").unwrap();
        p.set_channel("bhz").unwrap();
        p.set_sampling_rate(100.0).unwrap();
        p.set_start_time(0);
        p.set_data(SampleArray::I32((0..100).collect()));
        p
    }

    #[test]
    fn identifiers_are_normalized() {
        let p = sample_packet();
        assert_eq!(p.network(), Some("IU"));
        assert_eq!(p.station(), Some("ANMO"));
        assert_eq!(p.channel(), Some("BHZ"));
    }

    #[test]
    fn network_station_channel_reject_blank_input() {
        let mut p = Packet::new();
        assert!(matches!(
            p.set_network("  "),
            Err(PacketError::EmptyIdentifier { field: "network" })
        ));
        assert!(matches!(
            p.set_station(""),
            Err(PacketError::EmptyIdentifier { field: "station" })
        ));
        assert!(matches!(
            p.set_channel("  "),
            Err(PacketError::EmptyIdentifier { field: "channel" })
        ));
        assert_eq!(p.network(), None);
        assert_eq!(p.station(), None);
        assert_eq!(p.channel(), None);
    }

    #[test]
    fn end_time_derives_from_rate_and_count() {
        let p = sample_packet();
        // 100 samples at 100 Hz span 990_000us after the first sample.
        assert_eq!(p.end_time().unwrap(), 990_000);
    }

    #[test]
    fn end_time_without_rate_is_an_error_when_nonempty() {
        let mut p = Packet::new();
        p.set_data(SampleArray::I32(vec![1, 2, 3]));
        assert!(matches!(
            p.end_time(),
            Err(PacketError::SamplingRateUnset)
        ));
    }

    #[test]
    fn trim_inside_window_is_a_noop() {
        let mut p = sample_packet();
        let before = p.len();
        p.trim(-1_000_000, 2_000_000).unwrap();
        assert_eq!(p.len(), before);
    }

    #[test]
    fn trim_disjoint_window_clears() {
        let mut p = sample_packet();
        p.trim(2_000_000, 3_000_000).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn trim_clips_and_shifts_start() {
        let mut p = sample_packet();
        // keep samples starting at 100_000us (sample index 10) onward
        p.trim(100_000, 10_000_000).unwrap();
        assert_eq!(p.start_time(), 100_000);
        assert_eq!(p.len(), 90);
    }

    #[test]
    fn trim_rejects_inverted_window() {
        let mut p = sample_packet();
        assert!(matches!(
            p.trim(10, 5),
            Err(PacketError::NonPositiveWindow)
        ));
    }

    #[test]
    fn unset_location_has_no_value() {
        let p = Packet::new();
        assert!(!p.have_location());
        assert_eq!(p.location(), None);
    }

    #[test]
    fn set_location_rejects_empty_input() {
        let mut p = Packet::new();
        assert!(matches!(
            p.set_location(""),
            Err(PacketError::EmptyIdentifier { field: "location" })
        ));
        assert!(!p.have_location());

        assert!(matches!(
            p.set_location("   "),
            Err(PacketError::EmptyIdentifier { field: "location" })
        ));
        assert!(!p.have_location());
    }

    #[test]
    fn set_location_accepts_and_normalizes_nonempty_input() {
        let mut p = Packet::new();
        p.set_location(" 01 ").unwrap();
        assert_eq!(p.location(), Some("01"));
    }
}
