//! Admission filter (§4.G): future/expired threshold tests plus the
//! duplicate/clock-slip test, the "hard one" — a per-stream bounded header
//! buffer that tolerates legitimate backfills while rejecting duplicates and
//! clock-slipped retransmissions.
//!
//! Grounded in `lib/testFuturePacket.cpp`, `lib/testExpiredPacket.cpp`, and
//! `lib/testDuplicatePacket.cpp`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use compact_str::CompactString;
use parking_lot::Mutex;
use seismo_common::{Packet, Timestamp};
use tracing::info;

/// Why a packet was rejected, so the pipeline and the rejection log don't
/// have to re-derive the reason a `bool` would have discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RejectReason {
    Future,
    Expired,
    Duplicate,
    BadTiming,
    Empty,
}

impl RejectReason {
    fn category(self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(RejectReason),
}

impl Decision {
    pub fn is_accept(self) -> bool {
        matches!(self, Decision::Accept)
    }
}

/// Rejects packets whose `end_time` lies too far in the future — a clock
/// running fast on the digitizer, or a deliberately backdated test packet.
#[derive(Debug, Clone, Copy)]
pub struct FutureTest {
    max_future_time: Duration,
}

impl FutureTest {
    pub fn new(max_future_time: Duration) -> Self {
        FutureTest { max_future_time }
    }

    /// `true` when `end_time` is acceptable (on or before `now + Δf`).
    pub fn check(&self, end_time: Timestamp, now: Timestamp) -> bool {
        let limit = now.saturating_add(self.max_future_time.as_micros() as i64);
        end_time <= limit
    }
}

/// Rejects packets whose `start_time` is older than the retention window the
/// operator is willing to accept backfills for.
#[derive(Debug, Clone, Copy)]
pub struct ExpiredTest {
    max_expired_time: Duration,
}

impl ExpiredTest {
    pub fn new(max_expired_time: Duration) -> Self {
        ExpiredTest { max_expired_time }
    }

    /// `true` when `start_time` is acceptable (on or after `now - Δe`).
    pub fn check(&self, start_time: Timestamp, now: Timestamp) -> bool {
        let limit = now.saturating_sub(self.max_expired_time.as_micros() as i64);
        start_time >= limit
    }
}

/// The rate-dependent tolerance (microseconds) under which two headers with
/// matching name/rate/count are considered the same packet (§4.G table).
/// The original throws for rates ≥1005 Hz rather than defining a tolerance;
/// this falls back to the narrowest bucket's tolerance instead of making
/// admission fatal on an unusual-but-plausible high sample rate.
fn tolerance_for_rate(rate_hz: f64) -> i64 {
    if rate_hz < 105.0 {
        15_000
    } else if rate_hz < 255.0 {
        4_500
    } else if rate_hz < 505.0 {
        2_500
    } else {
        1_500
    }
}

/// The bounded-buffer entry a stream's duplicate filter compares against:
/// just enough of a packet's shape to decide sameness, not its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketHeader {
    pub name: CompactString,
    pub start: Timestamp,
    pub end: Timestamp,
    pub approx_rate: i32,
    pub n_samples: u32,
}

impl PacketHeader {
    pub fn from_packet(name: CompactString, packet: &Packet) -> Option<Self> {
        let rate = packet.sampling_rate()?;
        let end = packet.end_time().ok()?;
        Some(PacketHeader {
            name,
            start: packet.start_time(),
            end,
            approx_rate: rate.round() as i32,
            n_samples: packet.len() as u32,
        })
    }

    /// Two headers are "the same packet" when name, approximate rate, and
    /// sample count match, and the start times agree within the
    /// rate-dependent tolerance.
    fn same_as(&self, other: &PacketHeader) -> bool {
        self.name == other.name
            && self.approx_rate == other.approx_rate
            && self.n_samples == other.n_samples
            && (self.start - other.start).abs() < tolerance_for_rate(self.approx_rate as f64)
    }

    fn overlaps(&self, other: &PacketHeader) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Per-stream ring buffer of recently-accepted headers, sized either fixed
/// or estimated from the configured buffer duration (§4.G).
struct StreamBuffer {
    headers: VecDeque<PacketHeader>,
    capacity: usize,
}

impl StreamBuffer {
    fn new(capacity: usize) -> Self {
        StreamBuffer {
            headers: VecDeque::new(),
            capacity,
        }
    }

    /// The 6-step accept/reject/insert algorithm from spec.md §4.G.
    fn admit(&mut self, header: PacketHeader) -> Decision {
        if self.headers.is_empty() {
            self.push_bounded_back(header);
            return Decision::Accept;
        }

        if self.headers.iter().any(|h| h.same_as(&header)) {
            return Decision::Reject(RejectReason::Duplicate);
        }

        let back = self.headers.back().expect("checked non-empty above");
        if header.start > back.end {
            self.push_bounded_back(header);
            return Decision::Accept;
        }

        let front = self.headers.front().expect("checked non-empty above");
        if header.end < front.start && self.headers.len() < self.capacity {
            self.headers.push_front(header);
            return Decision::Accept;
        }

        if self.headers.iter().any(|h| h.overlaps(&header)) {
            return Decision::Reject(RejectReason::BadTiming);
        }

        self.insert_sorted(header);
        Decision::Accept
    }

    fn push_bounded_back(&mut self, header: PacketHeader) {
        if self.headers.len() >= self.capacity {
            self.headers.pop_front();
        }
        self.headers.push_back(header);
    }

    /// Steps 4/6 can insert out of the append-at-back order; re-sort to
    /// restore the ascending-`start_time` invariant afterward.
    fn insert_sorted(&mut self, header: PacketHeader) {
        if self.headers.len() >= self.capacity {
            self.headers.pop_front();
        }
        let idx = self
            .headers
            .iter()
            .position(|h| h.start > header.start)
            .unwrap_or(self.headers.len());
        self.headers.insert(idx, header);
    }
}

/// Capacity estimate per spec.md §4.G: `max(1000, buffer_duration_seconds /
/// packet_duration_seconds) + 1`, grounded in
/// `testDuplicatePacket.cpp::estimateCapacity`.
pub fn estimate_capacity(buffer_duration: Duration, packet_duration: Duration) -> usize {
    if packet_duration.is_zero() {
        return 1001;
    }
    let estimated = buffer_duration.as_secs_f64() / packet_duration.as_secs_f64();
    (estimated.ceil() as usize).max(1000) + 1
}

#[derive(Debug, Clone, Copy)]
pub enum BufferSizing {
    Fixed(usize),
    BufferDuration(Duration),
}

/// Per-stream rejection counters, drained and logged at a configurable
/// interval by a dedicated background thread rather than inline in the hot
/// path (§5, §4.G), guarded by its own mutex distinct from the header
/// buffer map's so observation never blocks admission.
#[derive(Default)]
pub struct RejectionLog {
    buckets: Mutex<HashMap<&'static str, HashSet<CompactString>>>,
}

impl RejectionLog {
    pub fn record(&self, stream: &str, reason: RejectReason) {
        crate::metrics::observe_admission_rejection(reason);
        self.buckets
            .lock()
            .entry(reason.category())
            .or_default()
            .insert(CompactString::from(stream));
    }

    /// Drains every bucket and logs a count per category, leaving the
    /// buckets empty for the next interval.
    pub fn drain_and_log(&self) {
        let mut buckets = self.buckets.lock();
        for (category, streams) in buckets.iter() {
            if !streams.is_empty() {
                info!(category, count = streams.len(), "admission rejections");
            }
        }
        buckets.clear();
    }
}

/// Composes the three admission tests over per-stream state.
pub struct AdmissionFilter {
    future: FutureTest,
    expired: ExpiredTest,
    sizing: BufferSizing,
    buffers: Mutex<HashMap<CompactString, StreamBuffer>>,
    rejection_log: RejectionLog,
}

impl AdmissionFilter {
    pub fn new(max_future_time: Duration, max_expired_time: Duration, sizing: BufferSizing) -> Self {
        AdmissionFilter {
            future: FutureTest::new(max_future_time),
            expired: ExpiredTest::new(max_expired_time),
            sizing,
            buffers: Mutex::new(HashMap::new()),
            rejection_log: RejectionLog::default(),
        }
    }

    pub fn rejection_log(&self) -> &RejectionLog {
        &self.rejection_log
    }

    /// Runs all three tests against `packet`, named by `stream_name` (the
    /// canonical `NET.STA.CHA[.LOC]` key). Equivalent to running
    /// [`Self::check_shallow`] followed by [`Self::check_duplicate`] when
    /// the former accepts — the single-call convenience for callers that
    /// aren't running the two-stage pipeline (§5) split across threads.
    pub fn allow(&self, stream_name: &str, packet: &Packet, now: Timestamp) -> Decision {
        match self.check_shallow(stream_name, packet, now) {
            Decision::Accept => self.check_duplicate(stream_name, packet),
            reject => reject,
        }
    }

    /// The pipeline's "shallow-dedup" stage (§5): empty/future/expired
    /// tests only, none of which need the per-stream header buffer.
    pub fn check_shallow(&self, stream_name: &str, packet: &Packet, now: Timestamp) -> Decision {
        if packet.is_empty() {
            self.rejection_log.record(stream_name, RejectReason::Empty);
            return Decision::Reject(RejectReason::Empty);
        }

        let Ok(end_time) = packet.end_time() else {
            self.rejection_log.record(stream_name, RejectReason::Empty);
            return Decision::Reject(RejectReason::Empty);
        };

        if !self.future.check(end_time, now) {
            self.rejection_log
                .record(stream_name, RejectReason::Future);
            return Decision::Reject(RejectReason::Future);
        }
        if !self.expired.check(packet.start_time(), now) {
            self.rejection_log
                .record(stream_name, RejectReason::Expired);
            return Decision::Reject(RejectReason::Expired);
        }
        Decision::Accept
    }

    /// The pipeline's "deep-dedup" stage (§5): the duplicate/clock-slip
    /// test against the per-stream header buffer. Callers must have
    /// already passed the packet through [`Self::check_shallow`].
    pub fn check_duplicate(&self, stream_name: &str, packet: &Packet) -> Decision {
        let Some(header) = PacketHeader::from_packet(CompactString::from(stream_name), packet)
        else {
            self.rejection_log.record(stream_name, RejectReason::Empty);
            return Decision::Reject(RejectReason::Empty);
        };

        let decision = self.admit_header(stream_name, header);
        if let Decision::Reject(reason) = decision {
            self.rejection_log.record(stream_name, reason);
        }
        decision
    }

    fn admit_header(&self, stream_name: &str, header: PacketHeader) -> Decision {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(CompactString::from(stream_name)).or_insert_with(|| {
            let capacity = match self.sizing {
                BufferSizing::Fixed(n) => n,
                BufferSizing::BufferDuration(buffer_duration) => {
                    let packet_duration = Duration::from_micros(
                        (header.end - header.start).max(0) as u64,
                    );
                    estimate_capacity(buffer_duration, packet_duration)
                }
            };
            StreamBuffer::new(capacity.max(1))
        });
        buffer.admit(header)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1.0, 15_000)]
    #[case(104.9, 15_000)]
    #[case(105.0, 4_500)]
    #[case(254.9, 4_500)]
    #[case(255.0, 2_500)]
    #[case(504.9, 2_500)]
    #[case(505.0, 1_500)]
    #[case(2000.0, 1_500)]
    fn tolerance_table_matches_spec(#[case] rate_hz: f64, #[case] expected_us: i64) {
        assert_eq!(tolerance_for_rate(rate_hz), expected_us);
    }

    fn header(name: &str, start: i64, end: i64, rate: i32, n: u32) -> PacketHeader {
        PacketHeader {
            name: CompactString::from(name),
            start,
            end,
            approx_rate: rate,
            n_samples: n,
        }
    }

    #[test]
    fn future_boundary_is_inclusive() {
        let test = FutureTest::new(Duration::from_secs(10));
        assert!(test.check(1_000_000_010_000_000, 1_000_000_000_000_000));
        assert!(!test.check(1_000_000_010_000_001, 1_000_000_000_000_000));
    }

    #[test]
    fn expired_boundary_is_inclusive() {
        let test = ExpiredTest::new(Duration::from_secs(10));
        assert!(test.check(990_000_000_000, 1_000_000_000_000));
        assert!(!test.check(989_999_999_999, 1_000_000_000_000));
    }

    #[test]
    fn duplicate_header_is_rejected_on_second_presentation() {
        let mut buf = StreamBuffer::new(10);
        let h = header("UU.BGU.HHZ", 0, 1_000_000, 100, 100);
        assert_eq!(buf.admit(h.clone()), Decision::Accept);
        assert_eq!(buf.admit(h), Decision::Reject(RejectReason::Duplicate));
    }

    #[test]
    fn near_duplicate_within_tolerance_is_rejected() {
        let mut buf = StreamBuffer::new(10);
        let a = header("UU.BGU.HHZ", 0, 1_000_000, 100, 100);
        let b = header("UU.BGU.HHZ", 5_000, 1_005_000, 100, 100);
        assert_eq!(buf.admit(a), Decision::Accept);
        assert_eq!(buf.admit(b), Decision::Reject(RejectReason::Duplicate));
    }

    #[test]
    fn common_real_time_case_appends_to_back() {
        let mut buf = StreamBuffer::new(10);
        let a = header("S", 0, 1_000_000, 100, 100);
        let b = header("S", 2_000_000, 3_000_000, 100, 100);
        assert_eq!(buf.admit(a), Decision::Accept);
        assert_eq!(buf.admit(b), Decision::Accept);
        assert_eq!(buf.headers.len(), 2);
    }

    #[test]
    fn backfill_with_room_is_accepted_at_front() {
        let mut buf = StreamBuffer::new(10);
        let a = header("S", 5_000_000, 6_000_000, 100, 100);
        let b = header("S", 0, 1_000_000, 100, 100);
        assert_eq!(buf.admit(a), Decision::Accept);
        assert_eq!(buf.admit(b), Decision::Accept);
        assert_eq!(buf.headers.front().unwrap().start, 0);
    }

    #[test]
    fn overlapping_non_duplicate_interval_is_a_clock_slip() {
        let mut buf = StreamBuffer::new(10);
        let a = header("S", 0, 1_000_000, 100, 100);
        // Overlaps [0, 1e6] but different sample count so same_as() is false.
        let b = header("S", 500_000, 1_500_000, 100, 50);
        assert_eq!(buf.admit(a), Decision::Accept);
        assert_eq!(buf.admit(b), Decision::Reject(RejectReason::BadTiming));
    }

    #[test]
    fn legitimate_out_of_order_backfill_is_sorted_in() {
        let mut buf = StreamBuffer::new(3);
        let a = header("S", 0, 1_000_000, 100, 100);
        let c = header("S", 4_000_000, 5_000_000, 100, 100);
        assert_eq!(buf.admit(a), Decision::Accept);
        assert_eq!(buf.admit(c), Decision::Accept);
        // Buffer is full (cap 3 not yet hit, 2/3) — insert a middle packet
        // that is disjoint from both neighbors via the front-backfill path
        // being unavailable (front check fails because buffer isn't full
        // enough to matter here; exercise the sorted-insert branch instead
        // by using start > back is false and end < front is false).
        let b = header("S", 2_000_000, 2_500_000, 100, 100);
        assert_eq!(buf.admit(b), Decision::Accept);
        let starts: Vec<i64> = buf.headers.iter().map(|h| h.start).collect();
        assert_eq!(starts, vec![0, 2_000_000, 4_000_000]);
    }

    #[test]
    fn shuffled_sequence_then_replay_all_reject() {
        let mut buf = StreamBuffer::new(16);
        let headers: Vec<PacketHeader> = (0..8)
            .map(|i| header("S", i * 2_000_000, i * 2_000_000 + 1_000_000, 100, 100))
            .collect();
        let mut shuffled = headers.clone();
        // Deterministic "shuffle": reverse plus a rotation, no RNG needed.
        shuffled.reverse();
        shuffled.rotate_left(3);

        for h in &shuffled {
            assert_eq!(buf.admit(h.clone()), Decision::Accept);
        }
        for h in &shuffled {
            assert_eq!(buf.admit(h.clone()), Decision::Reject(RejectReason::Duplicate));
        }
    }

    #[test]
    fn allow_rejects_empty_packets_without_touching_buffers() {
        let filter = AdmissionFilter::new(
            Duration::from_secs(0),
            Duration::from_secs(3600),
            BufferSizing::Fixed(10),
        );
        let mut p = Packet::new();
        p.set_network("UU").unwrap();
        p.set_station("BGU").unwrap();
        p.set_channel("HHZ").unwrap();
        assert_eq!(
            filter.allow("UU.BGU.HHZ", &p, 0),
            Decision::Reject(RejectReason::Empty)
        );
    }

    #[test]
    fn estimate_capacity_honors_floor_of_1000() {
        assert_eq!(
            estimate_capacity(Duration::from_secs(1), Duration::from_secs(1)),
            1001
        );
        assert_eq!(
            estimate_capacity(Duration::from_secs(20_000), Duration::from_secs(1)),
            20_001
        );
    }
}
