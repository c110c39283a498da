//! Read-only query client (§4.F): reconstructs [`Packet`]s from a stream's
//! data table over a time window. Grounded in `readOnlyClient.cpp::query`
//! and `queryStation`.

use std::collections::BTreeMap;

use compact_str::CompactString;
use seismo_common::{
    codec::{self, CodecError, Compression},
    DataType, Packet, SampleArray, Timestamp,
};
use tracing::warn;

use crate::{
    db::Connection,
    registry::{LookupMode, RegistryError, StreamEntry, StreamIdentity, StreamRegistry},
};

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("query window is empty or inverted (t0 >= t1)")]
    InvalidWindow,
    #[error("network/station/channel identifiers must be non-empty")]
    InvalidIdentity,
    #[error("stream is not in the in-memory cache and `cache_only` was requested")]
    NotCached,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("postgres: {0}")]
    Postgres(#[from] postgres::Error),
}

/// `cache_only` mirrors the original's in-process cache bypass: when set,
/// resolution only consults the in-memory registry cache and returns
/// [`ReadError::NotCached`] on a miss rather than issuing a catalog query.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub cache_only: bool,
}

/// Stateless: every piece of per-row decoding context (type tag, sample
/// count, compression flag) travels with the row itself.
pub struct Reader;

impl Reader {
    pub fn new() -> Self {
        Reader
    }

    /// Queries a single stream over `[t0, t1]` (inclusive), returning
    /// packets ordered ascending by start time. Rows whose stored bytes
    /// fail to decode are logged and skipped rather than failing the whole
    /// query (§4.F edge cases).
    pub fn query(
        &self,
        identity: &StreamIdentity,
        t0: Timestamp,
        t1: Timestamp,
        registry: &StreamRegistry,
        conn: &mut Connection,
        options: QueryOptions,
    ) -> Result<Vec<Packet>, ReadError> {
        validate_window(t0, t1)?;
        validate_identity(identity)?;

        let entry = if options.cache_only {
            registry.resolve_cached(identity).ok_or(ReadError::NotCached)?
        } else {
            registry.resolve(identity, conn, LookupMode::Reader)?
        };
        if !entry.is_found() {
            return Ok(Vec::new());
        }

        let client = conn
            .client_mut()
            .expect("caller ensures the connection is open before querying");
        let query = format!(
            "SELECT EXTRACT(EPOCH FROM start_time), EXTRACT(EPOCH FROM end_time), \
             sampling_rate, number_of_samples, data_type, compressed, data \
             FROM {} WHERE stream_identifier = $1 \
             AND end_time > TO_TIMESTAMP($2) AND start_time < TO_TIMESTAMP($3) \
             ORDER BY start_time ASC",
            entry.data_table
        );
        let t0_secs = t0 as f64 / 1_000_000.0;
        let t1_secs = t1 as f64 / 1_000_000.0;
        let rows = client.query(&query, &[&entry.stream_id, &t0_secs, &t1_secs])?;

        let mut packets = Vec::with_capacity(rows.len());
        for row in rows {
            let start_secs: f64 = row.get(0);
            let _end_secs: f64 = row.get(1);
            let rate: f64 = row.get(2);
            let n: i32 = row.get(3);
            let tag: String = row.get(4);
            let compressed: bool = row.get(5);
            let bytes: Vec<u8> = row.get(6);

            match decode_row(identity, &tag, &bytes, n as usize, compressed) {
                Ok(data) => {
                    let mut packet = Packet::new();
                    packet
                        .set_network(&identity.network)
                        .expect("registry identities always carry non-empty, normalized fields");
                    packet
                        .set_station(&identity.station)
                        .expect("registry identities always carry non-empty, normalized fields");
                    packet
                        .set_channel(&identity.channel)
                        .expect("registry identities always carry non-empty, normalized fields");
                    if let Some(loc) = &identity.location {
                        packet
                            .set_location(loc)
                            .expect("registry identities always carry non-empty, normalized fields");
                    }
                    if let Err(e) = packet.set_sampling_rate(rate) {
                        warn!(stream = %identity.canonical_name(), error = %e, "skipping row with invalid sampling rate");
                        continue;
                    }
                    packet.set_start_time_seconds(start_secs);
                    packet.set_data(data);
                    packets.push(packet);
                }
                Err(e) => {
                    warn!(stream = %identity.canonical_name(), error = %e, "skipping row with undecodable payload");
                }
            }
        }
        Ok(packets)
    }

    /// Queries every channel recorded for a station (§4.F `queryStation`):
    /// resolves the set of `(stream_id, table)` pairs via the registry,
    /// groups them by distinct data table, and issues one
    /// `stream_identifier IN (...)` query per table rather than one query
    /// per channel. Decoded packets are dispatched into a map keyed by
    /// their canonical stream name; a row that fails to decode is logged
    /// and skipped without dropping its siblings.
    pub fn query_station(
        &self,
        network: &str,
        station: &str,
        t0: Timestamp,
        t1: Timestamp,
        registry: &StreamRegistry,
        conn: &mut Connection,
        options: QueryOptions,
    ) -> Result<BTreeMap<CompactString, Vec<Packet>>, ReadError> {
        validate_window(t0, t1)?;
        if network.trim().is_empty() || station.trim().is_empty() {
            return Err(ReadError::InvalidIdentity);
        }

        let channels = if options.cache_only {
            let cached = registry.cached_channels_for_station(network, station);
            if cached.is_empty() {
                return Err(ReadError::NotCached);
            }
            cached
        } else {
            registry.channels_for_station(network, station, conn)?
        };
        let mut by_table: BTreeMap<String, Vec<(StreamIdentity, StreamEntry)>> = BTreeMap::new();
        for (identity, entry) in channels {
            by_table
                .entry(entry.data_table.clone())
                .or_default()
                .push((identity, entry));
        }

        let mut out: BTreeMap<CompactString, Vec<Packet>> = BTreeMap::new();
        for (table, members) in by_table {
            let by_id: std::collections::HashMap<i32, &StreamIdentity> = members
                .iter()
                .map(|(identity, entry)| (entry.stream_id, identity))
                .collect();
            let ids: Vec<i32> = by_id.keys().copied().collect();

            let client = conn
                .client_mut()
                .expect("caller ensures the connection is open before querying");
            let query = format!(
                "SELECT stream_identifier, EXTRACT(EPOCH FROM start_time), sampling_rate, \
                 number_of_samples, data_type, compressed, data \
                 FROM {table} WHERE stream_identifier = ANY($1) \
                 AND end_time > TO_TIMESTAMP($2) AND start_time < TO_TIMESTAMP($3) \
                 ORDER BY start_time ASC"
            );
            let t0_secs = t0 as f64 / 1_000_000.0;
            let t1_secs = t1 as f64 / 1_000_000.0;
            let rows = client.query(&query, &[&ids, &t0_secs, &t1_secs])?;

            for row in rows {
                let stream_id: i32 = row.get(0);
                let Some(identity) = by_id.get(&stream_id) else {
                    continue;
                };
                let start_secs: f64 = row.get(1);
                let rate: f64 = row.get(2);
                let n: i32 = row.get(3);
                let tag: String = row.get(4);
                let compressed: bool = row.get(5);
                let bytes: Vec<u8> = row.get(6);

                match decode_row(identity, &tag, &bytes, n as usize, compressed) {
                    Ok(data) => {
                        let mut packet = Packet::new();
                        packet
                            .set_network(&identity.network)
                            .expect("registry identities always carry non-empty, normalized fields");
                        packet
                            .set_station(&identity.station)
                            .expect("registry identities always carry non-empty, normalized fields");
                        packet
                            .set_channel(&identity.channel)
                            .expect("registry identities always carry non-empty, normalized fields");
                        if let Some(loc) = &identity.location {
                            packet
                                .set_location(loc)
                                .expect("registry identities always carry non-empty, normalized fields");
                        }
                        if let Err(e) = packet.set_sampling_rate(rate) {
                            warn!(stream = %identity.canonical_name(), error = %e, "skipping row with invalid sampling rate");
                            continue;
                        }
                        packet.set_start_time_seconds(start_secs);
                        packet.set_data(data);
                        out.entry(identity.canonical_name())
                            .or_default()
                            .push(packet);
                    }
                    Err(e) => {
                        warn!(stream = %identity.canonical_name(), error = %e, "skipping row with undecodable payload");
                    }
                }
            }
        }
        for packets in out.values_mut() {
            packets.sort_by_key(|p| p.start_time());
        }
        Ok(out)
    }
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_window(t0: Timestamp, t1: Timestamp) -> Result<(), ReadError> {
    if t0 >= t1 {
        return Err(ReadError::InvalidWindow);
    }
    Ok(())
}

fn validate_identity(identity: &StreamIdentity) -> Result<(), ReadError> {
    if identity.network.is_empty() || identity.station.is_empty() || identity.channel.is_empty() {
        return Err(ReadError::InvalidIdentity);
    }
    Ok(())
}

fn decode_row(
    identity: &StreamIdentity,
    tag: &str,
    bytes: &[u8],
    n: usize,
    compressed: bool,
) -> Result<SampleArray, CodecError> {
    let _ = identity;
    let data_type = tag.chars().next().and_then(DataType::from_tag);
    match data_type {
        Some(DataType::Integer32) => {
            Ok(SampleArray::I32(codec::decode(bytes, n, compressed)?))
        }
        Some(DataType::Integer64) => {
            Ok(SampleArray::I64(codec::decode(bytes, n, compressed)?))
        }
        Some(DataType::Float) => Ok(SampleArray::F32(codec::decode(bytes, n, compressed)?)),
        Some(DataType::Double) => Ok(SampleArray::F64(codec::decode(bytes, n, compressed)?)),
        Some(DataType::Text) => {
            Ok(SampleArray::Text(codec::decode_text(bytes, n, compressed)?))
        }
        None => Err(CodecError::LengthMismatch {
            expected: n,
            actual: 0,
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_inverted_window() {
        let err = validate_window(100, 50).unwrap_err();
        assert!(matches!(err, ReadError::InvalidWindow));
    }

    #[test]
    fn rejects_equal_window_bounds() {
        let err = validate_window(100, 100).unwrap_err();
        assert!(matches!(err, ReadError::InvalidWindow));
    }

    #[test]
    fn rejects_empty_identity_fields() {
        let id = StreamIdentity::new("", "bgu", "hhz", None);
        let err = validate_identity(&id).unwrap_err();
        assert!(matches!(err, ReadError::InvalidIdentity));
    }

    #[test]
    fn decode_row_rejects_unknown_tag() {
        let id = StreamIdentity::new("uu", "bgu", "hhz", None);
        let err = decode_row(&id, "?", &[], 3, false).unwrap_err();
        assert!(matches!(err, CodecError::LengthMismatch { .. }));
    }

    #[test]
    fn decode_row_dispatches_by_tag() {
        let id = StreamIdentity::new("uu", "bgu", "hhz", None);
        let (bytes, compressed) = codec::encode(&[1i32, 2, 3], Compression::None);
        let decoded = decode_row(&id, "i", &bytes, 3, compressed).unwrap();
        assert!(seismo_common::samples_bitwise_eq(
            &decoded,
            &SampleArray::I32(vec![1, 2, 3])
        ));
    }
}
