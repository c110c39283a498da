//! Writer client (§4.E): validates, encodes, and idempotently inserts a
//! [`Packet`] into its resolved data table. Grounded in
//! `writeClient.cpp::insert` and `WriteClientImpl`.

use std::time::Duration;

use bytesize::ByteSize;
use seismo_common::{
    codec::{self, Compression},
    Packet, PacketError, SampleArray, SampleSlice, Timestamp,
};
use tracing::{debug, warn};

use crate::{
    db::{Connection, ConnectionError},
    registry::{LookupMode, RegistryError, StreamIdentity, StreamRegistry},
};

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("packet is missing a required identifier or sampling rate")]
    Validation,
    #[error("packet sample type is Unknown; nothing to encode")]
    UnknownType,
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("postgres: {0}")]
    Postgres(#[from] postgres::Error),
}

/// The "void on success, empty samples warn-and-return" outcome of
/// [`write`] — distinguished from an error since an empty sample array is
/// not a fatal condition (§4.E step 1, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    SkippedEmpty,
    SkippedExpired,
}

pub struct Writer {
    compression: Compression,
    retention: Duration,
}

impl Writer {
    pub fn new(compression: Compression, retention: Duration) -> Self {
        Writer {
            compression,
            retention,
        }
    }

    /// The 5-step `write(packet)` algorithm from spec.md §4.E. `now` is
    /// injected rather than read from the system clock so the retention
    /// check is deterministic in tests.
    pub fn write(
        &self,
        packet: &Packet,
        registry: &StreamRegistry,
        conn: &mut Connection,
        running: &std::sync::atomic::AtomicBool,
        now: Timestamp,
    ) -> Result<WriteOutcome, WriteError> {
        let (Some(network), Some(station), Some(channel), Some(rate)) = (
            packet.network(),
            packet.station(),
            packet.channel(),
            packet.sampling_rate(),
        ) else {
            return Err(WriteError::Validation);
        };
        let _ = rate;

        if packet.is_empty() {
            warn!(stream = %canonical_name(packet), "empty sample array, skipping write");
            return Ok(WriteOutcome::SkippedEmpty);
        }

        let data_type = packet.data_type_tag();
        if data_type.is_none() {
            return Err(WriteError::UnknownType);
        }

        let end_time = packet.end_time()?;
        let retention_cutoff = now.saturating_sub(self.retention.as_micros() as i64);
        if end_time < retention_cutoff {
            warn!(stream = %canonical_name(packet), "packet older than retention window, skipping write");
            return Ok(WriteOutcome::SkippedExpired);
        }

        if conn.client_mut().is_none() {
            conn.reconnect(running)?;
        }

        let identity = StreamIdentity::new(network, station, channel, packet.location());
        let entry = registry.resolve(&identity, conn, LookupMode::Writer)?;

        let (bytes, compressed) = encode_sample_array(packet.view(), self.compression);
        let tag = data_type.expect("checked above");

        let client = conn
            .client_mut()
            .expect("just reconnected or was already open above");

        let insert = format!(
            "INSERT INTO {} (stream_identifier, start_time, end_time, sampling_rate, \
             number_of_samples, little_endian, compressed, data_type, data) \
             VALUES ($1, TO_TIMESTAMP($2), TO_TIMESTAMP($3), $4, $5, $6, $7, $8, $9) \
             ON CONFLICT DO NOTHING",
            entry.data_table
        );
        let start_secs = packet.start_time() as f64 / 1_000_000.0;
        let end_secs = end_time as f64 / 1_000_000.0;
        let n_samples = packet.len() as i32;
        let tag_str = tag.to_string();
        let insert_started = std::time::Instant::now();
        client.execute(
            &insert,
            &[
                &entry.stream_id,
                &start_secs,
                &end_secs,
                &rate,
                &n_samples,
                &true, // little_endian: the encoder always emits little-endian.
                &compressed,
                &tag_str,
                &bytes,
            ],
        )?;
        crate::metrics::observe_write_latency(insert_started.elapsed());
        debug!(
            stream = %canonical_name(packet),
            samples = n_samples,
            encoded = %ByteSize::b(bytes.len() as u64),
            compressed,
            "inserted packet"
        );
        Ok(WriteOutcome::Inserted)
    }
}

fn canonical_name(packet: &Packet) -> String {
    format!(
        "{}.{}.{}",
        packet.network().unwrap_or("?"),
        packet.station().unwrap_or("?"),
        packet.channel().unwrap_or("?"),
    )
}

fn encode_sample_array(data: SampleSlice<'_>, compression: Compression) -> (Vec<u8>, bool) {
    match data {
        SampleSlice::Empty => (Vec::new(), false),
        SampleSlice::I32(v) => codec::encode(v, compression),
        SampleSlice::I64(v) => codec::encode(v, compression),
        SampleSlice::F32(v) => codec::encode(v, compression),
        SampleSlice::F64(v) => codec::encode(v, compression),
        SampleSlice::Text(v) => codec::encode_text(v, Compression::None),
    }
}
