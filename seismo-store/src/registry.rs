//! Stream registry & cache (§4.D): maps `(network, station, channel,
//! location)` to the `(stream_id, data_table)` pair a writer inserts into
//! and a reader queries, with lazy schema provisioning on first write.
//!
//! Grounded in `writeClient.cpp::getStreamIdentifierAndTableName` and its
//! read-only counterpart in `readOnlyClient.cpp`.

use std::collections::HashMap;

use compact_str::CompactString;
use parking_lot::Mutex;
use postgres::Row;
use tracing::{debug, warn};

use crate::db::Connection;

pub type StreamId = i32;

/// Sentinel identifier returned for reader-mode lookups that miss — never a
/// real assigned id (Postgres `serial` ids start at 1).
pub const NOT_FOUND_STREAM_ID: StreamId = -1;

/// The tuple identifying a stream, pre-normalization-checked by the caller
/// (`Packet`'s setters already uppercase and strip whitespace).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamIdentity {
    pub network: CompactString,
    pub station: CompactString,
    pub channel: CompactString,
    /// `None` and `Some("")` are the same thing for identity purposes: both
    /// produce a canonical name with no trailing `.LOC` segment, matching
    /// the original's `toName` which only appends the location code when it
    /// is non-empty.
    pub location: Option<CompactString>,
}

impl StreamIdentity {
    pub fn new(network: &str, station: &str, channel: &str, location: Option<&str>) -> Self {
        StreamIdentity {
            network: CompactString::from(network.trim().to_uppercase()),
            station: CompactString::from(station.trim().to_uppercase()),
            channel: CompactString::from(channel.trim().to_uppercase()),
            location: location
                .map(|l| l.trim().to_uppercase())
                .filter(|l| !l.is_empty())
                .map(CompactString::from),
        }
    }

    /// `NET.STA.CHA[.LOC]`, the key both the in-memory cache and the
    /// `streams` table index by.
    pub fn canonical_name(&self) -> CompactString {
        match &self.location {
            Some(loc) => CompactString::from(format!(
                "{}.{}.{}.{}",
                self.network, self.station, self.channel, loc
            )),
            None => CompactString::from(format!(
                "{}.{}.{}",
                self.network, self.station, self.channel
            )),
        }
    }

    /// The per-station data table name: `lowercase(net + "_" + sta +
    /// "_data")`, optionally schema-prefixed. Grounded in
    /// `writeClient.cpp::toTableName`.
    pub fn data_table_name(&self, schema: Option<&str>) -> String {
        let base = format!("{}_{}_data", self.network, self.station).to_lowercase();
        match schema.filter(|s| !s.is_empty()) {
            Some(schema) => format!("{schema}.{base}"),
            None => base,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub stream_id: StreamId,
    pub data_table: String,
}

impl StreamEntry {
    pub const fn not_found() -> Self {
        StreamEntry {
            stream_id: NOT_FOUND_STREAM_ID,
            data_table: String::new(),
        }
    }

    pub fn is_found(&self) -> bool {
        self.stream_id != NOT_FOUND_STREAM_ID
    }
}

/// Whether a missed lookup may provision the stream (§4.D step 3) or must
/// return the not-found sentinel (§4.D step 5). A enum rather than a raw
/// `bool`, matching the Rust idiom called out in SPEC_FULL over the
/// original's `addIfNotExists: bool` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    Reader,
    Writer,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("database: {0}")]
    Postgres(#[from] Arced<postgres::Error>),
    #[error("stream `{0}` still not found after provisioning attempt")]
    StillMissingAfterCreate(CompactString),
}

/// `postgres::Error` isn't `Clone`, but `RegistryError` needs to be (the
/// registry returns errors to multiple writer/reader threads); wrap it once
/// here instead of threading `Arc` through every call site.
#[derive(Debug)]
pub struct Arced<E>(std::sync::Arc<E>);

impl<E: std::fmt::Display> std::fmt::Display for Arced<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for Arced<E> {}

impl<E> Clone for Arced<E> {
    fn clone(&self) -> Self {
        Arced(self.0.clone())
    }
}

impl From<postgres::Error> for Arced<postgres::Error> {
    fn from(e: postgres::Error) -> Self {
        Arced(std::sync::Arc::new(e))
    }
}

/// In-memory cache over the `streams` catalog table, guarded by a coarse
/// mutex (§5: holders drop the lock before issuing I/O, then re-acquire to
/// insert).
pub struct StreamRegistry {
    cache: Mutex<HashMap<CompactString, StreamEntry>>,
    schema: Option<String>,
}

impl StreamRegistry {
    pub fn new(schema: Option<String>) -> Self {
        StreamRegistry {
            cache: Mutex::new(HashMap::new()),
            schema,
        }
    }

    /// Startup bulk load of every row in the `streams` catalog.
    pub fn load_all(&self, conn: &mut Connection) -> Result<usize, RegistryError> {
        let client = conn
            .client_mut()
            .expect("caller ensures the connection is open before load_all");
        let table = self.streams_table_name();
        let query = format!(
            "SELECT identifier, network, station, channel, location_code, data_table_name FROM {table}"
        );
        let rows = client
            .query(&query, &[])
            .map_err(Arced::from)?;
        let mut cache = self.cache.lock();
        let n = rows.len();
        for row in rows {
            let (name, entry) = row_to_entry(&row);
            cache.insert(name, entry);
        }
        debug!(count = n, "loaded stream registry from catalog");
        Ok(n)
    }

    fn streams_table_name(&self) -> String {
        match self.schema.as_deref().filter(|s| !s.is_empty()) {
            Some(schema) => format!("{schema}.streams"),
            None => "streams".to_string(),
        }
    }

    /// Consults only the in-memory cache, never the database — the
    /// `cache_only` query option's resolution path (§4.F).
    pub fn resolve_cached(&self, identity: &StreamIdentity) -> Option<StreamEntry> {
        self.cache.lock().get(&identity.canonical_name()).cloned()
    }

    /// The 5-step lookup algorithm from spec.md §4.D.
    pub fn resolve(
        &self,
        identity: &StreamIdentity,
        conn: &mut Connection,
        mode: LookupMode,
    ) -> Result<StreamEntry, RegistryError> {
        let name = identity.canonical_name();

        // Step 1: cache hit.
        if let Some(entry) = self.cache.lock().get(&name).cloned() {
            return Ok(entry);
        }

        // Step 2: query the streams table. Lock dropped above before this
        // I/O, per §5's "holders do not perform I/O while holding it".
        if let Some(entry) = self.query_streams_table(identity, conn)? {
            self.cache.lock().insert(name.clone(), entry.clone());
            return Ok(entry);
        }

        if mode == LookupMode::Reader {
            // Step 5.
            return Ok(StreamEntry::not_found());
        }

        // Step 3: writer mode, no row yet — provision via the stored
        // procedure, then re-query.
        self.create_stream_data_table(identity, conn)?;
        if let Some(entry) = self.query_streams_table(identity, conn)? {
            self.cache.lock().insert(name.clone(), entry.clone());
            return Ok(entry);
        }

        // Step 4: still missing after provisioning is fatal in writer mode.
        Err(RegistryError::StillMissingAfterCreate(name))
    }

    fn query_streams_table(
        &self,
        identity: &StreamIdentity,
        conn: &mut Connection,
    ) -> Result<Option<StreamEntry>, RegistryError> {
        let client = conn
            .client_mut()
            .expect("caller ensures the connection is open before querying");
        let table = self.streams_table_name();
        let query = format!(
            "SELECT identifier, data_table_name FROM {table} \
             WHERE network = $1 AND station = $2 AND channel = $3 AND location_code = $4"
        );
        let location_code = identity.location.as_deref().unwrap_or("");
        let rows = client
            .query(
                &query,
                &[
                    &identity.network.as_str(),
                    &identity.station.as_str(),
                    &identity.channel.as_str(),
                    &location_code,
                ],
            )
            .map_err(Arced::from)?;
        if rows.len() > 1 {
            warn!(stream = %identity.canonical_name(), "multiple rows for stream in catalog, using first");
        }
        Ok(rows.first().map(|row| StreamEntry {
            stream_id: row.get(0),
            data_table: row.get(1),
        }))
    }

    /// The `cache_only` counterpart of [`Self::channels_for_station`]:
    /// scans already-cached entries for the `NET.STA.` prefix rather than
    /// issuing a catalog query. Misses entirely if no channel for this
    /// station has ever been resolved into the cache.
    pub fn cached_channels_for_station(
        &self,
        network: &str,
        station: &str,
    ) -> Vec<(StreamIdentity, StreamEntry)> {
        let prefix = format!(
            "{}.{}.",
            network.trim().to_uppercase(),
            station.trim().to_uppercase()
        );
        self.cache
            .lock()
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, entry)| (identity_from_canonical_name(name), entry.clone()))
            .collect()
    }

    /// All channels the catalog knows about for a station, each tagged with
    /// its resolved `(stream_id, data_table)` — used by
    /// `Reader::query_station` (§4.F) to group channels by distinct data
    /// table before issuing one `IN (...)` query per table.
    pub fn channels_for_station(
        &self,
        network: &str,
        station: &str,
        conn: &mut Connection,
    ) -> Result<Vec<(StreamIdentity, StreamEntry)>, RegistryError> {
        let client = conn
            .client_mut()
            .expect("caller ensures the connection is open before querying");
        let table = self.streams_table_name();
        let query = format!(
            "SELECT identifier, network, station, channel, location_code, data_table_name \
             FROM {table} WHERE network = $1 AND station = $2"
        );
        let rows = client
            .query(&query, &[&network, &station])
            .map_err(Arced::from)?;
        let mut cache = self.cache.lock();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let (name, entry) = row_to_entry(row);
            cache.entry(name).or_insert_with(|| entry.clone());
            let network: String = row.get(1);
            let station: String = row.get(2);
            let channel: String = row.get(3);
            let location: String = row.get(4);
            let identity = StreamIdentity::new(
                &network,
                &station,
                &channel,
                Some(location.as_str()).filter(|l| !l.is_empty()),
            );
            out.push((identity, entry));
        }
        Ok(out)
    }

    #[cfg(test)]
    fn insert_for_test(&self, identity: &StreamIdentity, entry: StreamEntry) {
        self.cache.lock().insert(identity.canonical_name(), entry);
    }

    /// Invokes `create_stream_data_table_with_defaults[_in_schema]`, the
    /// stored procedure that creates the data table, configures
    /// time-partitioning, column-store ordering, the `stream_id`
    /// chunk-skipping index, and the retention policy (§4.D).
    fn create_stream_data_table(
        &self,
        identity: &StreamIdentity,
        conn: &mut Connection,
    ) -> Result<(), RegistryError> {
        let client = conn
            .client_mut()
            .expect("caller ensures the connection is open before provisioning");
        let location_code = identity.location.as_deref().unwrap_or("");
        let params = [
            identity.network.as_str(),
            identity.station.as_str(),
            identity.channel.as_str(),
            location_code,
        ];
        // `CALL` with bind parameters isn't supported uniformly across the
        // Postgres versions this stored procedure targets, so the call is
        // built as an escaped literal statement, same as the original.
        let statement = build_create_call(self.schema.as_deref(), &params);
        client.batch_execute(&statement).map_err(Arced::from)?;
        Ok(())
    }
}

fn build_create_call(schema: Option<&str>, params: &[&str]) -> String {
    let escaped: Vec<String> = params.iter().map(|p| p.replace('\'', "''")).collect();
    match schema.filter(|s| !s.is_empty()) {
        Some(schema) => format!(
            "CALL public.create_stream_data_table_with_defaults_in_schema('{}', '{}', '{}', '{}', '{}')",
            schema.replace('\'', "''"),
            escaped[0],
            escaped[1],
            escaped[2],
            escaped[3],
        ),
        None => format!(
            "CALL public.create_stream_data_table_with_defaults('{}', '{}', '{}', '{}')",
            escaped[0], escaped[1], escaped[2], escaped[3],
        ),
    }
}

/// Parses a canonical `NET.STA.CHA[.LOC]` cache key back into its
/// components, the inverse of [`StreamIdentity::canonical_name`].
fn identity_from_canonical_name(name: &str) -> StreamIdentity {
    let mut parts = name.splitn(4, '.');
    let network = parts.next().unwrap_or_default();
    let station = parts.next().unwrap_or_default();
    let channel = parts.next().unwrap_or_default();
    let location = parts.next();
    StreamIdentity::new(network, station, channel, location)
}

fn row_to_entry(row: &Row) -> (CompactString, StreamEntry) {
    let network: String = row.get(1);
    let station: String = row.get(2);
    let channel: String = row.get(3);
    let location: String = row.get(4);
    let identity = StreamIdentity::new(
        &network,
        &station,
        &channel,
        Some(location.as_str()).filter(|l| !l.is_empty()),
    );
    let entry = StreamEntry {
        stream_id: row.get(0),
        data_table: row.get(5),
    };
    (identity.canonical_name(), entry)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonical_name_omits_empty_location() {
        let id = StreamIdentity::new("uu", "bgu", "hhz", Some(""));
        assert_eq!(id.canonical_name(), "UU.BGU.HHZ");
    }

    #[test]
    fn canonical_name_includes_nonempty_location() {
        let id = StreamIdentity::new("uu", "bgu", "hhz", Some("01"));
        assert_eq!(id.canonical_name(), "UU.BGU.HHZ.01");
    }

    #[test]
    fn data_table_name_is_lowercase_and_schema_prefixed() {
        let id = StreamIdentity::new("UU", "BGU", "HHZ", None);
        assert_eq!(id.data_table_name(None), "uu_bgu_data");
        assert_eq!(id.data_table_name(Some("seismo")), "seismo.uu_bgu_data");
    }

    #[test]
    fn not_found_entry_reports_sentinel_id() {
        let entry = StreamEntry::not_found();
        assert!(!entry.is_found());
        assert_eq!(entry.stream_id, NOT_FOUND_STREAM_ID);
    }

    #[test]
    fn identity_from_canonical_name_round_trips() {
        let id = StreamIdentity::new("uu", "bgu", "hhz", Some("01"));
        let parsed = identity_from_canonical_name(&id.canonical_name());
        assert_eq!(parsed, id);

        let id_no_loc = StreamIdentity::new("uu", "bgu", "hhz", None);
        let parsed_no_loc = identity_from_canonical_name(&id_no_loc.canonical_name());
        assert_eq!(parsed_no_loc, id_no_loc);
    }

    #[test]
    fn resolve_cached_returns_none_on_miss() {
        let registry = StreamRegistry::new(None);
        let id = StreamIdentity::new("uu", "bgu", "hhz", None);
        assert!(registry.resolve_cached(&id).is_none());
    }

    #[test]
    fn resolve_cached_returns_cached_entry() {
        let registry = StreamRegistry::new(None);
        let id = StreamIdentity::new("uu", "bgu", "hhz", None);
        let entry = StreamEntry {
            stream_id: 7,
            data_table: "uu_bgu_data".to_string(),
        };
        registry.insert_for_test(&id, entry.clone());
        assert_eq!(registry.resolve_cached(&id), Some(entry));
    }

    #[test]
    fn cached_channels_for_station_filters_by_net_sta_prefix() {
        let registry = StreamRegistry::new(None);
        let hhz = StreamIdentity::new("uu", "bgu", "hhz", None);
        let hhn = StreamIdentity::new("uu", "bgu", "hhn", Some("01"));
        let other_station = StreamIdentity::new("uu", "zzz", "hhz", None);
        registry.insert_for_test(
            &hhz,
            StreamEntry {
                stream_id: 1,
                data_table: "uu_bgu_data".to_string(),
            },
        );
        registry.insert_for_test(
            &hhn,
            StreamEntry {
                stream_id: 2,
                data_table: "uu_bgu_data".to_string(),
            },
        );
        registry.insert_for_test(
            &other_station,
            StreamEntry {
                stream_id: 3,
                data_table: "uu_zzz_data".to_string(),
            },
        );

        let mut found = registry.cached_channels_for_station("uu", "bgu");
        found.sort_by_key(|(identity, _)| identity.channel.clone());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, hhn);
        assert_eq!(found[1].0, hhz);
    }
}
