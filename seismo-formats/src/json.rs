//! Structured JSON export: one document per stream, each carrying the
//! packets belonging to it sorted by start time.

use std::collections::BTreeMap;

use seismo_common::{Packet, SampleArray};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonSample {
    pub start_time_microseconds: i64,
    pub sampling_rate: f64,
    pub data_type: &'static str,
    pub data: JsonSampleData,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum JsonSampleData {
    Integer32(Vec<i32>),
    Integer64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Null,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonStream {
    pub network: String,
    pub station: String,
    pub channel: String,
    pub location_code: String,
    pub samples: Vec<JsonSample>,
}

pub type JsonStreamDocument = Vec<JsonStream>;

/// Groups packets by canonical stream name and emits one [`JsonStream`]
/// entry per group, samples sorted ascending by start time. Empty
/// `location_code` is emitted as `"--"` per the stored-row convention.
pub fn to_json_document(packets: &[Packet]) -> JsonStreamDocument {
    let mut groups: BTreeMap<(String, String, String, String), Vec<&Packet>> = BTreeMap::new();
    for packet in packets {
        let key = (
            packet.network().unwrap_or_default().to_string(),
            packet.station().unwrap_or_default().to_string(),
            packet.channel().unwrap_or_default().to_string(),
            packet.location().unwrap_or_default().to_string(),
        );
        groups.entry(key).or_default().push(packet);
    }

    groups
        .into_iter()
        .map(|((network, station, channel, location), mut members)| {
            members.sort_by_key(|p| p.start_time());
            let location_code = if location.is_empty() {
                "--".to_string()
            } else {
                location
            };
            let samples = members
                .into_iter()
                .map(|p| {
                    let (data_type, data) = sample_json(p);
                    JsonSample {
                        start_time_microseconds: p.start_time(),
                        sampling_rate: p.sampling_rate().unwrap_or(0.0),
                        data_type,
                        data,
                    }
                })
                .collect::<Vec<_>>();
            JsonStream {
                network,
                station,
                channel,
                location_code,
                samples,
            }
        })
        .collect()
}

fn sample_json(packet: &Packet) -> (&'static str, JsonSampleData) {
    match packet.data() {
        SampleArray::Empty | SampleArray::Text(_) => ("unknown", JsonSampleData::Null),
        SampleArray::I32(v) => ("integer32", JsonSampleData::Integer32(v.clone())),
        SampleArray::I64(v) => ("integer64", JsonSampleData::Integer64(v.clone())),
        SampleArray::F32(v) => ("float32", JsonSampleData::Float32(v.clone())),
        SampleArray::F64(v) => ("float64", JsonSampleData::Float64(v.clone())),
    }
}

#[cfg(test)]
mod test {
    use seismo_common::Packet;

    use super::*;

    fn packet(net: &str, sta: &str, start: i64, rate: f64, n: usize) -> Packet {
        let mut p = Packet::new();
        p.set_network(net).unwrap();
        p.set_station(sta).unwrap();
        p.set_channel("BHZ").unwrap();
        p.set_sampling_rate(rate).unwrap();
        p.set_start_time(start);
        p.set_data(SampleArray::I32((0..n as i32).collect()));
        p
    }

    #[test]
    fn groups_by_stream_and_sorts_by_time() {
        let packets = vec![
            packet("IU", "ANMO", 2_000_000, 100.0, 10),
            packet("IU", "ANMO", 1_000_000, 100.0, 10),
            packet("IU", "COLA", 1_000_000, 100.0, 10),
        ];
        let doc = to_json_document(&packets);
        assert_eq!(doc.len(), 2);
        let anmo = doc.iter().find(|s| s.station == "ANMO").unwrap();
        assert_eq!(anmo.samples.len(), 2);
        assert_eq!(anmo.samples[0].start_time_microseconds, 1_000_000);
        assert_eq!(anmo.location_code, "--");
    }

    #[test]
    fn serializes_to_the_documented_wire_shape() {
        let doc = to_json_document(&[packet("IU", "ANMO", 1_000_000, 100.0, 3)]);
        let value = serde_json::to_value(&doc).unwrap();
        let stream = &value[0];
        assert_eq!(stream["network"], "IU");
        assert_eq!(stream["locationCode"], "--");
        assert_eq!(stream["samples"][0]["startTimeMicroseconds"], 1_000_000);
        assert_eq!(stream["samples"][0]["dataType"], "integer32");
    }
}
