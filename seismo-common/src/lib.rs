pub mod codec;
pub mod packet;

pub use packet::{
    DataType, Packet, PacketError, SampleArray, SampleSlice, Timestamp, samples_bitwise_eq,
    timestamp_from_seconds,
};
