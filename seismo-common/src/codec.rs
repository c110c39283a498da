//! Little-endian, optionally-deflated binary packing of sample arrays.
//!
//! Mirrors the wire format written by the original packing routines: every
//! encoded buffer is little-endian regardless of host byte order, and
//! deflate compression is applied to the packed bytes (not the samples
//! directly) when requested.

use std::io::{Read, Write};

use flate2::{Compression as DeflateLevel, read::DeflateDecoder, write::DeflateEncoder};

/// Deflate compression level applied to an encoded sample buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    Fast,
    #[default]
    Best,
}

impl Compression {
    fn to_deflate_level(self) -> Option<DeflateLevel> {
        match self {
            Compression::None => None,
            Compression::Fast => Some(DeflateLevel::fast()),
            Compression::Best => Some(DeflateLevel::best()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("decoded payload length {actual} does not match expected {expected} bytes")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("deflate failure: {0}")]
    Deflate(#[from] std::io::Error),
}

/// Sealed trait for the fixed-width numeric sample types the codec supports.
pub trait SampleElement: Copy + Sized + private::Sealed {
    const SIZE: usize;
    fn to_le_bytes_vec(self) -> Vec<u8>;
    fn from_le_bytes_slice(bytes: &[u8]) -> Self;
}

mod private {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

macro_rules! impl_sample_element {
    ($t:ty) => {
        impl SampleElement for $t {
            const SIZE: usize = std::mem::size_of::<$t>();
            fn to_le_bytes_vec(self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
            fn from_le_bytes_slice(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }
        }
    };
}

impl_sample_element!(i32);
impl_sample_element!(i64);
impl_sample_element!(f32);
impl_sample_element!(f64);

/// Packs `samples` as little-endian bytes, optionally deflating the result.
///
/// Returns `(bytes, compressed)`. `compressed` is false whenever deflating
/// the packed bytes would not have been requested, or when there were no
/// samples to pack.
pub fn encode<T: SampleElement>(samples: &[T], compression: Compression) -> (Vec<u8>, bool) {
    if samples.is_empty() {
        return (Vec::new(), false);
    }
    let mut packed = Vec::with_capacity(samples.len() * T::SIZE);
    for &s in samples {
        packed.extend_from_slice(&s.to_le_bytes_vec());
    }
    match compression.to_deflate_level() {
        None => (packed, false),
        Some(level) => {
            let mut encoder = DeflateEncoder::new(Vec::new(), level);
            encoder
                .write_all(&packed)
                .expect("writing to an in-memory encoder cannot fail");
            let compressed = encoder.finish().expect("in-memory deflate cannot fail");
            (compressed, true)
        }
    }
}

/// Packs a raw text payload. Text is never byte-swapped; compression, if
/// requested, is applied to the bytes as-is.
pub fn encode_text(bytes: &[u8], compression: Compression) -> (Vec<u8>, bool) {
    if bytes.is_empty() {
        return (Vec::new(), false);
    }
    match compression.to_deflate_level() {
        None => (bytes.to_vec(), false),
        Some(level) => {
            let mut encoder = DeflateEncoder::new(Vec::new(), level);
            encoder
                .write_all(bytes)
                .expect("writing to an in-memory encoder cannot fail");
            (
                encoder.finish().expect("in-memory deflate cannot fail"),
                true,
            )
        }
    }
}

/// Unpacks `n` little-endian samples of type `T` from `bytes`, inflating
/// first if `compressed`, and byte-swapping per element iff the host is not
/// little-endian.
pub fn decode<T: SampleElement>(
    bytes: &[u8],
    n: usize,
    compressed: bool,
) -> Result<Vec<T>, CodecError> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let raw = inflate_if_needed(bytes, compressed)?;
    let expected = n * T::SIZE;
    if raw.len() != expected {
        return Err(CodecError::LengthMismatch {
            expected,
            actual: raw.len(),
        });
    }
    let mut out = Vec::with_capacity(n);
    for chunk in raw.chunks_exact(T::SIZE) {
        out.push(T::from_le_bytes_slice(chunk));
    }
    Ok(out)
}

/// Unpacks a raw text payload, inflating first if `compressed`.
pub fn decode_text(bytes: &[u8], n: usize, compressed: bool) -> Result<Vec<u8>, CodecError> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let raw = inflate_if_needed(bytes, compressed)?;
    if raw.len() != n {
        return Err(CodecError::LengthMismatch {
            expected: n,
            actual: raw.len(),
        });
    }
    Ok(raw)
}

fn inflate_if_needed(bytes: &[u8], compressed: bool) -> Result<Vec<u8>, CodecError> {
    if !compressed {
        return Ok(bytes.to_vec());
    }
    let mut decoder = DeflateDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn roundtrip<T: SampleElement + PartialEq + std::fmt::Debug>(
        samples: Vec<T>,
        compression: Compression,
    ) {
        let (bytes, compressed) = encode(&samples, compression);
        let decoded: Vec<T> = decode(&bytes, samples.len(), compressed).unwrap();
        assert_eq!(samples, decoded);
    }

    proptest! {
        #[test]
        fn roundtrips_i32(samples in proptest::collection::vec(any::<i32>(), 0..512)) {
            roundtrip(samples.clone(), Compression::None);
            roundtrip(samples, Compression::Best);
        }

        #[test]
        fn roundtrips_f64(samples in proptest::collection::vec(any::<f64>(), 0..512)) {
            roundtrip(samples.clone(), Compression::None);
            roundtrip(samples, Compression::Best);
        }
    }

    #[test]
    fn text_roundtrips_through_compression() {
        let text = b"IU.ANMO.00.BHZ".to_vec();
        let (bytes, compressed) = encode_text(&text, Compression::Best);
        assert!(compressed);
        let decoded = decode_text(&bytes, text.len(), compressed).unwrap();
        assert_eq!(text, decoded);
    }

    #[test]
    fn empty_input_never_compresses() {
        let (bytes, compressed): (Vec<u8>, bool) = encode::<i32>(&[], Compression::Best);
        assert!(bytes.is_empty());
        assert!(!compressed);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let err = decode::<i32>(&[0u8; 3], 1, false).unwrap_err();
        assert!(matches!(err, CodecError::LengthMismatch { .. }));
    }
}
