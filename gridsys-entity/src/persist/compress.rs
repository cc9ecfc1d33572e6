// Layer 1: Standard library imports
use std::io::{Read, Write};

// Layer 2: Third-party crate imports
use bytes::Bytes;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

// Layer 3: Internal module imports
use super::store::PersistError;

/// Compression applied to persisted payloads.
///
/// The written blob starts with one header byte identifying the algorithm,
/// so reads are transparent regardless of the writing node's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionAlgorithm {
    /// Pass payloads through unchanged.
    #[default]
    None,
    /// Deflate-compress payloads.
    Deflate,
}

const HEADER_NONE: u8 = 0;
const HEADER_DEFLATE: u8 = 1;

/// Frame `data` with a compression header, compressing per `algorithm`.
///
/// Public so store tooling and tests can produce payloads the runtime
/// reads back transparently.
pub fn compress(algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Bytes, PersistError> {
    match algorithm {
        CompressionAlgorithm::None => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(HEADER_NONE);
            out.extend_from_slice(data);
            Ok(Bytes::from(out))
        }
        CompressionAlgorithm::Deflate => {
            let mut encoder = DeflateEncoder::new(vec![HEADER_DEFLATE], Compression::default());
            encoder
                .write_all(data)
                .and_then(|()| encoder.finish())
                .map(Bytes::from)
                .map_err(|err| PersistError::Compression { reason: err.to_string() })
        }
    }
}

/// Undo [`compress`], sniffing the algorithm from the header byte.
pub fn decompress(blob: &[u8]) -> Result<Vec<u8>, PersistError> {
    let Some((&header, body)) = blob.split_first() else {
        return Err(PersistError::Compression { reason: "empty payload".to_string() });
    };
    match header {
        HEADER_NONE => Ok(body.to_vec()),
        HEADER_DEFLATE => {
            let mut out = Vec::new();
            DeflateDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|err| PersistError::Compression { reason: err.to_string() })?;
            Ok(out)
        }
        other => Err(PersistError::UnknownCompression { header: other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_roundtrip() {
        let blob = compress(CompressionAlgorithm::None, b"payload").unwrap();
        assert_eq!(blob[0], HEADER_NONE);
        assert_eq!(decompress(&blob).unwrap(), b"payload");
    }

    #[test]
    fn test_deflate_roundtrip_and_shrinks() {
        let data = vec![b'x'; 4096];
        let blob = compress(CompressionAlgorithm::Deflate, &data).unwrap();
        assert_eq!(blob[0], HEADER_DEFLATE);
        assert!(blob.len() < data.len() / 4, "deflate did not shrink: {} bytes", blob.len());
        assert_eq!(decompress(&blob).unwrap(), data);
    }

    #[test]
    fn test_reads_are_transparent_across_configs() {
        // Written with deflate, readable by a node configured for none.
        let blob = compress(CompressionAlgorithm::Deflate, b"cross").unwrap();
        assert_eq!(decompress(&blob).unwrap(), b"cross");
    }

    #[test]
    fn test_unknown_header_rejected() {
        assert!(matches!(
            decompress(&[42, 1, 2, 3]),
            Err(PersistError::UnknownCompression { header: 42 })
        ));
        assert!(matches!(decompress(&[]), Err(PersistError::Compression { .. })));
    }
}
