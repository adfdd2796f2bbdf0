use crate::types::{CompressionKind, Result};
use crate::WimError;

pub mod lzx;
pub mod xpress;

/// Compresses one chunk of a stream.
///
/// Returns `None` when the chunk did not shrink: the output would have been
/// as large as the input or larger, or the input is too small to carry the
/// codec's framing. Callers store the chunk raw in that case. Any internal
/// failure is also reported as "did not shrink"; this function never errors.
pub fn compress_chunk(data: &[u8], kind: CompressionKind) -> Option<Vec<u8>> {
    let out = match kind {
        CompressionKind::None => return None,
        CompressionKind::Xpress => xpress::compress(data)?,
        CompressionKind::Lzx => lzx::compress(data)?,
    };
    debug_assert!(out.len() < data.len());
    Some(out)
}

/// Decompresses one chunk back to exactly `expected_len` bytes.
pub fn decompress_chunk(data: &[u8], expected_len: usize, kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::None => Err(WimError::Decompression(
            "uncompressed resources carry no compressed chunks".to_string(),
        )),
        CompressionKind::Xpress => xpress::decompress(data, expected_len)
            .map_err(|err| WimError::Decompression(format!("xpress chunk: {err}"))),
        CompressionKind::Lzx => lzx::decompress(data, expected_len)
            .map_err(|err| WimError::Decompression(format!("lzx chunk: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i / 7) % 251) as u8).collect()
    }

    #[test]
    fn both_kinds_round_trip() {
        let data = sample(20_000);
        for kind in [CompressionKind::Xpress, CompressionKind::Lzx] {
            let packed = compress_chunk(&data, kind).expect("repetitive data shrinks");
            assert!(packed.len() < data.len());
            let unpacked = decompress_chunk(&packed, data.len(), kind).unwrap();
            assert_eq!(unpacked, data);
        }
    }

    #[test]
    fn incompressible_data_reports_no_shrink() {
        // Xorshift noise has no LZ structure to exploit.
        let mut state = 0x2545_f491_4f6c_dd1d_u64;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        assert!(compress_chunk(&data, CompressionKind::Xpress).is_none());
        assert!(compress_chunk(&data, CompressionKind::Lzx).is_none());
    }

    #[test]
    fn none_kind_never_shrinks() {
        assert!(compress_chunk(&sample(1024), CompressionKind::None).is_none());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let data = sample(8192);
        for kind in [CompressionKind::Xpress, CompressionKind::Lzx] {
            let packed = compress_chunk(&data, kind).unwrap();
            let err = decompress_chunk(&packed[..packed.len() / 2], data.len(), kind);
            assert!(err.is_err());
        }
    }
}
