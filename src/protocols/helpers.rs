use crate::errors::{Error, Result};

use bzip2::read::BzDecoder;
use std::io::Read;

/// Largest decompressed reply we accept. The declared size comes from the server.
pub const MAX_DECOMPRESSED_SIZE: usize = 1 << 20;

/// Inflates a BZIP2 payload. At most one byte past `expected_len` is produced, so an
/// oversized stream still shows up as a length mismatch without being inflated in full.
pub fn decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    if expected_len > MAX_DECOMPRESSED_SIZE {
        return Err(Error::SizeMismatch {
            expected: MAX_DECOMPRESSED_SIZE,
            actual: expected_len,
        });
    }
    let mut out = Vec::with_capacity(expected_len);
    BzDecoder::new(data)
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(Error::Decompression)?;
    Ok(out)
}

pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
pub(crate) fn compress(data: &[u8]) -> Vec<u8> {
    use bzip2::{write::BzEncoder, Compression};
    use std::io::Write;

    let mut enc = BzEncoder::new(Vec::new(), Compression::best());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}
