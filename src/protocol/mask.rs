//! Payload masking transform (RFC 6455 Section 5.3).

/// XOR `data` with the 4-byte mask key, starting at rolling position `pos`,
/// and return the position for the next chunk.
///
/// Keying the transform off `pos % 4` keeps continuity when one frame's
/// payload is unmasked across several reads. Applying the transform twice
/// with the same key and starting position restores the original bytes.
pub fn apply_mask(key: [u8; 4], pos: usize, data: &mut [u8]) -> usize {
    // Rotate the key by the starting offset so whole words can be XORed.
    let rotated = [
        key[pos % 4],
        key[(pos + 1) % 4],
        key[(pos + 2) % 4],
        key[(pos + 3) % 4],
    ];
    let word = u32::from_ne_bytes(rotated);

    let mut chunks = data.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let value = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&value.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= rotated[i % 4];
    }

    (pos + data.len()) % 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_known_vector() {
        // "Hello" under 0x37fa213d is the RFC's worked example.
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut data = *b"Hello";
        apply_mask(key, 0, &mut data);
        assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }

    #[test]
    fn test_mask_involutive() {
        let key = [0x12, 0x34, 0x56, 0x78];
        let original: Vec<u8> = (0..=255).collect();
        let mut data = original.clone();
        apply_mask(key, 0, &mut data);
        assert_ne!(data, original);
        apply_mask(key, 0, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_mask_zero_key_is_identity() {
        let original: Vec<u8> = (0..100).collect();
        let mut data = original.clone();
        let pos = apply_mask([0, 0, 0, 0], 3, &mut data);
        assert_eq!(data, original);
        assert_eq!(pos, (3 + 100) % 4);
    }

    #[test]
    fn test_mask_continuity_across_chunks() {
        let key = [0xde, 0xad, 0xbe, 0xef];
        let original: Vec<u8> = (0..64).map(|i| i * 3).collect();

        let mut whole = original.clone();
        apply_mask(key, 0, &mut whole);

        // Unmasking in odd-sized chunks with the rolling position must agree
        // with the single-shot transform.
        for split in [1, 3, 4, 7, 63] {
            let mut chunked = original.clone();
            let mut pos = 0;
            let mut offset = 0;
            while offset < chunked.len() {
                let end = (offset + split).min(chunked.len());
                pos = apply_mask(key, pos, &mut chunked[offset..end]);
                offset = end;
            }
            assert_eq!(chunked, whole, "split={split}");
            assert_eq!(pos, original.len() % 4);
        }
    }

    #[test]
    fn test_mask_nonzero_start_position() {
        let key = [0x01, 0x02, 0x03, 0x04];
        let mut data = [0u8; 6];
        apply_mask(key, 2, &mut data);
        assert_eq!(data, [0x03, 0x04, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_mask_empty_slice() {
        let mut data = [];
        assert_eq!(apply_mask([1, 2, 3, 4], 1, &mut data), 1);
    }
}
