use time::OffsetDateTime;

/// Encodes a 12-byte ttyrec frame header: little-endian `(sec: i32, usec:
/// i32, length: i32)`.
///
/// The timestamp is sampled fresh for every frame (no batching), so the
/// header always reflects the instant the write actually happened, not the
/// session start time.
pub fn frame_header(now: OffsetDateTime, length: usize) -> [u8; 12] {
    let sec = now.unix_timestamp() as i32;
    // `OffsetDateTime::microsecond()` is in [0, 999_999] within the second.
    let usec = (now.nanosecond() / 1_000) as i32;
    let mut header = [0u8; 12];
    header[0..4].copy_from_slice(&sec.to_le_bytes());
    header[4..8].copy_from_slice(&usec.to_le_bytes());
    header[8..12].copy_from_slice(&(length as i32).to_le_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn encodes_little_endian_fields() {
        let now = datetime!(2024-01-02 03:04:05.5 UTC);
        let header = frame_header(now, 42);

        let sec = i32::from_le_bytes(header[0..4].try_into().unwrap());
        let usec = i32::from_le_bytes(header[4..8].try_into().unwrap());
        let length = i32::from_le_bytes(header[8..12].try_into().unwrap());

        assert_eq!(sec, now.unix_timestamp() as i32);
        assert_eq!(usec, 500_000);
        assert_eq!(length, 42);
    }
}
