//! CRC32 체크섬 유틸리티
//!
//! 전송 계층 무결성과 별개로 바이트 페이로드를 종단 간 검증할 때 사용.

/// 데이터그램 끝 체크섬 크기
pub const CHECKSUM_SIZE: usize = 4;

/// 지정 구간의 CRC32
///
/// # Panics
/// `offset + length`가 `bytes` 범위를 벗어나면 패닉. 범위를 모르는 입력은 [`verify`] 사용.
pub fn digest(bytes: &[u8], offset: usize, length: usize) -> u32 {
    crc32fast::hash(&bytes[offset..offset + length])
}

/// 지정 구간이 주어진 CRC32와 일치하는지 확인. 범위를 벗어나면 false
pub fn verify(expected: u32, bytes: &[u8], offset: usize, length: usize) -> bool {
    let Some(end) = offset.checked_add(length) else {
        return false;
    };
    match bytes.get(offset..end) {
        Some(slice) => crc32fast::hash(slice) == expected,
        None => false,
    }
}

/// 데이터그램 끝에 CRC32 (LE) 추가
pub fn append(datagram: &mut Vec<u8>) {
    let crc = digest(datagram, 0, datagram.len());
    datagram.extend_from_slice(&crc.to_le_bytes());
}

/// 끝 4바이트 CRC32를 검증하고 본문 길이 반환
pub fn strip(datagram: &[u8]) -> Option<usize> {
    if datagram.len() < CHECKSUM_SIZE {
        return None;
    }
    let body = datagram.len() - CHECKSUM_SIZE;
    let expected = u32::from_le_bytes([
        datagram[body],
        datagram[body + 1],
        datagram[body + 2],
        datagram[body + 3],
    ]);
    verify(expected, datagram, 0, body).then_some(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_and_verify_range() {
        let data = b"xxhello worldyy";
        let crc = digest(data, 2, 11);
        assert_eq!(crc, crc32fast::hash(b"hello world"));
        assert!(verify(crc, data, 2, 11));
        assert!(!verify(crc, data, 0, 11));
        assert!(!verify(crc, data, 10, 11));
    }

    #[test]
    #[should_panic]
    fn test_digest_out_of_range_panics() {
        digest(b"short", 3, 10);
    }

    #[test]
    fn test_verify_out_of_range_is_false() {
        assert!(!verify(0, b"short", 3, 10));
        assert!(!verify(0, b"short", usize::MAX, 2));
    }

    #[test]
    fn test_append_strip() {
        let mut datagram = vec![1, 2, 3, 4, 5];
        append(&mut datagram);
        assert_eq!(strip(&datagram), Some(5));

        datagram[0] ^= 1;
        assert_eq!(strip(&datagram), None);
    }
}
