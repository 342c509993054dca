//! 16비트 순환 시퀀스 번호
//!
//! 거리가 창의 절반 이하이면 "더 새로움".

/// 시퀀스 번호 공간 크기
pub const NUM_SEQUENCE_NUMBERS: u32 = 1 << 16;

/// 신뢰 채널 창 크기
pub const RELIABLE_WINDOW_SIZE: u16 = 64;

/// `a - b` 를 순환 고려해 부호 있는 거리로
pub fn relative(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

/// `a`가 `b`보다 새로운지
pub fn is_newer(a: u16, b: u16) -> bool {
    relative(a, b) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_around_wrap() {
        assert_eq!(relative(1, 0), 1);
        assert_eq!(relative(0, 1), -1);
        assert_eq!(relative(0, u16::MAX), 1);
        assert_eq!(relative(u16::MAX, 0), -1);
        assert_eq!(relative(10, 65530), 16);
        assert!(is_newer(3, 65000));
        assert!(!is_newer(65000, 3));
        assert!(!is_newer(7, 7));
    }

    #[test]
    fn test_full_window_returns_to_self() {
        for &start in &[0u16, 1, 1000, 32767, 32768, 65535] {
            let advanced = ((start as u32 + NUM_SEQUENCE_NUMBERS) % NUM_SEQUENCE_NUMBERS) as u16;
            assert_eq!(advanced, start);
            assert_eq!(start.wrapping_add(NUM_SEQUENCE_NUMBERS as u16), start);
        }
    }

    #[test]
    fn test_consistent_with_modulo_arithmetic() {
        // 절반 창 이내의 거리는 모듈로 차이와 일치하고 반대칭
        let samples = [0u16, 5, 300, 32000, 40000, 65535];
        for &a in &samples {
            for d in [-32767i32, -1000, -1, 0, 1, 77, 32767] {
                let b = (a as i32 + d).rem_euclid(NUM_SEQUENCE_NUMBERS as i32) as u16;
                assert_eq!(relative(b, a), d);
                assert_eq!(relative(a, b), -d);
            }
        }
    }

    #[test]
    fn test_is_newer_transitive_within_half_window() {
        let base = 65500u16;
        let steps = [1u16, 10, 100, 1000];
        for &x in &steps {
            for &y in &steps {
                let b = base.wrapping_add(x);
                let c = b.wrapping_add(y);
                assert!(is_newer(b, base));
                assert!(is_newer(c, b));
                assert!(is_newer(c, base));
            }
        }
    }
}
