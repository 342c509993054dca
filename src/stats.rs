//! 전송 통계

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// RTT 샘플 윈도우 크기
const RTT_WINDOW: usize = 10;

/// 왕복 시간 추정기
///
/// 지수 평활 평균과 최근 샘플 윈도우를 함께 유지.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    average: Option<f64>,
    samples: VecDeque<f64>,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            average: None,
            samples: VecDeque::with_capacity(RTT_WINDOW),
        }
    }

    /// RTT 샘플 기록 (초)
    pub fn record(&mut self, rtt: f64) {
        let rtt = rtt.max(0.0);
        if self.samples.len() >= RTT_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);

        self.average = Some(match self.average {
            None => rtt,
            Some(avg) => avg * 0.7 + rtt * 0.3,
        });
    }

    /// 평활 평균 RTT (초)
    pub fn average(&self) -> Option<f64> {
        self.average
    }

    /// 최근 윈도우의 최소 RTT (초)
    pub fn minimum(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::min)
    }

    /// 재전송 지연: 기본 지연 + RTT × 배수
    pub fn resend_delay(&self, base: Duration, multiplier: f32) -> Duration {
        let rtt = self.average.unwrap_or(0.1);
        base + Duration::from_secs_f64(rtt * multiplier as f64)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// 연결별 통계
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatistics {
    /// 보낸 데이터그램 수
    pub sent_packets: u64,

    /// 받은 데이터그램 수
    pub received_packets: u64,

    pub sent_bytes: u64,

    pub received_bytes: u64,

    /// 처음 보낸 메시지 수 (재전송 제외)
    pub sent_messages: u64,

    /// 애플리케이션에 전달한 메시지 수
    pub received_messages: u64,

    /// 재전송 메시지 수
    pub resent_messages: u64,

    /// 중복으로 버린 메시지 수
    pub dropped_duplicates: u64,

    /// 오래되었거나 창 밖이라 버린 메시지 수
    pub dropped_stale: u64,

    /// 받은 분할 조각 수
    pub received_fragments: u64,

    /// 큐에 쌓였거나 확인 대기 중인 송신 메시지 수
    pub pending_messages: u64,
}

impl ConnectionStatistics {
    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Packets: {}/{} | Bytes: {}/{} | Messages: {}/{} | Resent: {} | Dup: {} | Stale: {} | Pending: {}",
            self.sent_packets,
            self.received_packets,
            self.sent_bytes,
            self.received_bytes,
            self.sent_messages,
            self.received_messages,
            self.resent_messages,
            self.dropped_duplicates,
            self.dropped_stale,
            self.pending_messages,
        )
    }
}

/// 피어 전체 통계
#[derive(Debug, Clone)]
pub struct PeerStatistics {
    /// 시작 시간
    pub start_time: Instant,

    pub sent_packets: u64,

    pub received_packets: u64,

    pub sent_bytes: u64,

    pub received_bytes: u64,

    /// 시뮬레이션 손실로 버린 데이터그램 수
    pub simulated_dropped_packets: u64,

    /// 해석하지 못한 데이터그램 수
    pub malformed_packets: u64,

    /// 현재 연결 수
    pub connections: usize,

    /// 진행 중인 핸드쉐이크 수
    pub handshakes: usize,

    /// 풀에 보관 중인 버퍼 수
    pub pooled_buffers: usize,
}

impl PeerStatistics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sent_packets: 0,
            received_packets: 0,
            sent_bytes: 0,
            received_bytes: 0,
            simulated_dropped_packets: 0,
            malformed_packets: 0,
            connections: 0,
            handshakes: 0,
            pooled_buffers: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 전체 송신 처리율 (bytes/sec)
    pub fn send_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.sent_bytes as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Connections: {} (+{} handshaking) | Packets: {}/{} | Bytes: {}/{} | Send: {:.2} KB/s | Malformed: {}",
            self.elapsed().as_secs_f64(),
            self.connections,
            self.handshakes,
            self.sent_packets,
            self.received_packets,
            self.sent_bytes,
            self.received_bytes,
            self.send_throughput() / 1_000.0,
            self.malformed_packets,
        )
    }
}

impl Default for PeerStatistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_first_sample_sets_average() {
        let mut rtt = RttEstimator::new();
        assert_eq!(rtt.average(), None);
        rtt.record(0.1);
        assert_eq!(rtt.average(), Some(0.1));
        rtt.record(0.2);
        let avg = rtt.average().unwrap();
        assert!((avg - 0.13).abs() < 1e-9);
        assert_eq!(rtt.minimum(), Some(0.1));
    }

    #[test]
    fn test_resend_delay_grows_with_rtt() {
        let mut rtt = RttEstimator::new();
        rtt.record(0.05);
        let delay = rtt.resend_delay(Duration::from_millis(25), 2.0);
        assert_eq!(delay, Duration::from_millis(125));
    }

    #[test]
    fn test_rtt_window_bounded() {
        let mut rtt = RttEstimator::new();
        for i in 0..50 {
            rtt.record(1.0 + i as f64);
        }
        assert_eq!(rtt.minimum(), Some(41.0));
    }
}
