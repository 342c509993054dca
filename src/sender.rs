//! 채널별 송신자
//!
//! - 비신뢰: 큐에 든 메시지를 한 번만 전송 (Sequenced는 시퀀스 번호 부여)
//! - 신뢰: 64칸 창 안에서 확인될 때까지 보관하고 재전송
//!
//! 재전송 지연은 `기본 지연 + RTT × 배수`. 최대 재전송 횟수를 넘으면 연결 실패.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::chunk::FragmentHeader;
use crate::message::{DeliveryMethod, MessageType};
use crate::pool::SharedPayload;
use crate::sequence::{relative, RELIABLE_WINDOW_SIZE};
use crate::wire::WireMessage;

/// 채널 큐에 든 송신 메시지 (분할된 경우 청크 하나)
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: SharedPayload,
    pub fragment: Option<FragmentHeader>,
}

/// 재전송 한도 초과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooManyResends {
    pub sequence: u16,
    pub attempts: u32,
}

/// 한 번의 송신 처리 결과
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    /// 처음 보낸 메시지 수
    pub sent: usize,
    /// 재전송한 메시지 수
    pub resent: usize,
}

/// 재전송 정책
#[derive(Debug, Clone, Copy)]
pub struct ResendPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

/// 비신뢰 송신자 (Unreliable / Sequenced)
#[derive(Debug)]
pub struct UnreliableSender {
    message_type: MessageType,
    queue: VecDeque<QueuedMessage>,
    send_sequence: u16,
}

impl UnreliableSender {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            queue: VecDeque::new(),
            send_sequence: 0,
        }
    }

    fn send_queued(&mut self, out: &mut Vec<WireMessage>) -> SendReport {
        let mut report = SendReport::default();
        while let Some(message) = self.queue.pop_front() {
            let sequence = if self.message_type.has_sequence() {
                let sequence = self.send_sequence;
                self.send_sequence = self.send_sequence.wrapping_add(1);
                sequence
            } else {
                0
            };

            out.push(WireMessage {
                message_type: self.message_type,
                sequence,
                fragment: message.fragment,
                payload: message.payload,
            });
            report.sent += 1;
        }
        report
    }
}

/// 확인 대기 중인 메시지
#[derive(Debug)]
struct StoredMessage {
    message: QueuedMessage,
    sequence: u16,
    last_sent: Instant,
    num_sent: u32,
}

/// 신뢰 송신자
#[derive(Debug)]
pub struct ReliableSender {
    message_type: MessageType,
    queue: VecDeque<QueuedMessage>,

    /// 가장 오래된 미확인 시퀀스
    window_start: u16,

    /// 다음에 부여할 시퀀스
    send_start: u16,

    /// 시퀀스 % 창 크기 위치에 보관
    stored: Vec<Option<StoredMessage>>,
}

impl ReliableSender {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            queue: VecDeque::new(),
            window_start: 0,
            send_start: 0,
            stored: (0..RELIABLE_WINDOW_SIZE).map(|_| None).collect(),
        }
    }

    fn slot(sequence: u16) -> usize {
        (sequence % RELIABLE_WINDOW_SIZE) as usize
    }

    /// 창에 남은 칸 수
    pub fn free_window_slots(&self) -> usize {
        RELIABLE_WINDOW_SIZE as usize - relative(self.send_start, self.window_start) as usize
    }

    pub fn window_start(&self) -> u16 {
        self.window_start
    }

    fn send_queued(
        &mut self,
        now: Instant,
        policy: ResendPolicy,
        out: &mut Vec<WireMessage>,
    ) -> Result<SendReport, TooManyResends> {
        let mut report = SendReport::default();

        for stored in self.stored.iter_mut().flatten() {
            if now.saturating_duration_since(stored.last_sent) < policy.delay {
                continue;
            }
            if stored.num_sent > policy.max_attempts {
                return Err(TooManyResends {
                    sequence: stored.sequence,
                    attempts: stored.num_sent,
                });
            }

            trace!(
                "재전송: type {} seq {} (attempt {})",
                self.message_type.code(),
                stored.sequence,
                stored.num_sent + 1
            );
            out.push(WireMessage {
                message_type: self.message_type,
                sequence: stored.sequence,
                fragment: stored.message.fragment,
                payload: stored.message.payload.clone(),
            });
            stored.last_sent = now;
            stored.num_sent += 1;
            report.resent += 1;
        }

        while self.free_window_slots() > 0 {
            let Some(message) = self.queue.pop_front() else {
                break;
            };

            let sequence = self.send_start;
            self.send_start = self.send_start.wrapping_add(1);

            out.push(WireMessage {
                message_type: self.message_type,
                sequence,
                fragment: message.fragment,
                payload: message.payload.clone(),
            });
            self.stored[Self::slot(sequence)] = Some(StoredMessage {
                message,
                sequence,
                last_sent: now,
                num_sent: 1,
            });
            report.sent += 1;
        }

        Ok(report)
    }

    /// 확인 수신. 보관 중이던 메시지를 해제했으면 true
    pub fn receive_acknowledge(&mut self, sequence: u16) -> bool {
        let offset = relative(sequence, self.window_start);
        if offset < 0 || offset >= relative(self.send_start, self.window_start) {
            trace!("창 밖 확인 무시: seq {} (window {})", sequence, self.window_start);
            return false;
        }

        let slot = Self::slot(sequence);
        let released = matches!(&self.stored[slot], Some(stored) if stored.sequence == sequence);
        if released {
            self.stored[slot] = None;
        }

        while self.window_start != self.send_start
            && self.stored[Self::slot(self.window_start)].is_none()
        {
            self.window_start = self.window_start.wrapping_add(1);
        }

        released
    }
}

/// 연결의 채널 슬롯 하나
#[derive(Debug)]
pub enum SenderChannel {
    Unreliable(UnreliableSender),
    Reliable(ReliableSender),
}

impl SenderChannel {
    pub fn new(method: DeliveryMethod, channel: u8) -> Self {
        let message_type = MessageType::user(method, channel);
        if method.is_reliable() {
            SenderChannel::Reliable(ReliableSender::new(message_type))
        } else {
            SenderChannel::Unreliable(UnreliableSender::new(message_type))
        }
    }

    pub fn enqueue(&mut self, message: QueuedMessage) {
        match self {
            SenderChannel::Unreliable(sender) => sender.queue.push_back(message),
            SenderChannel::Reliable(sender) => sender.queue.push_back(message),
        }
    }

    /// 큐 비우기와 재전송을 `out`에 기록
    pub fn send_queued(
        &mut self,
        now: Instant,
        policy: ResendPolicy,
        out: &mut Vec<WireMessage>,
    ) -> Result<SendReport, TooManyResends> {
        match self {
            SenderChannel::Unreliable(sender) => Ok(sender.send_queued(out)),
            SenderChannel::Reliable(sender) => sender.send_queued(now, policy, out),
        }
    }

    pub fn receive_acknowledge(&mut self, sequence: u16) -> bool {
        match self {
            SenderChannel::Unreliable(_) => false,
            SenderChannel::Reliable(sender) => sender.receive_acknowledge(sequence),
        }
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> Vec<&QueuedMessage> {
        match self {
            SenderChannel::Unreliable(sender) => sender.queue.iter().collect(),
            SenderChannel::Reliable(sender) => sender.queue.iter().collect(),
        }
    }

    /// 큐에 있거나 확인을 기다리는 메시지 수
    pub fn pending_count(&self) -> usize {
        match self {
            SenderChannel::Unreliable(sender) => sender.queue.len(),
            SenderChannel::Reliable(sender) => {
                sender.queue.len() + sender.stored.iter().flatten().count()
            }
        }
    }

    /// 연결 종료 시 모든 대기 메시지 해제
    pub fn reset(&mut self) {
        match self {
            SenderChannel::Unreliable(sender) => {
                sender.queue.clear();
                sender.send_sequence = 0;
            }
            SenderChannel::Reliable(sender) => {
                let dropped = sender.queue.len() + sender.stored.iter().flatten().count();
                if dropped > 0 {
                    debug!(
                        "채널 {} 초기화: 대기 메시지 {}개 폐기",
                        sender.message_type.code(),
                        dropped
                    );
                }
                sender.queue.clear();
                sender.stored.iter_mut().for_each(|slot| *slot = None);
                sender.window_start = 0;
                sender.send_start = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(byte: u8) -> QueuedMessage {
        QueuedMessage {
            payload: SharedPayload::from_bytes(&[byte]),
            fragment: None,
        }
    }

    fn policy() -> ResendPolicy {
        ResendPolicy {
            delay: Duration::from_millis(100),
            max_attempts: 3,
        }
    }

    #[test]
    fn test_reliable_window_limits_in_flight() {
        let mut channel = SenderChannel::new(DeliveryMethod::ReliableOrdered, 0);
        for i in 0..100 {
            channel.enqueue(queued(i as u8));
        }

        let now = Instant::now();
        let mut out = Vec::new();
        let report = channel.send_queued(now, policy(), &mut out).unwrap();
        assert_eq!(report.sent, RELIABLE_WINDOW_SIZE as usize);
        assert_eq!(out.first().map(|m| m.sequence), Some(0));
        assert_eq!(out.last().map(|m| m.sequence), Some(63));
        assert_eq!(channel.pending_count(), 100);

        // 중간 확인은 창을 밀지 못함
        assert!(channel.receive_acknowledge(5));
        out.clear();
        let report = channel.send_queued(now, policy(), &mut out).unwrap();
        assert_eq!(report.sent, 0);

        assert!(channel.receive_acknowledge(0));
        out.clear();
        let report = channel.send_queued(now, policy(), &mut out).unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(out[0].sequence, 64);
        assert_eq!(channel.pending_count(), 98);
    }

    #[test]
    fn test_window_advances_over_acked_gap() {
        let mut sender = ReliableSender::new(MessageType::user(DeliveryMethod::ReliableUnordered, 0));
        for i in 0..4 {
            sender.queue.push_back(queued(i));
        }
        let mut out = Vec::new();
        sender.send_queued(Instant::now(), policy(), &mut out).unwrap();

        assert!(sender.receive_acknowledge(2));
        assert!(sender.receive_acknowledge(1));
        assert_eq!(sender.window_start(), 0);
        assert!(sender.receive_acknowledge(0));
        assert_eq!(sender.window_start(), 3);

        // 중복/창 밖 확인
        assert!(!sender.receive_acknowledge(1));
        assert!(!sender.receive_acknowledge(40));
    }

    #[test]
    fn test_resend_after_delay_then_fail() {
        let mut channel = SenderChannel::new(DeliveryMethod::ReliableSequenced, 2);
        channel.enqueue(queued(7));
        let start = Instant::now();
        let mut out = Vec::new();

        channel.send_queued(start, policy(), &mut out).unwrap();
        assert_eq!(out.len(), 1);

        out.clear();
        let report = channel
            .send_queued(start + Duration::from_millis(50), policy(), &mut out)
            .unwrap();
        assert_eq!(report.resent, 0);

        let mut t = start;
        for attempt in 0..3 {
            t += Duration::from_millis(100);
            out.clear();
            let report = channel.send_queued(t, policy(), &mut out).unwrap();
            assert_eq!(report.resent, 1, "attempt {attempt}");
            assert_eq!(out[0].sequence, 0);
        }

        t += Duration::from_millis(100);
        let err = channel.send_queued(t, policy(), &mut out).unwrap_err();
        assert_eq!(err.sequence, 0);
        assert_eq!(err.attempts, 4);
    }

    #[test]
    fn test_sequenced_numbers_increase_without_storage() {
        let mut channel = SenderChannel::new(DeliveryMethod::Sequenced, 1);
        for i in 0..3 {
            channel.enqueue(queued(i));
        }
        let mut out = Vec::new();
        channel.send_queued(Instant::now(), policy(), &mut out).unwrap();
        let seqs: Vec<u16> = out.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(channel.pending_count(), 0);
    }

    #[test]
    fn test_reset_releases_everything() {
        let mut channel = SenderChannel::new(DeliveryMethod::ReliableOrdered, 0);
        let payload = SharedPayload::from_bytes(b"shared");
        for _ in 0..70 {
            channel.enqueue(QueuedMessage {
                payload: payload.clone(),
                fragment: None,
            });
        }
        let mut out = Vec::new();
        channel.send_queued(Instant::now(), policy(), &mut out).unwrap();
        drop(out);
        assert_eq!(payload.recycling_count(), 71);

        channel.reset();
        assert_eq!(channel.pending_count(), 0);
        assert_eq!(payload.recycling_count(), 1);
    }
}
