//! 채널별 수신자
//!
//! 시퀀스 번호와 창 위치로 전달/보류/폐기를 결정. 신뢰 채널은 창보다 앞선 메시지를
//! 제외하고 모두 확인 대상 (중복이나 오래된 메시지도 확인해야 재전송이 멈춤).

use tracing::trace;

use crate::message::DeliveryMethod;
use crate::sequence::{is_newer, relative, RELIABLE_WINDOW_SIZE};
use crate::wire::ReceivedMessage;

/// 메시지 하나의 수신 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// 즉시 전달 (보류 중이던 후속 메시지도 함께 나갈 수 있음)
    Delivered,
    /// 앞선 메시지를 기다리며 보류
    Buffered,
    /// 이미 받은 메시지
    Duplicate,
    /// 더 새로운 메시지가 먼저 전달됨
    Stale,
    /// 수신 창보다 앞섬. 확인하지 않고 버림
    TooEarly,
}

impl Arrival {
    /// 신뢰 채널에서 확인을 보내야 하는지
    pub fn should_acknowledge(self) -> bool {
        !matches!(self, Arrival::TooEarly)
    }
}

const WINDOW: usize = RELIABLE_WINDOW_SIZE as usize;

fn slot(sequence: u16) -> usize {
    sequence as usize % WINDOW
}

/// 연결의 수신 채널 슬롯 하나
#[derive(Debug)]
pub enum ReceiverChannel {
    Unreliable,
    Sequenced {
        last_received: Option<u16>,
    },
    ReliableUnordered {
        window_start: u16,
        early_received: Vec<bool>,
    },
    ReliableSequenced {
        window_start: u16,
    },
    ReliableOrdered {
        window_start: u16,
        withheld: Vec<Option<ReceivedMessage>>,
    },
}

impl ReceiverChannel {
    pub fn new(method: DeliveryMethod) -> Self {
        match method {
            DeliveryMethod::Unreliable => ReceiverChannel::Unreliable,
            DeliveryMethod::Sequenced => ReceiverChannel::Sequenced {
                last_received: None,
            },
            DeliveryMethod::ReliableUnordered => ReceiverChannel::ReliableUnordered {
                window_start: 0,
                early_received: vec![false; WINDOW],
            },
            DeliveryMethod::ReliableSequenced => {
                ReceiverChannel::ReliableSequenced { window_start: 0 }
            }
            DeliveryMethod::ReliableOrdered => ReceiverChannel::ReliableOrdered {
                window_start: 0,
                withheld: (0..WINDOW).map(|_| None).collect(),
            },
        }
    }

    /// 메시지 수신. 애플리케이션에 넘길 메시지는 `released`에 순서대로 추가
    pub fn receive(
        &mut self,
        message: ReceivedMessage,
        released: &mut Vec<ReceivedMessage>,
    ) -> Arrival {
        let sequence = message.sequence;

        match self {
            ReceiverChannel::Unreliable => {
                released.push(message);
                Arrival::Delivered
            }

            ReceiverChannel::Sequenced { last_received } => {
                if let Some(last) = *last_received {
                    if !is_newer(sequence, last) {
                        trace!("오래된 순차 메시지 폐기: seq {} (last {})", sequence, last);
                        return Arrival::Stale;
                    }
                }
                *last_received = Some(sequence);
                released.push(message);
                Arrival::Delivered
            }

            ReceiverChannel::ReliableUnordered {
                window_start,
                early_received,
            } => {
                let offset = relative(sequence, *window_start);
                if offset < 0 {
                    return Arrival::Duplicate;
                }
                if offset >= WINDOW as i32 {
                    return Arrival::TooEarly;
                }

                if offset == 0 {
                    *window_start = window_start.wrapping_add(1);
                    while early_received[slot(*window_start)] {
                        early_received[slot(*window_start)] = false;
                        *window_start = window_start.wrapping_add(1);
                    }
                } else {
                    if early_received[slot(sequence)] {
                        return Arrival::Duplicate;
                    }
                    early_received[slot(sequence)] = true;
                }

                released.push(message);
                Arrival::Delivered
            }

            ReceiverChannel::ReliableSequenced { window_start } => {
                let offset = relative(sequence, *window_start);
                if offset < 0 {
                    return Arrival::Stale;
                }
                if offset >= WINDOW as i32 {
                    return Arrival::TooEarly;
                }

                *window_start = sequence.wrapping_add(1);
                released.push(message);
                Arrival::Delivered
            }

            ReceiverChannel::ReliableOrdered {
                window_start,
                withheld,
            } => {
                let offset = relative(sequence, *window_start);
                if offset < 0 {
                    return Arrival::Duplicate;
                }
                if offset >= WINDOW as i32 {
                    return Arrival::TooEarly;
                }

                if offset > 0 {
                    let entry = &mut withheld[slot(sequence)];
                    if entry.is_some() {
                        return Arrival::Duplicate;
                    }
                    *entry = Some(message);
                    return Arrival::Buffered;
                }

                released.push(message);
                *window_start = window_start.wrapping_add(1);
                while let Some(next) = withheld[slot(*window_start)].take() {
                    released.push(next);
                    *window_start = window_start.wrapping_add(1);
                }
                Arrival::Delivered
            }
        }
    }

    /// 보류 중인 메시지 수
    pub fn withheld_count(&self) -> usize {
        match self {
            ReceiverChannel::ReliableOrdered { withheld, .. } => withheld.iter().flatten().count(),
            _ => 0,
        }
    }

    /// 연결 종료 시 초기 상태로
    pub fn reset(&mut self) {
        match self {
            ReceiverChannel::Unreliable => {}
            ReceiverChannel::Sequenced { last_received } => *last_received = None,
            ReceiverChannel::ReliableUnordered {
                window_start,
                early_received,
            } => {
                *window_start = 0;
                early_received.iter_mut().for_each(|b| *b = false);
            }
            ReceiverChannel::ReliableSequenced { window_start } => *window_start = 0,
            ReceiverChannel::ReliableOrdered {
                window_start,
                withheld,
            } => {
                *window_start = 0;
                withheld.iter_mut().for_each(|m| *m = None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BitBuffer;
    use crate::message::MessageType;

    fn message(method: DeliveryMethod, sequence: u16) -> ReceivedMessage {
        ReceivedMessage {
            message_type: MessageType::user(method, 0),
            sequence,
            fragment: None,
            payload: BitBuffer::from_slice(&sequence.to_le_bytes()),
        }
    }

    fn feed(channel: &mut ReceiverChannel, method: DeliveryMethod, seqs: &[u16]) -> (Vec<u16>, Vec<Arrival>) {
        let mut released = Vec::new();
        let arrivals = seqs
            .iter()
            .map(|&s| channel.receive(message(method, s), &mut released))
            .collect();
        (released.iter().map(|m| m.sequence).collect(), arrivals)
    }

    #[test]
    fn test_ordered_flushes_in_sequence() {
        let method = DeliveryMethod::ReliableOrdered;
        let mut channel = ReceiverChannel::new(method);
        let (delivered, arrivals) = feed(&mut channel, method, &[2, 0, 3, 1, 1, 4]);
        assert_eq!(delivered, vec![0, 1, 2, 3, 4]);
        assert_eq!(arrivals[0], Arrival::Buffered);
        assert_eq!(arrivals[4], Arrival::Duplicate);
        assert_eq!(channel.withheld_count(), 0);
    }

    #[test]
    fn test_ordered_any_permutation_delivers_in_order() {
        let method = DeliveryMethod::ReliableOrdered;
        let mut channel = ReceiverChannel::new(method);
        let mut order: Vec<u16> = (0..40).collect();
        // 결정적 섞기
        for i in 0..order.len() {
            let j = (i * 17 + 5) % order.len();
            order.swap(i, j);
        }
        let (delivered, _) = feed(&mut channel, method, &order);
        assert_eq!(delivered, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_unordered_delivers_each_once() {
        let method = DeliveryMethod::ReliableUnordered;
        let mut channel = ReceiverChannel::new(method);
        let (delivered, arrivals) = feed(&mut channel, method, &[3, 1, 0, 3, 2, 1, 4]);
        assert_eq!(delivered, vec![3, 1, 0, 2, 4]);
        assert_eq!(arrivals[3], Arrival::Duplicate);
        assert_eq!(arrivals[5], Arrival::Duplicate);
        assert!(arrivals.iter().all(|a| a.should_acknowledge()));
    }

    #[test]
    fn test_reliable_sequenced_drops_older() {
        let method = DeliveryMethod::ReliableSequenced;
        let mut channel = ReceiverChannel::new(method);
        let (delivered, arrivals) = feed(&mut channel, method, &[0, 2, 1, 3]);
        assert_eq!(delivered, vec![0, 2, 3]);
        assert_eq!(arrivals[2], Arrival::Stale);
        assert!(arrivals[2].should_acknowledge());
    }

    #[test]
    fn test_sequenced_only_newer() {
        let method = DeliveryMethod::Sequenced;
        let mut channel = ReceiverChannel::new(method);
        let (delivered, _) = feed(&mut channel, method, &[5, 9, 7, 9, 10]);
        assert_eq!(delivered, vec![5, 9, 10]);
    }

    #[test]
    fn test_too_early_not_acknowledged() {
        let method = DeliveryMethod::ReliableOrdered;
        let mut channel = ReceiverChannel::new(method);
        let (delivered, arrivals) = feed(&mut channel, method, &[RELIABLE_WINDOW_SIZE]);
        assert!(delivered.is_empty());
        assert_eq!(arrivals[0], Arrival::TooEarly);
        assert!(!arrivals[0].should_acknowledge());
    }

    #[test]
    fn test_ordered_across_wrap() {
        let method = DeliveryMethod::ReliableOrdered;
        let mut channel = ReceiverChannel::new(method);
        if let ReceiverChannel::ReliableOrdered { window_start, .. } = &mut channel {
            *window_start = 65534;
        }
        let (delivered, _) = feed(&mut channel, method, &[0, 65535, 65534, 1]);
        assert_eq!(delivered, vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn test_reset_restores_initial_window() {
        let method = DeliveryMethod::ReliableOrdered;
        let mut channel = ReceiverChannel::new(method);
        feed(&mut channel, method, &[0, 1, 5]);
        channel.reset();
        assert_eq!(channel.withheld_count(), 0);
        let (delivered, _) = feed(&mut channel, method, &[0]);
        assert_eq!(delivered, vec![0]);
    }
}
