//! 데이터그램 와이어 포맷
//!
//! 데이터그램 하나에 여러 메시지가 이어 붙음. 메시지 헤더:
//!
//! ```text
//! u8   타입 코드
//! u16  시퀀스 번호 (LE, 시퀀스가 있는 사용자 타입만)
//! var  (비트 길이 << 1) | 분할 플래그
//! var  그룹 ID, 전체 비트, 청크 크기, 청크 인덱스 (분할된 경우만)
//! ..   페이로드 (바이트 단위로 패딩)
//! ```
//!
//! 체크섬이 켜져 있으면 데이터그램 끝에 CRC32가 붙음 (`checksum` 모듈).

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

use crate::buffer::BitBuffer;
use crate::chunk::FragmentHeader;
use crate::crypto::PUBLIC_KEY_SIZE;
use crate::message::MessageType;
use crate::pool::SharedPayload;
use crate::sequence::relative;
use crate::{Error, Result};

/// 분할 없는 메시지 헤더 최대 크기
pub const MESSAGE_HEADER_MAX_BYTES: usize = 1 + 2 + 10;

/// 분할 헤더 최대 크기
pub const FRAGMENT_HEADER_MAX_BYTES: usize = 5 * 4;

/// 확인 항목 하나의 크기 (타입 1 + 기준 시퀀스 2 + 비트필드 4)
pub const ACK_ENTRY_BYTES: usize = 7;

/// 송신 대기 중인 메시지 하나
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub message_type: MessageType,
    pub sequence: u16,
    pub fragment: Option<FragmentHeader>,
    pub payload: SharedPayload,
}

impl WireMessage {
    /// 시퀀스 없는 제어 메시지
    pub fn control(message_type: MessageType, payload: BitBuffer) -> Self {
        Self {
            message_type,
            sequence: 0,
            fragment: None,
            payload: SharedPayload::new(payload, None),
        }
    }

    fn length_field(&self) -> u64 {
        ((self.payload.bit_length() as u64) << 1) | self.fragment.is_some() as u64
    }

    /// 인코딩된 크기 (바이트)
    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + var_len(self.length_field()) + self.payload.len();
        if self.message_type.has_sequence() {
            len += 2;
        }
        if let Some(header) = &self.fragment {
            len += var_len(header.group as u64)
                + var_len(header.total_bits as u64)
                + var_len(header.chunk_size as u64)
                + var_len(header.chunk_index as u64);
        }
        len
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u8(self.message_type.code());
        if self.message_type.has_sequence() {
            out.put_u16_le(self.sequence);
        }
        put_var(out, self.length_field());
        if let Some(header) = &self.fragment {
            put_var(out, header.group as u64);
            put_var(out, header.total_bits as u64);
            put_var(out, header.chunk_size as u64);
            put_var(out, header.chunk_index as u64);
        }
        out.put_slice(self.payload.bytes());
    }
}

/// 데이터그램에서 해석한 메시지
#[derive(Debug)]
pub struct ReceivedMessage {
    pub message_type: MessageType,
    pub sequence: u16,
    pub fragment: Option<FragmentHeader>,
    pub payload: BitBuffer,
}

/// 데이터그램 하나를 메시지 목록으로 해석
pub fn decode_datagram(mut data: &[u8]) -> Result<Vec<ReceivedMessage>> {
    let mut messages = Vec::new();

    while data.has_remaining() {
        let message_type = MessageType::from_code(data.get_u8())?;

        let sequence = if message_type.has_sequence() {
            ensure(data, 2)?;
            data.get_u16_le()
        } else {
            0
        };

        let length_field = get_var(&mut data)?;
        let bit_length = length_field >> 1;

        let fragment = if length_field & 1 == 1 {
            Some(FragmentHeader {
                group: get_var_u32(&mut data)?,
                total_bits: get_var_u32(&mut data)?,
                chunk_size: get_var_u32(&mut data)?,
                chunk_index: get_var_u32(&mut data)?,
            })
        } else {
            None
        };

        if bit_length > data.remaining() as u64 * 8 {
            return Err(Error::MalformedPacket("페이로드 길이 초과"));
        }
        let bit_length = bit_length as usize;
        let byte_length = (bit_length + 7) / 8;
        let payload = BitBuffer::from_bytes(data[..byte_length].to_vec(), bit_length);
        data.advance(byte_length);

        messages.push(ReceivedMessage {
            message_type,
            sequence,
            fragment,
            payload,
        });
    }

    Ok(messages)
}

/// 메시지들을 `budget` 바이트 이하의 데이터그램으로 묶음
///
/// 혼자서도 예산을 넘는 메시지는 단독 데이터그램이 됨.
pub fn pack_datagrams<'a, I>(messages: I, budget: usize) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = &'a WireMessage>,
{
    let mut datagrams = Vec::new();
    let mut current: Vec<u8> = Vec::with_capacity(budget);

    for message in messages {
        let len = message.encoded_len();
        if !current.is_empty() && current.len() + len > budget {
            datagrams.push(std::mem::replace(&mut current, Vec::with_capacity(budget)));
        }
        message.encode(&mut current);
    }

    if !current.is_empty() {
        datagrams.push(current);
    }
    datagrams
}

fn ensure(data: &[u8], needed: usize) -> Result<()> {
    if data.remaining() < needed {
        return Err(Error::MalformedPacket("헤더가 잘림"));
    }
    Ok(())
}

fn var_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn put_var(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

fn get_var(data: &mut &[u8]) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;
    loop {
        ensure(*data, 1)?;
        let byte = data.get_u8();
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::MalformedPacket("가변 길이 정수가 너무 김"));
        }
    }
}

fn get_var_u32(data: &mut &[u8]) -> Result<u32> {
    u32::try_from(get_var(data)?).map_err(|_| Error::MalformedPacket("분할 헤더 값 초과"))
}

/// Connect / ConnectResponse 페이로드
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectPayload {
    pub app_identifier: String,
    pub unique_id: u64,
    /// 보낸 쪽 로컬 시간 (초)
    pub timestamp: f64,
    pub public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
    pub hail: Option<Vec<u8>>,
}

impl ConnectPayload {
    pub fn to_buffer(&self) -> BitBuffer {
        let mut buffer = BitBuffer::with_capacity(64);
        buffer.write_string(&self.app_identifier);
        buffer.write_u64(self.unique_id);
        buffer.write_f64(self.timestamp);

        buffer.write_bool(self.public_key.is_some());
        if let Some(key) = &self.public_key {
            buffer.write_bytes(key);
        }

        buffer.write_bool(self.hail.is_some());
        if let Some(hail) = &self.hail {
            buffer.write_byte_array(hail);
        }
        buffer
    }

    pub fn read(buffer: &mut BitBuffer) -> Result<Self> {
        let app_identifier = buffer.read_string()?;
        let unique_id = buffer.read_u64()?;
        let timestamp = buffer.read_f64()?;

        let public_key = if buffer.read_bool()? {
            let bytes = buffer.read_bytes(PUBLIC_KEY_SIZE)?;
            let mut key = [0u8; PUBLIC_KEY_SIZE];
            key.copy_from_slice(&bytes);
            Some(key)
        } else {
            None
        };

        let hail = if buffer.read_bool()? {
            Some(buffer.read_byte_array()?)
        } else {
            None
        };

        Ok(Self {
            app_identifier,
            unique_id,
            timestamp,
            public_key,
            hail,
        })
    }
}

/// 확인 항목: `base`와 비트 i가 켜진 `base + 1 + i`를 확인
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckEntry {
    pub code: u8,
    pub base: u16,
    pub mask: u32,
}

impl AckEntry {
    pub fn sequences(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.base).chain(
            (0..32u16)
                .filter(move |bit| self.mask & (1 << bit) != 0)
                .map(move |bit| self.base.wrapping_add(bit + 1)),
        )
    }
}

/// 대기 중인 (타입, 시퀀스) 확인들을 항목으로 압축
pub fn pack_acks(pending: &[(u8, u16)]) -> Vec<AckEntry> {
    let mut by_code: BTreeMap<u8, Vec<u16>> = BTreeMap::new();
    for &(code, sequence) in pending {
        by_code.entry(code).or_default().push(sequence);
    }

    let mut entries = Vec::new();
    for (code, mut sequences) in by_code {
        let reference = sequences[0];
        sequences.sort_by_key(|&s| relative(s, reference));
        sequences.dedup();

        let mut current: Option<AckEntry> = None;
        for sequence in sequences {
            if let Some(entry) = current.as_mut() {
                let offset = relative(sequence, entry.base);
                if (1..=32).contains(&offset) {
                    entry.mask |= 1 << (offset - 1);
                    continue;
                }
                entries.push(*entry);
            }
            current = Some(AckEntry {
                code,
                base: sequence,
                mask: 0,
            });
        }
        entries.extend(current);
    }
    entries
}

pub fn write_acks(entries: &[AckEntry]) -> BitBuffer {
    let mut buffer = BitBuffer::with_capacity(entries.len() * ACK_ENTRY_BYTES);
    for entry in entries {
        buffer.write_u8(entry.code);
        buffer.write_u16(entry.base);
        buffer.write_u32(entry.mask);
    }
    buffer
}

pub fn read_acks(buffer: &mut BitBuffer) -> Result<Vec<AckEntry>> {
    let mut entries = Vec::new();
    while buffer.remaining_bits() >= ACK_ENTRY_BYTES * 8 {
        entries.push(AckEntry {
            code: buffer.read_u8()?,
            base: buffer.read_u16()?,
            mask: buffer.read_u32()?,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeliveryMethod;

    fn user_message(method: DeliveryMethod, sequence: u16, data: &[u8]) -> WireMessage {
        WireMessage {
            message_type: MessageType::user(method, 0),
            sequence,
            fragment: None,
            payload: SharedPayload::from_bytes(data),
        }
    }

    #[test]
    fn test_coalesced_messages_decode() {
        let mut odd = BitBuffer::new();
        odd.write_bits(0b101, 3);

        let messages = vec![
            user_message(DeliveryMethod::ReliableOrdered, 65535, b"first"),
            WireMessage::control(MessageType::Ping, odd),
            user_message(DeliveryMethod::Unreliable, 0, b"second"),
        ];

        let datagrams = pack_datagrams(&messages, 1400);
        assert_eq!(datagrams.len(), 1);
        let expected: usize = messages.iter().map(WireMessage::encoded_len).sum();
        assert_eq!(datagrams[0].len(), expected);

        let decoded = decode_datagram(&datagrams[0]).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].sequence, 65535);
        assert_eq!(decoded[0].payload.as_bytes(), b"first");
        assert_eq!(decoded[1].message_type, MessageType::Ping);
        assert_eq!(decoded[1].payload.bit_length(), 3);
        assert_eq!(decoded[2].payload.as_bytes(), b"second");
    }

    #[test]
    fn test_pack_respects_budget() {
        let messages: Vec<_> = (0..10)
            .map(|i| user_message(DeliveryMethod::ReliableUnordered, i, &[i as u8; 100]))
            .collect();
        let datagrams = pack_datagrams(&messages, 350);
        assert!(datagrams.iter().all(|d| d.len() <= 350));
        let total: usize = datagrams
            .iter()
            .map(|d| decode_datagram(d).unwrap().len())
            .sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_fragment_header_on_wire() {
        let message = WireMessage {
            message_type: MessageType::user(DeliveryMethod::ReliableOrdered, 3),
            sequence: 12,
            fragment: Some(FragmentHeader {
                group: 300,
                total_bits: 40_000,
                chunk_size: 1300,
                chunk_index: 2,
            }),
            payload: SharedPayload::from_bytes(&[1u8; 1300]),
        };
        let mut out = Vec::new();
        message.encode(&mut out);
        assert_eq!(out.len(), message.encoded_len());

        let decoded = decode_datagram(&out).unwrap();
        assert_eq!(decoded[0].fragment, message.fragment);
        assert_eq!(decoded[0].payload.length_bytes(), 1300);
    }

    #[test]
    fn test_truncated_datagram_rejected() {
        let message = user_message(DeliveryMethod::ReliableOrdered, 1, b"hello world");
        let mut out = Vec::new();
        message.encode(&mut out);
        out.truncate(out.len() - 3);
        assert!(decode_datagram(&out).is_err());
        assert!(matches!(
            decode_datagram(&[200]),
            Err(Error::UnknownMessageType(200))
        ));
    }

    #[test]
    fn test_connect_payload() {
        let payload = ConnectPayload {
            app_identifier: "game".into(),
            unique_id: 0xDEAD_BEEF_0102,
            timestamp: 12.5,
            public_key: Some([9u8; 32]),
            hail: Some(b"hi".to_vec()),
        };
        let mut buffer = payload.to_buffer();
        assert_eq!(ConnectPayload::read(&mut buffer).unwrap(), payload);
    }

    #[test]
    fn test_ack_packing_across_wrap() {
        let pending = vec![(124, 65534), (124, 1), (124, 65535), (124, 0), (107, 5), (124, 0)];
        let entries = pack_acks(&pending);
        assert_eq!(entries.len(), 2);

        let mut acked: Vec<(u8, u16)> = entries
            .iter()
            .flat_map(|e| e.sequences().map(move |s| (e.code, s)))
            .collect();
        acked.sort();
        assert_eq!(acked, vec![(107, 5), (124, 0), (124, 1), (124, 65534), (124, 65535)]);

        let mut buffer = write_acks(&entries);
        assert_eq!(read_acks(&mut buffer).unwrap(), entries);
    }

    #[test]
    fn test_ack_gap_starts_new_entry() {
        let entries = pack_acks(&[(108, 10), (108, 42)]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mask, 1 << 31);
        let entries = pack_acks(&[(108, 10), (108, 43), (108, 44)]);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].base, 43);
    }
}
