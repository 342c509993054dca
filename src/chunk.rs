//! 메시지 분할과 재조립
//!
//! - 송신: MTU를 넘는 페이로드를 같은 그룹 ID의 청크들로 분할
//! - 수신: 그룹별 비트맵으로 모든 청크가 도착했을 때만 원본을 복원
//!
//! 각 청크는 자신의 채널에서 독립된 메시지로 전송되고 확인됨.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::buffer::BitBuffer;
use crate::pool::{MessagePool, SharedPayload};
use crate::{Error, Result};

/// 그룹 ID (피어 전체에서 증가)
pub type GroupId = u32;

/// 분할 헤더 (가변 길이 정수 4개)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// 그룹 ID
    pub group: GroupId,

    /// 원본 페이로드 비트 수
    pub total_bits: u32,

    /// 청크 크기 (바이트, 마지막 청크만 더 작을 수 있음)
    pub chunk_size: u32,

    /// 그룹 내 청크 인덱스
    pub chunk_index: u32,
}

impl FragmentHeader {
    /// 원본 페이로드 바이트 수
    pub fn total_bytes(&self) -> usize {
        (self.total_bits as usize + 7) / 8
    }

    /// 그룹의 청크 수
    pub fn chunk_count(&self) -> u32 {
        if self.chunk_size == 0 {
            return 0;
        }
        ((self.total_bytes() + self.chunk_size as usize - 1) / self.chunk_size as usize) as u32
    }

    /// 이 청크의 데이터 길이
    pub fn chunk_len(&self) -> usize {
        let offset = self.chunk_index as usize * self.chunk_size as usize;
        self.total_bytes()
            .saturating_sub(offset)
            .min(self.chunk_size as usize)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.total_bits == 0 {
            return Err(Error::MalformedPacket("빈 분할 그룹"));
        }
        if self.chunk_index >= self.chunk_count() {
            return Err(Error::MalformedPacket("청크 인덱스 범위 초과"));
        }
        Ok(())
    }
}

/// 수신 중인 분할 그룹
#[derive(Debug)]
pub struct FragmentGroup {
    /// 그룹 ID
    pub group: GroupId,

    total_bits: u32,

    chunk_size: u32,

    /// 조립 버퍼
    data: Vec<u8>,

    /// 수신된 청크 비트맵
    received_chunks: Vec<bool>,

    /// 수신된 청크 수
    pub received_count: u32,

    /// 첫 청크 도착 시간
    pub created_at: Instant,
}

impl FragmentGroup {
    /// 첫 청크의 헤더로 그룹 생성
    pub fn new(header: &FragmentHeader, now: Instant) -> Self {
        Self {
            group: header.group,
            total_bits: header.total_bits,
            chunk_size: header.chunk_size,
            data: vec![0; header.total_bytes()],
            received_chunks: vec![false; header.chunk_count() as usize],
            received_count: 0,
            created_at: now,
        }
    }

    /// 청크 삽입. 새로 받은 청크면 true
    pub fn insert(&mut self, header: &FragmentHeader, chunk: &[u8]) -> Result<bool> {
        if header.total_bits != self.total_bits || header.chunk_size != self.chunk_size {
            return Err(Error::MalformedPacket("분할 그룹 헤더 불일치"));
        }
        if chunk.len() != header.chunk_len() {
            return Err(Error::MalformedPacket("청크 길이 불일치"));
        }

        let index = header.chunk_index as usize;
        if index >= self.received_chunks.len() {
            return Err(Error::MalformedPacket("청크 인덱스 범위 초과"));
        }
        if self.received_chunks[index] {
            return Ok(false);
        }

        let offset = index * self.chunk_size as usize;
        self.data[offset..offset + chunk.len()].copy_from_slice(chunk);
        self.received_chunks[index] = true;
        self.received_count += 1;
        Ok(true)
    }

    /// 완료 여부 확인
    pub fn is_complete(&self) -> bool {
        self.received_count as usize == self.received_chunks.len()
    }

    /// 누락된 청크 인덱스 목록 반환
    pub fn missing_chunks(&self) -> Vec<u32> {
        self.received_chunks
            .iter()
            .enumerate()
            .filter(|(_, &received)| !received)
            .map(|(index, _)| index as u32)
            .collect()
    }

    /// 수신률 계산
    pub fn receive_ratio(&self) -> f64 {
        if self.received_chunks.is_empty() {
            return 0.0;
        }
        self.received_count as f64 / self.received_chunks.len() as f64
    }

    /// 완료된 원본 추출
    pub fn into_buffer(self) -> BitBuffer {
        BitBuffer::from_bytes(self.data, self.total_bits as usize)
    }
}

/// 연결별 재조립기
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    groups: HashMap<GroupId, FragmentGroup>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 청크 수신. 그룹이 완성되면 원본 반환
    pub fn receive(
        &mut self,
        header: &FragmentHeader,
        chunk: &[u8],
        now: Instant,
    ) -> Result<Option<BitBuffer>> {
        header.validate()?;

        let group = self
            .groups
            .entry(header.group)
            .or_insert_with(|| FragmentGroup::new(header, now));

        if !group.insert(header, chunk)? {
            trace!("중복 청크 무시: group {} index {}", header.group, header.chunk_index);
            return Ok(None);
        }

        if !group.is_complete() {
            return Ok(None);
        }

        let complete = self.groups.remove(&header.group);
        Ok(complete.map(FragmentGroup::into_buffer))
    }

    /// 오래된 미완성 그룹 폐기. 폐기한 수 반환
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.groups.len();
        self.groups.retain(|id, group| {
            let keep = now.saturating_duration_since(group.created_at) < timeout;
            if !keep {
                debug!(
                    "미완성 분할 그룹 폐기: group {} ({:.0}% 수신)",
                    id,
                    group.receive_ratio() * 100.0
                );
            }
            keep
        });
        before - self.groups.len()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

/// 분할기 (송신측)
pub struct Fragmenter {
    chunk_size: usize,
}

impl Fragmenter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// 페이로드를 청크들로 분할
    pub fn split(
        &self,
        group: GroupId,
        payload: &SharedPayload,
        pool: Option<&MessagePool>,
    ) -> Vec<(FragmentHeader, SharedPayload)> {
        let total_bits = payload.bit_length() as u32;

        payload
            .bytes()
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, chunk_data)| {
                let header = FragmentHeader {
                    group,
                    total_bits,
                    chunk_size: self.chunk_size as u32,
                    chunk_index: index as u32,
                };

                let mut storage = match pool {
                    Some(pool) => pool.checkout(chunk_data.len()),
                    None => Vec::with_capacity(chunk_data.len()),
                };
                storage.extend_from_slice(chunk_data);
                let buffer = BitBuffer::from_bytes(storage, chunk_data.len() * 8);

                (header, SharedPayload::new(buffer, pool.cloned()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> SharedPayload {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        SharedPayload::from_bytes(&data)
    }

    #[test]
    fn test_header_geometry() {
        let header = FragmentHeader {
            group: 1,
            total_bits: 250 * 8 - 3,
            chunk_size: 100,
            chunk_index: 2,
        };
        assert_eq!(header.total_bytes(), 250);
        assert_eq!(header.chunk_count(), 3);
        assert_eq!(header.chunk_len(), 50);
        assert!(header.validate().is_ok());

        let bad = FragmentHeader {
            chunk_index: 3,
            ..header
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let original = payload(1000);
        let chunks = Fragmenter::new(128).split(9, &original, None);
        assert_eq!(chunks.len(), 8);

        let mut assembler = FragmentAssembler::new();
        let now = Instant::now();
        let mut order: Vec<usize> = (0..chunks.len()).rev().collect();
        order.swap(0, 3);

        let mut result = None;
        for (n, &i) in order.iter().enumerate() {
            let (header, data) = &chunks[i];
            let out = assembler.receive(header, data.bytes(), now).unwrap();
            if n + 1 < order.len() {
                assert!(out.is_none(), "완료 전에 원본이 나오면 안 됨");
            } else {
                result = out;
            }
        }

        let buffer = result.expect("모든 청크 수신 후 완료");
        assert_eq!(buffer.bit_length(), original.bit_length());
        assert_eq!(buffer.as_bytes(), original.bytes());
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_duplicate_chunk_ignored() {
        let original = payload(300);
        let chunks = Fragmenter::new(100).split(1, &original, None);
        let mut assembler = FragmentAssembler::new();
        let now = Instant::now();

        let (h0, d0) = &chunks[0];
        assert!(assembler.receive(h0, d0.bytes(), now).unwrap().is_none());
        assert!(assembler.receive(h0, d0.bytes(), now).unwrap().is_none());
        let (h1, d1) = &chunks[1];
        assert!(assembler.receive(h1, d1.bytes(), now).unwrap().is_none());
        let (h2, d2) = &chunks[2];
        assert!(assembler.receive(h2, d2.bytes(), now).unwrap().is_some());
    }

    #[test]
    fn test_wrong_chunk_length_rejected() {
        let header = FragmentHeader {
            group: 3,
            total_bits: 800,
            chunk_size: 60,
            chunk_index: 0,
        };
        let mut assembler = FragmentAssembler::new();
        assert!(assembler
            .receive(&header, &[0u8; 10], Instant::now())
            .is_err());
    }

    #[test]
    fn test_expire_incomplete_group() {
        let original = payload(500);
        let chunks = Fragmenter::new(200).split(4, &original, None);
        let mut assembler = FragmentAssembler::new();
        let start = Instant::now();

        let (header, data) = &chunks[1];
        assembler.receive(header, data.bytes(), start).unwrap();
        assert_eq!(assembler.len(), 1);

        assert_eq!(assembler.expire(start + Duration::from_secs(1), Duration::from_secs(5)), 0);
        assert_eq!(assembler.expire(start + Duration::from_secs(6), Duration::from_secs(5)), 1);
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_pooled_chunks_return_storage() {
        let pool = MessagePool::new(16);
        let original = payload(400);
        let chunks = Fragmenter::new(100).split(2, &original, Some(&pool));
        assert_eq!(chunks.len(), 4);
        drop(chunks);
        assert_eq!(pool.pooled_count(), 4);
    }
}
