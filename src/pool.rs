//! 메시지 버퍼 재활용 풀
//!
//! 크기 등급별 free-list. 생성 시 꺼내기(checkout)는 사용자 스레드에서도 호출되므로
//! 락으로 보호함. 여러 수신자가 공유하는 페이로드는 참조 카운트가 0이 될 때 반환.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffer::BitBuffer;

/// 크기 등급 (바이트)
const SIZE_CLASSES: [usize; 6] = [64, 256, 1024, 4096, 16384, 65536];

struct PoolInner {
    classes: Mutex<Vec<Vec<Vec<u8>>>>,
    max_per_class: usize,
}

/// 크기 등급별 버퍼 풀
#[derive(Clone)]
pub struct MessagePool {
    inner: Arc<PoolInner>,
}

impl MessagePool {
    pub fn new(max_per_class: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                classes: Mutex::new(vec![Vec::new(); SIZE_CLASSES.len()]),
                max_per_class,
            }),
        }
    }

    /// 최소 `min_bytes` 용량의 빈 저장소
    pub fn checkout(&self, min_bytes: usize) -> Vec<u8> {
        let Some(class) = SIZE_CLASSES.iter().position(|&size| size >= min_bytes) else {
            debug!("풀 등급 초과 크기 요청: {} bytes", min_bytes);
            return Vec::with_capacity(min_bytes);
        };

        if let Some(storage) = self.inner.classes.lock()[class].pop() {
            trace!("returning buffer from pool (class {})", SIZE_CLASSES[class]);
            return storage;
        }

        trace!("no buffer in pool: creating new buffer");
        Vec::with_capacity(SIZE_CLASSES[class])
    }

    /// 저장소 반환. 가장 큰 수용 가능 등급에 넣음
    pub fn recycle(&self, mut storage: Vec<u8>) {
        let capacity = storage.capacity();
        let Some(class) = SIZE_CLASSES.iter().rposition(|&size| size <= capacity) else {
            return;
        };

        storage.clear();
        let mut classes = self.inner.classes.lock();
        if classes[class].len() < self.inner.max_per_class {
            classes[class].push(storage);
        } else {
            trace!("pool class {} is full: discarding buffer", SIZE_CLASSES[class]);
        }
    }

    /// 풀에 보관 중인 버퍼 수
    pub fn pooled_count(&self) -> usize {
        self.inner.classes.lock().iter().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePool")
            .field("pooled", &self.pooled_count())
            .field("max_per_class", &self.inner.max_per_class)
            .finish()
    }
}

struct PayloadInner {
    data: Vec<u8>,
    bit_length: usize,
    pool: Option<MessagePool>,
}

impl Drop for PayloadInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

/// 전송 중인 인코딩 완료 페이로드
///
/// 팬아웃 전송과 재전송 대기열이 같은 버퍼를 공유하고,
/// 마지막 참조가 사라지면 저장소가 풀로 돌아감.
#[derive(Clone)]
pub struct SharedPayload {
    inner: Arc<PayloadInner>,
}

impl SharedPayload {
    pub fn new(buffer: BitBuffer, pool: Option<MessagePool>) -> Self {
        let bit_length = buffer.bit_length();
        let mut data = buffer.into_storage();
        data.truncate((bit_length + 7) / 8);
        Self {
            inner: Arc::new(PayloadInner {
                data,
                bit_length,
                pool,
            }),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::new(BitBuffer::from_slice(bytes), None)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.inner.data
    }

    pub fn bit_length(&self) -> usize {
        self.inner.bit_length
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// 아직 이 버퍼를 참조하는 전송 수
    pub fn recycling_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for SharedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPayload")
            .field("bit_length", &self.inner.bit_length)
            .field("recycling_count", &self.recycling_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_recycle() {
        let pool = MessagePool::new(4);
        let storage = pool.checkout(100);
        assert!(storage.capacity() >= 256);
        pool.recycle(storage);
        assert_eq!(pool.pooled_count(), 1);

        let again = pool.checkout(200);
        assert!(again.is_empty());
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn test_class_limit() {
        let pool = MessagePool::new(1);
        pool.recycle(Vec::with_capacity(64));
        pool.recycle(Vec::with_capacity(64));
        assert_eq!(pool.pooled_count(), 1);
    }

    #[test]
    fn test_shared_payload_returns_on_last_drop() {
        let pool = MessagePool::new(8);
        let mut buffer = BitBuffer::from_storage(pool.checkout(64));
        buffer.write_u32(7);

        let payload = SharedPayload::new(buffer, Some(pool.clone()));
        let fan_out = payload.clone();
        assert_eq!(payload.recycling_count(), 2);

        drop(payload);
        assert_eq!(pool.pooled_count(), 0);
        assert_eq!(fan_out.recycling_count(), 1);

        drop(fan_out);
        assert_eq!(pool.pooled_count(), 1);
    }
}
