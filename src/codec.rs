//! 압축 코덱 연동
//!
//! 코덱 구현 자체는 애플리케이션이 등록하는 외부 서비스.
//! 피어는 설정된 알고리즘에 해당하는 코덱을 찾아 호출만 함.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{Error, Result};

/// 압축 알고리즘 선택
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    Lzma,
    Zlib,
}

/// `compress(bytes) -> bytes` / `decompress(bytes) -> bytes` 계약
pub trait Codec: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// 알고리즘별 코덱 등록부
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<CompressionAlgorithm, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, algorithm: CompressionAlgorithm, codec: Arc<dyn Codec>) {
        self.codecs.insert(algorithm, codec);
    }

    pub fn get(&self, algorithm: CompressionAlgorithm) -> Result<&Arc<dyn Codec>> {
        self.codecs
            .get(&algorithm)
            .ok_or(Error::CodecMissing(algorithm))
    }

    pub fn contains(&self, algorithm: CompressionAlgorithm) -> bool {
        self.codecs.contains_key(&algorithm)
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.codecs.keys()).finish()
    }
}

/// 테스트용 런 렝스 코덱
#[cfg(test)]
pub(crate) struct RunLengthCodec;

#[cfg(test)]
impl Codec for RunLengthCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut iter = data.iter().peekable();
        while let Some(&byte) = iter.next() {
            let mut run = 1u8;
            while run < u8::MAX && iter.peek() == Some(&&byte) {
                iter.next();
                run += 1;
            }
            out.push(run);
            out.push(byte);
        }
        Ok(out)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() % 2 != 0 {
            return Err(Error::Codec("홀수 길이 RLE 입력".into()));
        }
        Ok(data
            .chunks(2)
            .flat_map(|pair| std::iter::repeat(pair[1]).take(pair[0] as usize))
            .collect())
    }
}
