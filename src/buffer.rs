//! 비트 단위 읽기/쓰기 버퍼
//!
//! 수신 메시지와 송신 메시지가 같은 표현을 공유하므로
//! 받은 메시지를 복사 없이 다시 인코딩할 수 있음.
//! 비트는 바이트 안에서 LSB부터 채워짐.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::checksum;
use crate::{Error, Result};

/// 버퍼 확장 시 추가로 잡는 여유 바이트
pub const OVERALLOCATE_BYTES: usize = 4;

/// 비트 단위 커서를 가진 가변 바이트 버퍼
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitBuffer {
    data: Vec<u8>,
    bit_length: usize,
    position: usize,
}

impl BitBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self::from_storage(Vec::with_capacity(bytes))
    }

    /// 풀에서 꺼낸 저장소를 빈 버퍼로 사용
    pub fn from_storage(mut storage: Vec<u8>) -> Self {
        storage.clear();
        Self {
            data: storage,
            bit_length: 0,
            position: 0,
        }
    }

    /// 수신 데이터로 읽기용 버퍼 생성
    pub fn from_bytes(data: Vec<u8>, bit_length: usize) -> Self {
        debug_assert!(bit_length <= data.len() * 8);
        Self {
            data,
            bit_length,
            position: 0,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes.to_vec(), bytes.len() * 8)
    }

    /// 기록된 비트 수
    pub fn bit_length(&self) -> usize {
        self.bit_length
    }

    /// 기록 길이 설정 (필요하면 버퍼 확장)
    pub fn set_bit_length(&mut self, bits: usize) {
        self.ensure_bits(bits);
        self.bit_length = bits;
        self.position = self.position.min(bits);
    }

    /// 기록된 바이트 수 (바이트 경계로 올림)
    pub fn length_bytes(&self) -> usize {
        (self.bit_length + 7) / 8
    }

    pub fn set_length_bytes(&mut self, bytes: usize) {
        self.set_bit_length(bytes * 8);
    }

    /// 읽기 위치 (비트)
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, bit: usize) {
        self.position = bit.min(self.bit_length);
    }

    pub fn remaining_bits(&self) -> usize {
        self.bit_length - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.bit_length == 0
    }

    /// 사용 중인 바이트
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.length_bytes()]
    }

    /// 저장소 회수 (풀 반환용)
    pub fn into_storage(self) -> Vec<u8> {
        self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.bit_length = 0;
        self.position = 0;
    }

    fn ensure_bits(&mut self, bits: usize) {
        let needed = (bits + 7) / 8;
        if needed > self.data.len() {
            self.data.resize(needed + OVERALLOCATE_BYTES, 0);
        }
    }

    // ---- 쓰기 ----

    /// 하위 `num_bits` 비트 기록
    pub fn write_bits(&mut self, value: u64, num_bits: u32) {
        assert!(num_bits <= 64, "한 번에 최대 64비트");
        if num_bits == 0 {
            return;
        }
        self.ensure_bits(self.bit_length + num_bits as usize);

        let mut value = value;
        let mut remaining = num_bits;
        let mut pos = self.bit_length;
        while remaining > 0 {
            let bit_offset = (pos % 8) as u32;
            let n = (8 - bit_offset).min(remaining);
            let mask = ((1u16 << n) - 1) as u8;
            let byte = &mut self.data[pos / 8];
            *byte = (*byte & !(mask << bit_offset)) | (((value as u8) & mask) << bit_offset);
            value >>= n;
            remaining -= n;
            pos += n as usize;
        }
        self.bit_length = pos;
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_bits(value as u64, 1);
    }

    pub fn write_u8(&mut self, value: u8) {
        if self.bit_length % 8 == 0 {
            self.ensure_bits(self.bit_length + 8);
            self.data[self.bit_length / 8] = value;
            self.bit_length += 8;
        } else {
            self.write_bits(value as u64, 8);
        }
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_u8(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bits(value as u64, 16);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write_bits(value as u16 as u64, 16);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bits(value as u64, 32);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_bits(value as u32 as u64, 32);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bits(value, 64);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_bits(value as u64, 64);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    /// 7비트 가변 길이 정수
    pub fn write_var_u64(&mut self, mut value: u64) -> usize {
        let mut written = 1;
        while value >= 0x80 {
            self.write_u8((value as u8) | 0x80);
            value >>= 7;
            written += 1;
        }
        self.write_u8(value as u8);
        written
    }

    pub fn write_var_u32(&mut self, value: u32) -> usize {
        self.write_var_u64(value as u64)
    }

    /// zig-zag 인코딩
    pub fn write_var_i32(&mut self, value: i32) -> usize {
        self.write_var_u32(((value << 1) ^ (value >> 31)) as u32)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.bit_length % 8 == 0 {
            let start = self.bit_length / 8;
            self.ensure_bits(self.bit_length + bytes.len() * 8);
            self.data[start..start + bytes.len()].copy_from_slice(bytes);
            self.bit_length += bytes.len() * 8;
        } else {
            for &b in bytes {
                self.write_bits(b as u64, 8);
            }
        }
    }

    /// 길이 접두사 + 바이트
    pub fn write_byte_array(&mut self, bytes: &[u8]) {
        self.write_var_u32(bytes.len() as u32);
        self.write_bytes(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_byte_array(value.as_bytes());
    }

    /// 다음 바이트 경계까지 0 비트 채움
    pub fn write_padding_bits(&mut self) {
        let pad = (8 - self.bit_length % 8) % 8;
        self.write_bits(0, pad as u32);
    }

    /// 다른 버퍼의 기록 내용 전체를 이어 붙임
    pub fn write_buffer(&mut self, other: &BitBuffer) {
        let full = other.bit_length / 8;
        self.write_bytes(&other.data[..full]);
        let rest = other.bit_length % 8;
        if rest > 0 {
            self.write_bits(other.data[full] as u64, rest as u32);
        }
    }

    /// 제네릭 쓰기
    pub fn write<T: WireWrite + ?Sized>(&mut self, value: &T) {
        value.write_to(self);
    }

    /// serde 객체를 bincode로 직렬화해 길이 접두사와 함께 기록
    pub fn write_object<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        self.write_byte_array(&encoded);
        Ok(())
    }

    /// 길이 + CRC32 + 바이트
    pub fn write_checked_bytes(&mut self, bytes: &[u8]) {
        self.write_var_u32(bytes.len() as u32);
        self.write_u32(checksum::digest(bytes, 0, bytes.len()));
        self.write_bytes(bytes);
    }

    // ---- 읽기 ----

    fn check_available(&self, bits: usize) -> Result<()> {
        let available = self.remaining_bits();
        if bits > available {
            return Err(Error::OutOfData {
                requested: bits,
                available,
            });
        }
        Ok(())
    }

    pub fn read_bits(&mut self, num_bits: u32) -> Result<u64> {
        assert!(num_bits <= 64, "한 번에 최대 64비트");
        self.check_available(num_bits as usize)?;

        let mut result = 0u64;
        let mut read = 0u32;
        let mut pos = self.position;
        while read < num_bits {
            let bit_offset = (pos % 8) as u32;
            let n = (8 - bit_offset).min(num_bits - read);
            let mask = ((1u16 << n) - 1) as u8;
            let bits = (self.data[pos / 8] >> bit_offset) & mask;
            result |= (bits as u64) << read;
            read += n;
            pos += n as usize;
        }
        self.position = pos;
        Ok(result)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.position % 8 == 0 {
            self.check_available(8)?;
            let value = self.data[self.position / 8];
            self.position += 8;
            Ok(value)
        } else {
            Ok(self.read_bits(8)? as u8)
        }
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_bits(16)? as u16)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_bits(16)? as u16 as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_bits(32)? as u32)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_bits(32)? as u32 as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_bits(64)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_bits(64)? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_var_u64(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(Error::MalformedPacket("varint 너무 김"));
            }
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn read_var_u32(&mut self) -> Result<u32> {
        let value = self.read_var_u64()?;
        u32::try_from(value).map_err(|_| Error::MalformedPacket("varint u32 범위 초과"))
    }

    pub fn read_var_i32(&mut self) -> Result<i32> {
        let n = self.read_var_u32()?;
        Ok(((n >> 1) as i32) ^ -((n & 1) as i32))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.check_available(len * 8)?;
        if self.position % 8 == 0 {
            let start = self.position / 8;
            self.position += len * 8;
            Ok(self.data[start..start + len].to_vec())
        } else {
            (0..len).map(|_| self.read_u8()).collect()
        }
    }

    pub fn read_byte_array(&mut self) -> Result<Vec<u8>> {
        let len = self.read_var_u32()? as usize;
        self.read_bytes(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_byte_array()?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidString)
    }

    /// 다음 바이트 경계로 읽기 위치 이동
    pub fn skip_padding_bits(&mut self) -> Result<()> {
        let pad = (8 - self.position % 8) % 8;
        self.check_available(pad)?;
        self.position += pad;
        Ok(())
    }

    pub fn read<T: WireRead>(&mut self) -> Result<T> {
        T::read_from(self)
    }

    pub fn read_object<T: DeserializeOwned>(&mut self) -> Result<T> {
        let encoded = self.read_byte_array()?;
        Ok(bincode::deserialize(&encoded)?)
    }

    /// `write_checked_bytes`로 기록한 데이터를 CRC 검증 후 반환
    pub fn read_checked_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_var_u32()? as usize;
        let expected = self.read_u32()?;
        let bytes = self.read_bytes(len)?;
        if !checksum::verify(expected, &bytes, 0, bytes.len()) {
            return Err(Error::ChecksumMismatch {
                expected,
                got: checksum::digest(&bytes, 0, bytes.len()),
            });
        }
        Ok(bytes)
    }
}

/// 버퍼에 기록 가능한 타입
pub trait WireWrite {
    fn write_to(&self, buf: &mut BitBuffer);
}

/// 버퍼에서 읽을 수 있는 타입
pub trait WireRead: Sized {
    fn read_from(buf: &mut BitBuffer) -> Result<Self>;
}

macro_rules! wire_primitive {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl WireWrite for $ty {
                fn write_to(&self, buf: &mut BitBuffer) {
                    buf.$write(*self);
                }
            }

            impl WireRead for $ty {
                fn read_from(buf: &mut BitBuffer) -> Result<Self> {
                    buf.$read()
                }
            }
        )*
    };
}

wire_primitive! {
    bool => write_bool, read_bool;
    u8 => write_u8, read_u8;
    i8 => write_i8, read_i8;
    u16 => write_u16, read_u16;
    i16 => write_i16, read_i16;
    u32 => write_u32, read_u32;
    i32 => write_i32, read_i32;
    u64 => write_u64, read_u64;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
}

impl WireWrite for str {
    fn write_to(&self, buf: &mut BitBuffer) {
        buf.write_string(self);
    }
}

impl WireWrite for String {
    fn write_to(&self, buf: &mut BitBuffer) {
        buf.write_string(self);
    }
}

impl WireRead for String {
    fn read_from(buf: &mut BitBuffer) -> Result<Self> {
        buf.read_string()
    }
}

impl WireWrite for [u8] {
    fn write_to(&self, buf: &mut BitBuffer) {
        buf.write_byte_array(self);
    }
}

impl WireWrite for Vec<u8> {
    fn write_to(&self, buf: &mut BitBuffer) {
        buf.write_byte_array(self);
    }
}

impl WireRead for Vec<u8> {
    fn read_from(buf: &mut BitBuffer) -> Result<Self> {
        buf.read_byte_array()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[test]
    fn test_mixed_round_trip() {
        let mut buf = BitBuffer::new();
        buf.write_bool(true);
        buf.write_bits(5, 3);
        buf.write_u8(200);
        buf.write_i16(-1234);
        buf.write_u32(0xDEAD_BEEF);
        buf.write_f32(3.5);
        buf.write_var_i32(-77);
        buf.write_string("안녕 slnet");
        buf.write_f64(-0.125);
        buf.write_u64(u64::MAX - 3);
        buf.write_byte_array(&[1, 2, 3]);

        assert!(buf.read_bool().unwrap());
        assert_eq!(buf.read_bits(3).unwrap(), 5);
        assert_eq!(buf.read_u8().unwrap(), 200);
        assert_eq!(buf.read_i16().unwrap(), -1234);
        assert_eq!(buf.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(buf.read_f32().unwrap(), 3.5);
        assert_eq!(buf.read_var_i32().unwrap(), -77);
        assert_eq!(buf.read_string().unwrap(), "안녕 slnet");
        assert_eq!(buf.read_f64().unwrap(), -0.125);
        assert_eq!(buf.read_u64().unwrap(), u64::MAX - 3);
        assert_eq!(buf.read_byte_array().unwrap(), vec![1, 2, 3]);
        assert_eq!(buf.remaining_bits(), 0);
    }

    #[test]
    fn test_read_past_end_is_out_of_data() {
        let mut buf = BitBuffer::new();
        buf.write_u16(7);
        assert_eq!(buf.read_u8().unwrap(), 7);

        match buf.read_u16() {
            Err(Error::OutOfData { requested, available }) => {
                assert_eq!(requested, 16);
                assert_eq!(available, 8);
            }
            other => panic!("OutOfData 예상, got {:?}", other),
        }
        // 실패한 읽기는 위치를 움직이지 않음
        assert_eq!(buf.read_u8().unwrap(), 0);
        assert!(buf.read_bool().is_err());
    }

    #[test]
    fn test_length_rounds_up() {
        let mut buf = BitBuffer::new();
        buf.write_bits(1, 9);
        assert_eq!(buf.bit_length(), 9);
        assert_eq!(buf.length_bytes(), 2);
    }

    #[test]
    fn test_generic_dispatch() {
        let mut buf = BitBuffer::new();
        buf.write(&42u32);
        buf.write(&-5i64);
        buf.write("이름");

        assert_eq!(buf.read::<u32>().unwrap(), 42);
        assert_eq!(buf.read::<i64>().unwrap(), -5);
        assert_eq!(buf.read::<String>().unwrap(), "이름");
    }

    #[test]
    fn test_unaligned_bytes_and_buffer_append() {
        let mut inner = BitBuffer::new();
        inner.write_bits(0b101, 3);
        inner.write_bytes(&[0xAB, 0xCD]);

        let mut outer = BitBuffer::new();
        outer.write_bool(false);
        outer.write_buffer(&inner);

        assert!(!outer.read_bool().unwrap());
        assert_eq!(outer.read_bits(3).unwrap(), 0b101);
        assert_eq!(outer.read_bytes(2).unwrap(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_object_and_checked_bytes() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Hail {
            name: String,
            level: u16,
        }

        let mut buf = BitBuffer::new();
        let hail = Hail {
            name: "player".into(),
            level: 9,
        };
        buf.write_object(&hail).unwrap();
        buf.write_checked_bytes(b"payload");

        assert_eq!(buf.read_object::<Hail>().unwrap(), hail);
        assert_eq!(buf.read_checked_bytes().unwrap(), b"payload".to_vec());
    }

    #[test]
    fn test_checked_bytes_detects_corruption() {
        let mut buf = BitBuffer::new();
        buf.write_checked_bytes(b"payload");
        let mut raw = buf.as_bytes().to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;

        let mut corrupted = BitBuffer::from_slice(&raw);
        assert!(matches!(
            corrupted.read_checked_bytes(),
            Err(Error::ChecksumMismatch { .. })
        ));
    }
}
