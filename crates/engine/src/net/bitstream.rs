use std::fmt;

/// Bits used by the small length field when framing a nested stream.
pub const STREAM_SMALL_SIZE_BITS: u32 = 12;
/// Bits used by the large length field, written only when the small field saturates.
pub const STREAM_LARGE_SIZE_BITS: u32 = 23;

const STREAM_SMALL_SIZE_MAX: u64 = (1 << STREAM_SMALL_SIZE_BITS) - 1;
const STREAM_LARGE_SIZE_MAX: u64 = (1 << STREAM_LARGE_SIZE_BITS) - 1;

pub const MAX_STRING_BYTES: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BitError {
    #[error("bit stream exhausted: needed {needed} bits, {available} available")]
    Exhausted { needed: usize, available: usize },
    #[error("invalid quantization range")]
    InvalidRange,
    #[error("nested stream length exceeds the large size field")]
    StreamTooLarge,
    #[error("string payload is not valid utf-8")]
    InvalidString,
}

/// Returns how many bits are required to represent every value in `0..=max_value`.
pub fn bits_to_represent(max_value: u64) -> u32 {
    64 - max_value.leading_zeros().min(63)
}

/// A growable buffer with independent bit-granular read and write cursors.
///
/// Bits are packed most-significant-first within each byte so that the wire
/// layout is independent of host endianness.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BitStream {
    data: Vec<u8>,
    bits_written: usize,
    bits_read: usize,
}

impl fmt::Debug for BitStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitStream")
            .field("bits_written", &self.bits_written)
            .field("bits_read", &self.bits_read)
            .finish()
    }
}

impl BitStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            bits_written: bytes.len() * 8,
            bits_read: 0,
        }
    }

    pub fn bits_written(&self) -> usize {
        self.bits_written
    }

    pub fn bits_read(&self) -> usize {
        self.bits_read
    }

    pub fn bits_remaining(&self) -> usize {
        self.bits_written - self.bits_read
    }

    pub fn is_empty(&self) -> bool {
        self.bits_written == 0
    }

    /// Written bits padded out to whole bytes, for handing to a socket.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.bits_written.div_ceil(8)
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.bits_written = 0;
        self.bits_read = 0;
    }

    pub fn reset_read(&mut self) {
        self.bits_read = 0;
    }

    fn ensure(&self, needed: usize) -> Result<(), BitError> {
        let available = self.bits_remaining();
        if needed > available {
            return Err(BitError::Exhausted { needed, available });
        }
        Ok(())
    }

    //
    // Writing
    //

    pub fn write_bit(&mut self, bit: bool) {
        let byte_index = self.bits_written / 8;
        let bit_index = self.bits_written % 8;
        if bit_index == 0 {
            self.data.push(0);
        }
        if bit {
            self.data[byte_index] |= 0x80 >> bit_index;
        }
        self.bits_written += 1;
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_bit(value);
    }

    /// Writes the low `bit_count` bits of `value`, most significant first.
    pub fn write_uint(&mut self, value: u64, bit_count: u32) {
        debug_assert!(bit_count <= 64);
        for i in (0..bit_count).rev() {
            self.write_bit((value >> i) & 1 != 0);
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_uint(u64::from(value), 8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_uint(u64::from(value), 16);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_uint(u64::from(value), 32);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_uint(value, 64);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_u32(value as u32);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_u64(value as u64);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    /// Writes `value` as an IEEE 754 binary16 half float (16 bits).
    pub fn write_half(&mut self, value: f32) {
        self.write_uint(u64::from(f32_to_half_bits(value)), 16);
    }

    pub fn write_string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        debug_assert!(bytes.len() <= MAX_STRING_BYTES);
        self.write_u16(bytes.len() as u16);
        for &byte in bytes {
            self.write_u8(byte);
        }
    }

    /// Quantizes an integer over the inclusive range `[min, max]` with step `quantum`.
    pub fn write_quantized_i64(
        &mut self,
        value: i64,
        min: i64,
        max: i64,
        quantum: i64,
    ) -> Result<(), BitError> {
        if min > max || quantum <= 0 {
            return Err(BitError::InvalidRange);
        }
        let steps = (max - min) as u64 / quantum as u64;
        let clamped = value.clamp(min, max);
        let index = ((clamped - min) as u64 + quantum as u64 / 2) / quantum as u64;
        self.write_uint(index.min(steps), bits_to_represent(steps));
        Ok(())
    }

    /// Quantizes a float over the inclusive range `[min, max]` with step `quantum`.
    /// Round trips within `quantum / 2`.
    pub fn write_quantized_f32(
        &mut self,
        value: f32,
        min: f32,
        max: f32,
        quantum: f32,
    ) -> Result<(), BitError> {
        if !(min <= max) || !(quantum > 0.0) {
            return Err(BitError::InvalidRange);
        }
        let steps = ((max - min) / quantum).ceil() as u64;
        let clamped = value.clamp(min, max);
        let index = (((clamped - min) / quantum) + 0.5).floor() as u64;
        self.write_uint(index.min(steps), bits_to_represent(steps));
        Ok(())
    }

    /// Appends every written bit of `other`, unaligned.
    pub fn append(&mut self, other: &BitStream) {
        for i in 0..other.bits_written {
            let byte = other.data[i / 8];
            self.write_bit(byte & (0x80 >> (i % 8)) != 0);
        }
    }

    /// Writes `other` framed by its own bit length: a small field of
    /// [`STREAM_SMALL_SIZE_BITS`], escaping to a large field of
    /// [`STREAM_LARGE_SIZE_BITS`] only when the small field saturates.
    pub fn write_sized_stream(&mut self, other: &BitStream) -> Result<(), BitError> {
        let bits = other.bits_written as u64;
        if bits > STREAM_LARGE_SIZE_MAX {
            return Err(BitError::StreamTooLarge);
        }
        if bits >= STREAM_SMALL_SIZE_MAX {
            self.write_uint(STREAM_SMALL_SIZE_MAX, STREAM_SMALL_SIZE_BITS);
            self.write_uint(bits, STREAM_LARGE_SIZE_BITS);
        } else {
            self.write_uint(bits, STREAM_SMALL_SIZE_BITS);
        }
        self.append(other);
        Ok(())
    }

    //
    // Reading
    //

    pub fn read_bit(&mut self) -> Result<bool, BitError> {
        self.ensure(1)?;
        let byte = self.data[self.bits_read / 8];
        let bit = byte & (0x80 >> (self.bits_read % 8)) != 0;
        self.bits_read += 1;
        Ok(bit)
    }

    pub fn read_bool(&mut self) -> Result<bool, BitError> {
        self.read_bit()
    }

    pub fn read_uint(&mut self, bit_count: u32) -> Result<u64, BitError> {
        debug_assert!(bit_count <= 64);
        self.ensure(bit_count as usize)?;
        let mut value = 0u64;
        for _ in 0..bit_count {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8, BitError> {
        Ok(self.read_uint(8)? as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16, BitError> {
        Ok(self.read_uint(16)? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32, BitError> {
        Ok(self.read_uint(32)? as u32)
    }

    pub fn read_u64(&mut self) -> Result<u64, BitError> {
        self.read_uint(64)
    }

    pub fn read_i32(&mut self) -> Result<i32, BitError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64, BitError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32, BitError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, BitError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_half(&mut self) -> Result<f32, BitError> {
        Ok(half_bits_to_f32(self.read_uint(16)? as u16))
    }

    pub fn read_string(&mut self) -> Result<String, BitError> {
        let len = self.read_u16()? as usize;
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(self.read_u8()?);
        }
        String::from_utf8(bytes).map_err(|_| BitError::InvalidString)
    }

    pub fn read_quantized_i64(
        &mut self,
        min: i64,
        max: i64,
        quantum: i64,
    ) -> Result<i64, BitError> {
        if min > max || quantum <= 0 {
            return Err(BitError::InvalidRange);
        }
        let steps = (max - min) as u64 / quantum as u64;
        let index = self.read_uint(bits_to_represent(steps))?;
        Ok((min + (index.min(steps) * quantum as u64) as i64).min(max))
    }

    pub fn read_quantized_f32(&mut self, min: f32, max: f32, quantum: f32) -> Result<f32, BitError> {
        if !(min <= max) || !(quantum > 0.0) {
            return Err(BitError::InvalidRange);
        }
        let steps = ((max - min) / quantum).ceil() as u64;
        let index = self.read_uint(bits_to_represent(steps))?;
        Ok((min + index as f32 * quantum).min(max))
    }

    /// Reads exactly `bit_count` bits into a fresh stream.
    pub fn read_stream(&mut self, bit_count: usize) -> Result<BitStream, BitError> {
        self.ensure(bit_count)?;
        let mut out = BitStream::new();
        for _ in 0..bit_count {
            let bit = self.read_bit()?;
            out.write_bit(bit);
        }
        Ok(out)
    }

    /// Reads a stream framed by [`write_sized_stream`](Self::write_sized_stream).
    pub fn read_sized_stream(&mut self) -> Result<BitStream, BitError> {
        let mut bits = self.read_uint(STREAM_SMALL_SIZE_BITS)?;
        if bits == STREAM_SMALL_SIZE_MAX {
            bits = self.read_uint(STREAM_LARGE_SIZE_BITS)?;
        }
        self.read_stream(bits as usize)
    }
}

pub fn f32_to_half_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;

    if exponent == 0xff {
        // Infinity and NaN keep their class; NaN payloads collapse to a quiet bit.
        let nan = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | nan | (mantissa >> 13) as u16;
    }

    let unbiased = exponent - 127 + 15;
    if unbiased >= 0x1f {
        return sign | 0x7c00;
    }
    if unbiased <= 0 {
        if unbiased < -10 {
            return sign;
        }
        let mantissa = mantissa | 0x0080_0000;
        let shift = (14 - unbiased) as u32;
        return sign | (mantissa >> shift) as u16;
    }
    sign | ((unbiased as u16) << 10) | (mantissa >> 13) as u16
}

pub fn half_bits_to_f32(half: u16) -> f32 {
    let sign = (u32::from(half) & 0x8000) << 16;
    let exponent = u32::from(half >> 10) & 0x1f;
    let mantissa = u32::from(half) & 0x03ff;

    let bits = if exponent == 0 {
        if mantissa == 0 {
            sign
        } else {
            // Subnormal half, normal f32.
            let mut exponent = 127 - 15 + 1;
            let mut mantissa = mantissa;
            while mantissa & 0x0400 == 0 {
                mantissa <<= 1;
                exponent -= 1;
            }
            sign | ((exponent as u32) << 23) | ((mantissa & 0x03ff) << 13)
        }
    } else if exponent == 0x1f {
        sign | 0x7f80_0000 | (mantissa << 13)
    } else {
        sign | ((exponent + 127 - 15) << 23) | (mantissa << 13)
    };
    f32::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trip() {
        let mut stream = BitStream::new();
        stream.write_bool(true);
        stream.write_u8(0xa5);
        stream.write_u32(123_456_789);
        stream.write_u64(u64::MAX - 7);
        stream.write_i32(-42);
        stream.write_f32(std::f32::consts::PI);
        stream.write_string("alice");

        assert!(stream.read_bool().unwrap());
        assert_eq!(stream.read_u8().unwrap(), 0xa5);
        assert_eq!(stream.read_u32().unwrap(), 123_456_789);
        assert_eq!(stream.read_u64().unwrap(), u64::MAX - 7);
        assert_eq!(stream.read_i32().unwrap(), -42);
        assert_eq!(stream.read_f32().unwrap(), std::f32::consts::PI);
        assert_eq!(stream.read_string().unwrap(), "alice");
        assert_eq!(stream.bits_remaining(), 0);
    }

    #[test]
    fn bit_conservation() {
        let mut stream = BitStream::new();
        stream.write_uint(5, 3);
        stream
            .write_quantized_f32(0.25, -1.0, 1.0, 0.01)
            .unwrap();
        stream.write_half(2.5);
        let written = stream.bits_written();

        stream.read_uint(3).unwrap();
        stream.read_quantized_f32(-1.0, 1.0, 0.01).unwrap();
        stream.read_half().unwrap();
        assert_eq!(stream.bits_read(), written);
    }

    #[test]
    fn quantized_int_exact_bits() {
        // 0..=100 in steps of 1 needs exactly 7 bits.
        let mut stream = BitStream::new();
        stream.write_quantized_i64(63, 0, 100, 1).unwrap();
        assert_eq!(stream.bits_written(), 7);
        assert_eq!(stream.read_quantized_i64(0, 100, 1).unwrap(), 63);
    }

    #[test]
    fn quantized_float_within_half_quantum() {
        let quantum = 0.05;
        for &value in &[-0.98, -0.5, 0.0, 0.123, 0.777, 1.0] {
            let mut stream = BitStream::new();
            stream.write_quantized_f32(value, -1.0, 1.0, quantum).unwrap();
            let decoded = stream.read_quantized_f32(-1.0, 1.0, quantum).unwrap();
            assert!(
                (decoded - value).abs() <= quantum / 2.0 + 1e-6,
                "value {value} decoded as {decoded}"
            );
        }
    }

    #[test]
    fn quantized_out_of_range_is_clamped() {
        let mut stream = BitStream::new();
        stream.write_quantized_f32(5.0, -1.0, 1.0, 0.1).unwrap();
        assert_eq!(stream.read_quantized_f32(-1.0, 1.0, 0.1).unwrap(), 1.0);
    }

    #[test]
    fn half_float_special_values() {
        for &value in &[0.0f32, -0.0, 1.0, -2.5, 65504.0, f32::INFINITY, f32::NEG_INFINITY] {
            let decoded = half_bits_to_f32(f32_to_half_bits(value));
            assert_eq!(decoded.to_bits(), value.to_bits());
        }
        assert!(half_bits_to_f32(f32_to_half_bits(f32::NAN)).is_nan());
        // Overflow saturates to infinity.
        assert_eq!(half_bits_to_f32(f32_to_half_bits(1e9)), f32::INFINITY);
    }

    #[test]
    fn half_float_precision() {
        let value = 123.456f32;
        let decoded = half_bits_to_f32(f32_to_half_bits(value));
        assert!((decoded - value).abs() < 0.1);
    }

    #[test]
    fn append_is_unaligned() {
        let mut inner = BitStream::new();
        inner.write_uint(0b101, 3);

        let mut outer = BitStream::new();
        outer.write_bit(true);
        outer.append(&inner);

        assert_eq!(outer.bits_written(), 4);
        assert!(outer.read_bit().unwrap());
        assert_eq!(outer.read_uint(3).unwrap(), 0b101);
    }

    #[test]
    fn sized_stream_small() {
        let mut inner = BitStream::new();
        inner.write_u32(0xdeadbeef);

        let mut outer = BitStream::new();
        outer.write_sized_stream(&inner).unwrap();
        assert_eq!(
            outer.bits_written(),
            STREAM_SMALL_SIZE_BITS as usize + 32
        );

        let mut decoded = outer.read_sized_stream().unwrap();
        assert_eq!(decoded.read_u32().unwrap(), 0xdeadbeef);
    }

    #[test]
    fn sized_stream_large() {
        let mut inner = BitStream::new();
        for i in 0..600u32 {
            inner.write_u8(i as u8);
        }
        assert!(inner.bits_written() as u64 >= STREAM_SMALL_SIZE_MAX);

        let mut outer = BitStream::new();
        outer.write_sized_stream(&inner).unwrap();
        let decoded = outer.read_sized_stream().unwrap();
        assert_eq!(decoded.bits_written(), inner.bits_written());
        assert_eq!(outer.bits_remaining(), 0);
    }

    #[test]
    fn short_read_reports_exhaustion() {
        let mut stream = BitStream::new();
        stream.write_uint(3, 4);
        let err = stream.read_u32().unwrap_err();
        assert_eq!(
            err,
            BitError::Exhausted {
                needed: 32,
                available: 4
            }
        );
    }
}
