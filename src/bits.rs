use std::{error, fmt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    EndOfStream,
    BadBitWidth(u8),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => f.write_str("end of stream"),
            Self::BadBitWidth(width) => write!(f, "bit width `{width}` out of range 1..=8"),
        }
    }
}

impl error::Error for Error {}

/// The order bits are consumed within each source byte. Orthogonal to
/// the byte order used for multi-byte numeric reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    /// Bit 0 (value 1) of each byte is read first.
    Lsb0,
    /// Bit 7 (value 0x80) of each byte is read first.
    Msb0,
}

/// Byte order for multi-byte numeric reads; orthogonal to `BitOrder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

/// A bit-accurate reader over a borrowed byte slice.
///
/// Tracks a read cursor in bits, a separately resettable byte counter, and
/// exposes both single-bit-field reads and byte-order-aware multi-byte
/// reads. Bit order is fixed for the lifetime of the stream.
#[derive(Debug, Clone)]
pub struct BitStream<'input> {
    buffer: &'input [u8],
    bit_order: BitOrder,
    /// Absolute bit offset into `buffer`.
    offset: usize,
    /// Byte position (as of the last `reset_counter`) that `counter()` is
    /// measured from.
    counter_base: usize,
}

impl<'input> BitStream<'input> {
    #[must_use]
    pub fn new(buffer: &'input [u8], bit_order: BitOrder) -> Self {
        Self {
            buffer,
            bit_order,
            offset: 0,
            counter_base: 0,
        }
    }

    #[must_use]
    pub fn bit_order(&self) -> BitOrder {
        self.bit_order
    }

    /// Reads the next `width` (1..=8) bits, packed into the low bits of a byte.
    pub fn read_bit_field(&mut self, width: u8) -> Result<u8, Error> {
        if width < 1 || width > 8 {
            return Err(Error::BadBitWidth(width));
        }
        let byte_index = self.offset >> 3;
        let bit_in_byte = self.offset & 7;
        let upper_bound = self.offset + width as usize;
        if upper_bound > self.buffer.len() << 3 {
            return Err(Error::EndOfStream);
        }
        let byte = *self.buffer.get(byte_index).ok_or(Error::EndOfStream)?;
        let value = match self.bit_order {
            BitOrder::Lsb0 => {
                if bit_in_byte + width as usize <= 8 {
                    (byte >> bit_in_byte) & ((1u16 << width) - 1) as u8
                } else {
                    let next = *self.buffer.get(byte_index + 1).ok_or(Error::EndOfStream)?;
                    let low_bits = 8 - bit_in_byte;
                    let low = (byte >> bit_in_byte) as u16;
                    let high = (next as u16) << low_bits;
                    ((low | high) & ((1u16 << width) - 1)) as u8
                }
            }
            BitOrder::Msb0 => {
                if bit_in_byte + width as usize <= 8 {
                    (byte >> (8 - bit_in_byte - width as usize)) & ((1u16 << width) - 1) as u8
                } else {
                    let next = *self.buffer.get(byte_index + 1).ok_or(Error::EndOfStream)?;
                    let high_bits = 8 - bit_in_byte;
                    let low_bits = width as usize - high_bits;
                    let high = (byte & ((1u16 << high_bits) - 1) as u8) as u16;
                    let low = (next >> (8 - low_bits)) as u16;
                    ((high << low_bits) | low) as u8
                }
            }
        };
        self.offset = upper_bound;
        Ok(value)
    }

    pub fn read_byte(&mut self) -> Result<i32, Error> {
        Ok(self.read_bit_field(8)? as i8 as i32)
    }

    pub fn read_ubyte(&mut self) -> Result<i32, Error> {
        Ok(self.read_bit_field(8)? as i32)
    }

    pub fn read_boolean(&mut self) -> Result<bool, Error> {
        Ok(self.read_bit_field(8)? != 0)
    }

    fn read_bytes_ordered(&mut self, count: usize, order: ByteOrder) -> Result<u64, Error> {
        let mut bytes = [0u8; 8];
        for b in bytes.iter_mut().take(count) {
            *b = self.read_bit_field(8)?;
        }
        let value = match order {
            ByteOrder::BigEndian => {
                let mut v = 0u64;
                for &b in bytes.iter().take(count) {
                    v = (v << 8) | b as u64;
                }
                v
            }
            ByteOrder::LittleEndian => {
                let mut v = 0u64;
                for &b in bytes.iter().take(count).rev() {
                    v = (v << 8) | b as u64;
                }
                v
            }
        };
        Ok(value)
    }

    pub fn read_short(&mut self, order: ByteOrder) -> Result<i32, Error> {
        Ok(self.read_bytes_ordered(2, order)? as u16 as i16 as i32)
    }

    pub fn read_ushort(&mut self, order: ByteOrder) -> Result<i32, Error> {
        Ok(self.read_bytes_ordered(2, order)? as u16 as i32)
    }

    pub fn read_int(&mut self, order: ByteOrder) -> Result<i32, Error> {
        Ok(self.read_bytes_ordered(4, order)? as u32 as i32)
    }

    pub fn read_long(&mut self, order: ByteOrder) -> Result<i64, Error> {
        Ok(self.read_bytes_ordered(8, order)? as i64)
    }

    /// `count = -1` means "until end of stream".
    pub fn read_bit_array(&mut self, count: i64, width: u8) -> Result<Vec<u8>, Error> {
        if count >= 0 {
            (0..count).map(|_| self.read_bit_field(width)).collect()
        } else {
            let mut out = Vec::new();
            while self.has_available_data() {
                out.push(self.read_bit_field(width)?);
            }
            Ok(out)
        }
    }

    pub fn read_byte_array(&mut self, count: i64) -> Result<Vec<i32>, Error> {
        if count >= 0 {
            (0..count).map(|_| self.read_byte()).collect()
        } else {
            let mut out = Vec::new();
            while self.has_available_data() {
                out.push(self.read_byte()?);
            }
            Ok(out)
        }
    }

    pub fn read_ubyte_array(&mut self, count: i64) -> Result<Vec<i32>, Error> {
        if count >= 0 {
            (0..count).map(|_| self.read_ubyte()).collect()
        } else {
            let mut out = Vec::new();
            while self.has_available_data() {
                out.push(self.read_ubyte()?);
            }
            Ok(out)
        }
    }

    pub fn read_short_array(&mut self, count: i64, order: ByteOrder) -> Result<Vec<i32>, Error> {
        if count >= 0 {
            (0..count).map(|_| self.read_short(order)).collect()
        } else {
            let mut out = Vec::new();
            while self.has_available_data() {
                out.push(self.read_short(order)?);
            }
            Ok(out)
        }
    }

    pub fn read_ushort_array(&mut self, count: i64, order: ByteOrder) -> Result<Vec<i32>, Error> {
        if count >= 0 {
            (0..count).map(|_| self.read_ushort(order)).collect()
        } else {
            let mut out = Vec::new();
            while self.has_available_data() {
                out.push(self.read_ushort(order)?);
            }
            Ok(out)
        }
    }

    pub fn read_int_array(&mut self, count: i64, order: ByteOrder) -> Result<Vec<i32>, Error> {
        if count >= 0 {
            (0..count).map(|_| self.read_int(order)).collect()
        } else {
            let mut out = Vec::new();
            while self.has_available_data() {
                out.push(self.read_int(order)?);
            }
            Ok(out)
        }
    }

    pub fn read_long_array(&mut self, count: i64, order: ByteOrder) -> Result<Vec<i64>, Error> {
        if count >= 0 {
            (0..count).map(|_| self.read_long(order)).collect()
        } else {
            let mut out = Vec::new();
            while self.has_available_data() {
                out.push(self.read_long(order)?);
            }
            Ok(out)
        }
    }

    /// If not already aligned to `n` bytes, advances to the next multiple of
    /// `n`. Always discards any in-flight bit buffer, even when already
    /// aligned (per spec: `align:1` is a no-op on position but still clears
    /// the partial-bit state).
    pub fn align(&mut self, n: u32) -> Result<(), Error> {
        let byte_pos = (self.offset + 7) / 8;
        let aligned = if n <= 1 {
            byte_pos
        } else {
            byte_pos.div_ceil(n as usize) * n as usize
        };
        if aligned > self.buffer.len() {
            return Err(Error::EndOfStream);
        }
        self.offset = aligned * 8;
        Ok(())
    }

    /// Advances up to `n` bytes, returning the number actually skipped.
    /// Discards any in-flight bit buffer first.
    pub fn skip(&mut self, n: i64) -> Result<i64, Error> {
        let byte_pos = (self.offset + 7) / 8;
        let available = self.buffer.len().saturating_sub(byte_pos) as i64;
        let actual = n.max(0).min(available);
        self.offset = (byte_pos + actual as usize) * 8;
        Ok(actual)
    }

    #[must_use]
    pub fn has_available_data(&self) -> bool {
        self.offset < self.buffer.len() << 3
    }

    /// Bytes fully consumed so far, since the last `reset_counter`.
    #[must_use]
    pub fn counter(&self) -> i64 {
        (self.offset / 8) as i64 - self.counter_base as i64
    }

    /// Sets the counter base to the current position and discards the bit
    /// buffer (realigns to the current byte boundary).
    pub fn reset_counter(&mut self) {
        self.offset = self.offset.div_ceil(8) * 8;
        self.counter_base = self.offset / 8;
    }

    /// Absolute byte position, ignoring `reset_counter` -- used by the
    /// expression evaluator's stream-counter token and by the interpreter's
    /// struct body-start bookkeeping.
    #[must_use]
    pub fn absolute_byte_position(&self) -> i64 {
        (self.offset / 8) as i64
    }
}

/// A bit-accurate writer building a byte buffer, symmetric to [`BitStream`].
/// Backs the `emit` module's round-trip emitter: every write mirrors the
/// matching `BitStream` read bit-for-bit, for the same `BitOrder`.
#[derive(Debug, Clone)]
pub struct BitWriter {
    buffer: Vec<u8>,
    bit_order: BitOrder,
    /// Absolute bit offset into `buffer` written so far.
    bit_offset: usize,
    counter_base: usize,
}

impl BitWriter {
    #[must_use]
    pub fn new(bit_order: BitOrder) -> Self {
        Self {
            buffer: Vec::new(),
            bit_order,
            bit_offset: 0,
            counter_base: 0,
        }
    }

    fn ensure_capacity(&mut self, abs_bit_index: usize) {
        let byte_index = abs_bit_index >> 3;
        if byte_index >= self.buffer.len() {
            self.buffer.resize(byte_index + 1, 0);
        }
    }

    fn set_bit(&mut self, abs_bit_index: usize, bit: bool) {
        self.ensure_capacity(abs_bit_index);
        let byte_index = abs_bit_index >> 3;
        let bit_in_byte = abs_bit_index & 7;
        let mask = match self.bit_order {
            BitOrder::Lsb0 => 1u8 << bit_in_byte,
            BitOrder::Msb0 => 1u8 << (7 - bit_in_byte),
        };
        if bit {
            self.buffer[byte_index] |= mask;
        } else {
            self.buffer[byte_index] &= !mask;
        }
    }

    /// Writes the low `width` (1..=8) bits of `value`, in the same bit
    /// order `read_bit_field` would consume them back out.
    pub fn write_bit_field(&mut self, value: u8, width: u8) -> Result<(), Error> {
        if !(1..=8).contains(&width) {
            return Err(Error::BadBitWidth(width));
        }
        for i in 0..width {
            let bit = match self.bit_order {
                BitOrder::Lsb0 => (value >> i) & 1 != 0,
                BitOrder::Msb0 => (value >> (width - 1 - i)) & 1 != 0,
            };
            self.set_bit(self.bit_offset, bit);
            self.bit_offset += 1;
        }
        Ok(())
    }

    pub fn write_byte(&mut self, value: i32) {
        self.write_bit_field(value as u8, 8).expect("width 8 is always valid");
    }

    pub fn write_ubyte(&mut self, value: i32) {
        self.write_bit_field(value as u8, 8).expect("width 8 is always valid");
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_byte(i32::from(value));
    }

    fn write_bytes_ordered(&mut self, value: u64, count: usize, order: ByteOrder) {
        for i in 0..count {
            let shift = match order {
                ByteOrder::BigEndian => (count - 1 - i) * 8,
                ByteOrder::LittleEndian => i * 8,
            };
            self.write_byte(((value >> shift) & 0xff) as i32);
        }
    }

    pub fn write_short(&mut self, value: i32, order: ByteOrder) {
        self.write_bytes_ordered(value as u16 as u64, 2, order);
    }

    pub fn write_ushort(&mut self, value: i32, order: ByteOrder) {
        self.write_bytes_ordered(value as u16 as u64, 2, order);
    }

    pub fn write_int(&mut self, value: i32, order: ByteOrder) {
        self.write_bytes_ordered(value as u32 as u64, 4, order);
    }

    pub fn write_long(&mut self, value: i64, order: ByteOrder) {
        self.write_bytes_ordered(value as u64, 8, order);
    }

    /// Pads with zero bits to the next byte boundary, then with zero bytes
    /// to the next multiple of `n` (a no-op past the byte boundary when
    /// `n <= 1`), matching `BitStream::align`'s bit-buffer-discarding rule.
    pub fn align(&mut self, n: u32) {
        if self.bit_offset % 8 != 0 {
            let pad = 8 - (self.bit_offset % 8);
            self.bit_offset += pad;
            self.ensure_capacity(self.bit_offset - 1);
        }
        let byte_pos = self.bit_offset / 8;
        let aligned = if n <= 1 {
            byte_pos
        } else {
            byte_pos.div_ceil(n as usize) * n as usize
        };
        self.bit_offset = aligned * 8;
        if self.bit_offset > 0 {
            self.ensure_capacity(self.bit_offset - 1);
        }
    }

    /// Writes `n` zero bytes. The skipped region's original contents are
    /// not part of the field tree and so cannot be reconstructed; callers
    /// relying on byte-exact round-trips through a `skip:` directive must
    /// ensure the source only ever puts zeroes there.
    pub fn skip(&mut self, n: i64) {
        let n = n.max(0) as usize;
        if n == 0 {
            return;
        }
        self.bit_offset += n * 8;
        self.ensure_capacity(self.bit_offset - 1);
    }

    #[must_use]
    pub fn counter(&self) -> i64 {
        (self.bit_offset / 8) as i64 - self.counter_base as i64
    }

    pub fn reset_counter(&mut self) {
        self.bit_offset = self.bit_offset.div_ceil(8) * 8;
        self.counter_base = self.bit_offset / 8;
    }

    /// Finishes writing and returns the accumulated bytes. Any unfilled
    /// bits of a trailing partial byte are zero.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}
