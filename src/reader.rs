// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::anyhow;
use bitreader::BitReader;

use crate::helpers;

/// Bit reader over a single OBU's payload.
///
/// Reads past the end of the payload surface as errors and abort the current
/// parse through `?` propagation, so a failed read can never be followed by a
/// successful one on the same OBU.
pub struct Reader<'a>(BitReader<'a>);

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self(BitReader::new(data))
    }

    /// Implements f(1) to return a bool for convenience.
    pub fn read_bit(&mut self) -> anyhow::Result<bool> {
        self.0.read_bool().map_err(|e| anyhow!(e))
    }

    /// Implements f(n): Unsigned n-bit number appearing directly in the
    /// bitstream. The bits are read from high to low order. See 4.10.2.
    pub fn read_bits(&mut self, num_bits: u8) -> anyhow::Result<u32> {
        self.0.read_u32(num_bits).map_err(|e| anyhow!(e))
    }

    /// Implements su(n): Signed integer converted from an n bit unsigned
    /// integer in the bitstream by sign extension from bit n-1. See 4.10.6.
    pub fn read_sbits(&mut self, num_bits: u8) -> anyhow::Result<i32> {
        let mut value = self.read_bits(num_bits)? as i32;
        let sign_mask = 1 << (num_bits - 1);

        if (value & sign_mask) != 0 {
            value -= 2 * sign_mask;
        }

        Ok(value)
    }

    /// Implements uvlc(): Variable length unsigned n-bit number appearing
    /// directly in the bitstream. Returns `u32::MAX` for 32 or more leading
    /// zeroes, which callers treat as invalid. See 4.10.3.
    pub fn read_uvlc(&mut self) -> anyhow::Result<u32> {
        let mut leading_zeroes = 0;
        loop {
            let done = self.read_bit()?;

            if done {
                break;
            }

            leading_zeroes += 1;
        }

        if leading_zeroes >= 32 {
            return Ok(u32::MAX);
        }

        if leading_zeroes == 0 {
            return Ok(0);
        }

        let value = self.read_bits(leading_zeroes)?;
        Ok(value + (1 << leading_zeroes) - 1)
    }

    /// Implements leb128(): Unsigned integer represented by a variable number
    /// of little-endian bytes, at most eight of them. Values that do not fit
    /// in 32 bits are rejected. See 4.10.5.
    pub fn read_uleb128(&mut self) -> anyhow::Result<u32> {
        assert!(self.0.is_aligned(1));

        let mut value = 0u64;
        let mut i = 0;

        loop {
            let byte = u64::from(self.read_bits(8)?);
            value |= (byte & 0x7f) << i;
            i += 7;

            if byte & 0x80 == 0 {
                break;
            }
            if i >= 56 {
                return Err(anyhow!("leb128 value exceeds 8 bytes"));
            }
        }

        if value > u64::from(u32::MAX) {
            return Err(anyhow!("leb128 value exceeds 32 bits"));
        }

        Ok(value as u32)
    }

    /// Implements ns(n): Unsigned encoded integer with maximum number of
    /// values n, i.e. output in range 0..n-1. See 4.10.7.
    pub fn read_uniform(&mut self, max: u32) -> anyhow::Result<u32> {
        if max < 2 {
            return Ok(0);
        }

        let l = helpers::floor_log2(max) + 1;
        let m = (1 << l) - max;
        let v = self.read_bits(u8::try_from(l - 1)?)?;

        if v < m {
            return Ok(v);
        }

        let extra_bit = u32::from(self.read_bit()?);
        Ok((v << 1) - m + extra_bit)
    }

    /// Implements decode_subexp(): `num_syms` is the number of decodable
    /// values, and the final escape codes the `num_syms - mk` remaining
    /// values with ns(). See 5.9.26.
    fn decode_subexp(&mut self, num_syms: u32) -> anyhow::Result<u32> {
        let mut i = 0;
        let mut mk = 0u32;
        let k = 3;

        loop {
            let b2 = if i != 0 { k + i - 1 } else { k };
            let a = 1u32 << b2;
            if num_syms <= mk + 3 * a {
                return Ok(self.read_uniform(num_syms - mk)? + mk);
            }
            if !self.read_bit()? {
                return Ok(self.read_bits(u8::try_from(b2)?)? + mk);
            }
            i += 1;
            mk += a;
        }
    }

    /// Implements decode_unsigned_subexp_with_ref(): recenters the decoded
    /// value around the prediction `r`, output in range 0..mx-1. See 5.9.27.
    fn read_unsigned_subexp_with_ref(&mut self, mx: u32, r: u32) -> anyhow::Result<u32> {
        let v = self.decode_subexp(mx)?;
        Ok(if r * 2 <= mx {
            helpers::inverse_recenter(r, v)
        } else {
            mx - 1 - helpers::inverse_recenter(mx - 1 - r, v)
        })
    }

    /// Implements decode_signed_subexp_with_ref() over the symmetric range
    /// -(1 << n)..=(1 << n) used by the global motion parameters. See
    /// 5.9.25.
    pub fn read_bits_subexp(&mut self, r: i32, n: u32) -> anyhow::Result<i32> {
        let mx = (2 << n) + 1;
        let v = self.read_unsigned_subexp_with_ref(mx, (r + (1 << n)) as u32)?;
        Ok(v as i32 - (1 << n))
    }

    /// Implements 5.9.13: Delta quantizer syntax.
    pub fn read_delta_q(&mut self) -> anyhow::Result<i32> {
        if self.read_bit()? {
            self.read_sbits(7)
        } else {
            Ok(0)
        }
    }

    /// Implements 5.3.5: Byte alignment syntax.
    pub fn byte_alignment(&mut self) -> anyhow::Result<()> {
        while (self.0.position() & 7) != 0 {
            self.read_bit()?;
        }

        Ok(())
    }

    /// Implements 5.3.4: Trailing bits syntax. A single one bit followed by
    /// zero bits to the end of the OBU. Only validated in strict mode; the
    /// relaxed path merely checks that the one bit is still inside the OBU.
    pub fn check_trailing_bits(&mut self, strict: bool) -> anyhow::Result<()> {
        let trailing_one_bit = self.read_bit()?;

        if !strict {
            return Ok(());
        }

        if !trailing_one_bit {
            return Err(anyhow!("trailing_one_bit is not set"));
        }

        while (self.0.position() & 7) != 0 {
            if self.read_bit()? {
                return Err(anyhow!("trailing_zero_bit is set"));
            }
        }

        while self.0.remaining() >= 8 {
            if self.read_bits(8)? != 0 {
                return Err(anyhow!("non-zero byte after trailing bits"));
            }
        }

        Ok(())
    }

    /// Skips `num_bits` bits.
    pub fn skip(&mut self, num_bits: u64) -> anyhow::Result<()> {
        self.0.skip(num_bits).map_err(|e| anyhow!(e))
    }

    /// Current position in bits from the start of the payload.
    pub fn position(&self) -> u64 {
        self.0.position()
    }

    pub fn remaining_bits(&self) -> u64 {
        self.0.remaining()
    }
}
