use anyhow::Context;

const POPCOUNT: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).count_ones() as u8;
        i += 1;
    }
    table
};

/// Compact set of piece indices with an incrementally maintained popcount.
///
/// Spare bits past `bit_len` in the last byte are always zero; every
/// operation that could touch them masks them off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    bytes: Vec<u8>,
    bit_len: u32,
    cached_count: u32,
    count_valid: bool,
}

impl BitField {
    pub fn empty(bit_len: u32) -> Self {
        let byte_len = (bit_len as usize).div_ceil(8).max(1);
        Self {
            bytes: vec![0; byte_len],
            bit_len,
            cached_count: 0,
            count_valid: true,
        }
    }

    /// Bulk load from wire bytes. The byte length must match the piece count
    /// exactly; set spare bits are a protocol violation.
    pub fn from_bytes(bytes: &[u8], bit_len: u32) -> anyhow::Result<Self> {
        let expected = (bit_len as usize).div_ceil(8).max(1);
        anyhow::ensure!(
            bytes.len() == expected,
            "bitfield length {} does not fit {} pieces",
            bytes.len(),
            bit_len
        );
        let mut this = Self {
            bytes: bytes.to_vec(),
            bit_len,
            cached_count: 0,
            count_valid: false,
        };
        let spare = this.spare_mask();
        let last = this.bytes.last().copied().unwrap_or(0);
        anyhow::ensure!(last & !spare == 0, "bitfield has bits set past piece {}", bit_len);
        Ok(this)
    }

    /// Mask keeping only the valid bits of the last byte.
    fn spare_mask(&self) -> u8 {
        let used = self.bit_len % 8;
        if used == 0 {
            0xff
        } else {
            !(0xffu8 >> used)
        }
    }

    pub fn bit_len(&self) -> u32 {
        self.bit_len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.bit_len {
            return false;
        }
        let byte = self.bytes[index as usize / 8];
        byte & 1u8.rotate_right(index % 8 + 1) != 0
    }

    pub fn set(&mut self, index: u32, value: bool) -> anyhow::Result<()> {
        let byte = self
            .bytes
            .get_mut(index as usize / 8)
            .filter(|_| index < self.bit_len)
            .with_context(|| format!("bit {index} does not exist"))?;
        let mask = 1u8.rotate_right(index % 8 + 1);
        let was_set = *byte & mask != 0;
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
        if self.count_valid && was_set != value {
            if value {
                self.cached_count += 1;
            } else {
                self.cached_count -= 1;
            }
        }
        Ok(())
    }

    /// Number of set bits; recomputes through the popcount table when the
    /// incremental cache was invalidated by a bulk load.
    pub fn count(&mut self) -> u32 {
        if !self.count_valid {
            self.cached_count = self.count_from(0);
            self.count_valid = true;
        }
        self.cached_count
    }

    /// Popcount of all bytes from `byte_idx` to the end.
    pub fn count_from(&self, byte_idx: usize) -> u32 {
        self.bytes[byte_idx.min(self.bytes.len())..]
            .iter()
            .map(|b| POPCOUNT[*b as usize] as u32)
            .sum()
    }

    pub fn is_full(&mut self) -> bool {
        self.count() == self.bit_len
    }

    pub fn pieces(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.bit_len).filter(|i| self.get(*i))
    }

    pub fn missing_pieces(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.bit_len).filter(|i| !self.get(*i))
    }
}
