use serde::{Deserialize, Serialize};

/// Value of every byte after an erase.
pub const ERASED: u8 = 0xFF;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub start_addr: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramImage {
    pub entry_point: u64,
    pub segments: Vec<Segment>,
}

impl ProgramImage {
    pub fn new(entry_point: u64) -> Self {
        Self {
            entry_point,
            segments: Vec::new(),
        }
    }

    pub fn add_segment(&mut self, start_addr: u64, data: Vec<u8>) {
        self.segments.push(Segment { start_addr, data });
    }

    pub fn total_size(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }
}

/// A flat flash array. Starts out erased.
#[derive(Debug)]
pub struct LinearMemory {
    pub data: Vec<u8>,
    pub base_addr: u32,
}

impl LinearMemory {
    pub fn new(size: usize, base_addr: u32) -> Self {
        Self {
            data: vec![ERASED; size],
            base_addr,
        }
    }

    fn index(&self, addr: u32, len: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base_addr)? as usize;
        if offset + len <= self.data.len() {
            Some(offset)
        } else {
            None
        }
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.index(addr, 1).is_some()
    }

    pub fn read(&self, addr: u32, width: usize) -> Option<u32> {
        let offset = self.index(addr, width)?;
        Some(
            self.data[offset..offset + width]
                .iter()
                .rev()
                .fold(0u32, |acc, b| (acc << 8) | *b as u32),
        )
    }

    pub fn read_u32(&self, addr: u32) -> Option<u32> {
        self.read(addr, 4)
    }

    pub fn read_u16(&self, addr: u32) -> Option<u16> {
        self.read(addr, 2).map(|v| v as u16)
    }

    pub fn write(&mut self, addr: u32, value: u32, width: usize) -> bool {
        match self.index(addr, width) {
            Some(offset) => {
                for (i, byte) in self.data[offset..offset + width].iter_mut().enumerate() {
                    *byte = (value >> (i * 8)) as u8;
                }
                true
            }
            None => false,
        }
    }

    /// Erase `len` bytes starting at `addr`.
    pub fn erase(&mut self, addr: u32, len: usize) -> bool {
        match self.index(addr, len) {
            Some(offset) => {
                self.data[offset..offset + len].fill(ERASED);
                true
            }
            None => false,
        }
    }

    pub fn erase_all(&mut self) {
        self.data.fill(ERASED);
    }
}
