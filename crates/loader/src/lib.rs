use anyhow::{anyhow, bail, Context, Result};
use flashseq_core::geometry::FlashGeometry;
use flashseq_core::memory::{ProgramImage, ERASED};
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Bytes written by one four-word program operation.
pub const CHUNK_BYTES: usize = 16;

pub fn load_elf(path: &Path) -> Result<ProgramImage> {
    let buffer = fs::read(path).with_context(|| format!("Failed to read ELF file: {:?}", path))?;
    parse_elf(&buffer)
}

pub fn parse_elf(buffer: &[u8]) -> Result<ProgramImage> {
    let elf = Elf::parse(buffer).context("Failed to parse ELF binary")?;

    info!("ELF Entry Point: {:#x}", elf.entry);

    let mut program_image = ProgramImage::new(elf.entry);

    for ph in elf.program_headers {
        if ph.p_type == PT_LOAD {
            // Physical address (LMA) is where the bytes live in flash
            let start_addr = ph.p_paddr;
            let size = ph.p_filesz as usize;
            let offset = ph.p_offset as usize;

            if size == 0 {
                continue;
            }

            debug!(
                "Found Loadable Segment: Addr={:#x}, Size={} bytes, Offset={:#x}",
                start_addr, size, offset
            );

            if offset + size > buffer.len() {
                return Err(anyhow!("Segment out of bounds in ELF file"));
            }

            let segment_data = buffer[offset..offset + size].to_vec();
            program_image.add_segment(start_addr, segment_data);
        }
    }

    if program_image.segments.is_empty() {
        warn!("No loadable segments found in ELF file");
    }

    Ok(program_image)
}

/// One four-word program operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramChunk {
    pub address: u32,
    pub words: [u32; 4],
}

/// How an image lands in the main array: the pages to erase and the chunks
/// to program afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashLayout {
    pub pages: BTreeSet<u32>,
    pub chunks: Vec<ProgramChunk>,
}

impl FlashLayout {
    /// Splits every segment into 16-byte aligned chunks, padding with the
    /// erased value. Chunks that would stay erased are skipped.
    pub fn plan(image: &ProgramImage, geometry: &FlashGeometry) -> Result<Self> {
        let mut layout = FlashLayout::default();
        let mut staged: Vec<(u32, [u8; CHUNK_BYTES])> = Vec::new();

        for segment in &image.segments {
            let start = u32::try_from(segment.start_addr)
                .with_context(|| format!("Segment at {:#x} is outside the 32-bit address space", segment.start_addr))?;
            let end = start
                .checked_add(segment.data.len() as u32)
                .ok_or_else(|| anyhow!("Segment at {:#x} wraps the address space", start))?;
            if start < geometry.main.start || end > geometry.main.end {
                bail!(
                    "Segment {:#x}..{:#x} does not fit the main array {:#x}..{:#x}",
                    start,
                    end,
                    geometry.main.start,
                    geometry.main.end
                );
            }

            for (i, byte) in segment.data.iter().enumerate() {
                let addr = start + i as u32;
                let base = addr & !(CHUNK_BYTES as u32 - 1);
                let idx = match staged.binary_search_by_key(&base, |(a, _)| *a) {
                    Ok(idx) => idx,
                    Err(idx) => {
                        staged.insert(idx, (base, [ERASED; CHUNK_BYTES]));
                        idx
                    }
                };
                staged[idx].1[(addr - base) as usize] = *byte;
            }

            let first_page = (start - geometry.main.start) / geometry.page_size;
            let last_page = (end - 1 - geometry.main.start) / geometry.page_size;
            layout.pages.extend(
                (first_page..=last_page).map(|p| geometry.main.start + p * geometry.page_size),
            );
        }

        for (address, bytes) in staged {
            if bytes.iter().all(|b| *b == ERASED) {
                continue;
            }
            let mut words = [0u32; 4];
            for (word, raw) in words.iter_mut().zip(bytes.chunks_exact(4)) {
                *word = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            }
            layout.chunks.push(ProgramChunk { address, words });
        }

        debug!(
            "Image layout: {} pages, {} chunks",
            layout.pages.len(),
            layout.chunks.len()
        );
        Ok(layout)
    }
}
