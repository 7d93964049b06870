use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use goblin::pe::header::{SIZEOF_COFF_HEADER, SIZEOF_PE_MAGIC};
use goblin::pe::section_table::{IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_READ};
use goblin::pe::PE;

use crate::section::UkiSection;

/// Size of one section table entry.
const SECTION_HEADER_SIZE: usize = 40;
/// Offset of SizeOfImage into the optional header, identical for PE32 and
/// PE32+.
const SIZE_OF_IMAGE_OFFSET: usize = 56;
/// Offset of CheckSum into the optional header, identical for PE32 and
/// PE32+.
const CHECKSUM_OFFSET: usize = 64;

/// Read the data from a section of a PE binary.
///
/// The binary is supplied as a `u8` slice.
pub fn read_section_data<'a>(file_data: &'a [u8], section_name: &str) -> Option<&'a [u8]> {
    let pe_binary = PE::parse(file_data).ok()?;

    pe_binary
        .sections
        .iter()
        .find(|s| s.name().map(|n| n == section_name).unwrap_or(false))
        .and_then(|s| {
            let section_start: usize = s.pointer_to_raw_data.try_into().ok()?;
            let section_len: usize = s.virtual_size.min(s.size_of_raw_data).try_into().ok()?;
            file_data.get(section_start..section_start + section_len)
        })
}

/// Extract the SBAT revocation metadata embedded in the stub.
pub fn get_sbat(stub: &Path) -> Result<Vec<u8>> {
    let data = fs::read(stub).with_context(|| format!("Failed to read stub {stub:?}"))?;
    let sbat = read_section_data(&data, ".sbat")
        .with_context(|| format!("PE section '.sbat' is missing or empty: {stub:?}"))?;
    Ok(sbat.to_vec())
}

/// Header facts the assembler needs, lifted out of the parsed PE so the
/// borrow on the file bytes can be dropped before we mutate them.
struct Layout {
    coff_offset: usize,
    opt_offset: usize,
    section_table_offset: usize,
    number_of_sections: usize,
    section_alignment: u64,
    file_alignment: u64,
    size_of_headers: usize,
    next_vma: u64,
}

fn layout(data: &[u8]) -> Result<Layout> {
    let pe = PE::parse(data).context("Failed to parse stub PE")?;
    let opt = pe
        .header
        .optional_header
        .context("Stub PE has no optional header")?;

    let coff_offset = pe.header.dos_header.pe_pointer as usize + SIZEOF_PE_MAGIC;
    let opt_offset = coff_offset + SIZEOF_COFF_HEADER;
    let section_table_offset =
        opt_offset + pe.header.coff_header.size_of_optional_header as usize;

    let section_alignment = u64::from(opt.windows_fields.section_alignment);
    let file_alignment = u64::from(opt.windows_fields.file_alignment);
    if section_alignment == 0 || file_alignment == 0 {
        bail!("Stub PE has zero section or file alignment");
    }

    let image_end = pe
        .sections
        .iter()
        .map(|s| u64::from(s.virtual_address) + u64::from(s.virtual_size))
        .max()
        .unwrap_or(section_alignment);

    Ok(Layout {
        coff_offset,
        opt_offset,
        section_table_offset,
        number_of_sections: pe.header.coff_header.number_of_sections as usize,
        section_alignment,
        file_alignment,
        size_of_headers: opt.windows_fields.size_of_headers as usize,
        next_vma: align_up(image_end, section_alignment),
    })
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

/// Append the planned sections onto the stub and write the resulting
/// (unsigned) UKI to `output`.
///
/// Each appended section gets the next virtual address past the stub's
/// image end, rounded up to SectionAlignment; its raw data is appended at a
/// FileAlignment boundary. NumberOfSections, SizeOfImage, the section table
/// and the header checksum are fixed up to match. Sections with
/// `append == false` are left alone; their size/vma stay zero.
pub fn append_sections(stub: &Path, sections: &mut [UkiSection], output: &Path) -> Result<()> {
    let mut image = fs::read(stub).with_context(|| format!("Failed to read stub {stub:?}"))?;
    let layout = layout(&image)?;

    let appended = sections.iter().filter(|s| s.append).count();
    let table_end = layout.section_table_offset
        + (layout.number_of_sections + appended) * SECTION_HEADER_SIZE;
    if table_end > layout.size_of_headers {
        bail!("No room left in the PE header for {appended} extra sections");
    }

    let mut next_vma = layout.next_vma;
    let mut header_cursor =
        layout.section_table_offset + layout.number_of_sections * SECTION_HEADER_SIZE;

    for section in sections.iter_mut().filter(|s| s.append) {
        let contents = fs::read(&section.path).with_context(|| {
            format!("Failed to read section {} from {:?}", section.name, section.path)
        })?;

        let vma = u32::try_from(next_vma)
            .with_context(|| format!("Virtual address overflow appending {}", section.name))?;
        let virtual_size = u32::try_from(contents.len())
            .with_context(|| format!("Section {} is too large", section.name))?;
        let raw_offset = u32::try_from(align_up(image.len() as u64, layout.file_alignment))
            .with_context(|| format!("File offset overflow appending {}", section.name))?;
        let raw_size = u32::try_from(align_up(contents.len() as u64, layout.file_alignment))
            .with_context(|| format!("Section {} is too large", section.name))?;

        image.resize(raw_offset as usize, 0);
        image.extend_from_slice(&contents);
        image.resize(raw_offset as usize + raw_size as usize, 0);

        let name = section.name.as_str().as_bytes();
        if name.len() > 8 {
            bail!("Section name {} does not fit the PE name field", section.name);
        }

        let mut header = [0u8; SECTION_HEADER_SIZE];
        header[..name.len()].copy_from_slice(name);
        header[8..12].copy_from_slice(&virtual_size.to_le_bytes());
        header[12..16].copy_from_slice(&vma.to_le_bytes());
        header[16..20].copy_from_slice(&raw_size.to_le_bytes());
        header[20..24].copy_from_slice(&raw_offset.to_le_bytes());
        header[36..40]
            .copy_from_slice(&(IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ).to_le_bytes());
        image[header_cursor..header_cursor + SECTION_HEADER_SIZE].copy_from_slice(&header);
        header_cursor += SECTION_HEADER_SIZE;

        section.size = contents.len() as u64;
        section.vma = u64::from(vma);
        log::debug!(
            "Appended section {} at vma {vma:#x} ({} bytes)",
            section.name,
            contents.len()
        );

        next_vma = align_up(
            u64::from(vma) + u64::from(virtual_size.max(1)),
            layout.section_alignment,
        );
    }

    let count = u16::try_from(layout.number_of_sections + appended)
        .context("Section count overflows the COFF header")?;
    image[layout.coff_offset + 2..layout.coff_offset + 4]
        .copy_from_slice(&count.to_le_bytes());

    let size_of_image =
        u32::try_from(next_vma).context("SizeOfImage overflow after appending sections")?;
    let off = layout.opt_offset + SIZE_OF_IMAGE_OFFSET;
    image[off..off + 4].copy_from_slice(&size_of_image.to_le_bytes());

    let checksum_offset = layout.opt_offset + CHECKSUM_OFFSET;
    let checksum = compute_checksum(&image, checksum_offset);
    image[checksum_offset..checksum_offset + 4].copy_from_slice(&checksum.to_le_bytes());

    fs::write(output, &image)
        .with_context(|| format!("Failed to write assembled UKI to {output:?}"))?;
    Ok(())
}

/// PE header checksum: a 16-bit folded sum over the whole file with the
/// CheckSum field itself excluded, plus the file length.
fn compute_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i + 1 < data.len() {
        if i == checksum_offset {
            i += 4;
            continue;
        }
        sum += u32::from(u16::from_le_bytes([data[i], data[i + 1]]));
        sum = (sum & 0xffff) + (sum >> 16);
        i += 2;
    }
    if i < data.len() {
        sum += u32::from(data[i]);
        sum = (sum & 0xffff) + (sum >> 16);
    }

    sum += sum >> 16;
    sum &= 0xffff;
    sum.wrapping_add(data.len() as u32)
}
