//! Minimal EXIF writer for the descriptive IFD0 tags we stamp on generated images.
//!
//! The payload is a little-endian TIFF structure prefixed with the `Exif\0\0`
//! identifier, ready to be placed in a JPEG APP1 segment.

use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};

pub const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";

pub const TAG_IMAGE_DESCRIPTION: u16 = 0x010e;
pub const TAG_MAKE: u16 = 0x010f;
pub const TAG_MODEL: u16 = 0x0110;
pub const TAG_SOFTWARE: u16 = 0x0131;

const TYPE_ASCII: u16 = 2;
const TIFF_HEADER_LEN: u32 = 8;
const IFD_ENTRY_LEN: u32 = 12;

/// Encodes ASCII-typed IFD0 entries. Values are written as UTF-8 with a NUL terminator.
pub fn encode(entries: &[(u16, &str)]) -> io::Result<Vec<u8>> {
    let mut entries: Vec<(u16, Vec<u8>)> = entries
        .iter()
        .map(|(tag, value)| {
            let mut bytes: Vec<u8> = value.bytes().filter(|&b| b != 0).collect();
            bytes.push(0);
            (*tag, bytes)
        })
        .collect();
    // IFD entries must be sorted by tag.
    entries.sort_by_key(|(tag, _)| *tag);

    let count = entries.len() as u32;
    let ifd_len = 2 + count * IFD_ENTRY_LEN + 4;
    let mut data_offset = TIFF_HEADER_LEN + ifd_len;

    let mut out = Vec::with_capacity(EXIF_HEADER.len() + data_offset as usize);
    out.write_all(EXIF_HEADER)?;
    out.write_all(b"II")?;
    out.write_u16::<LittleEndian>(42)?;
    out.write_u32::<LittleEndian>(TIFF_HEADER_LEN)?;

    out.write_u16::<LittleEndian>(count as u16)?;
    let mut data = Vec::new();
    for (tag, value) in &entries {
        out.write_u16::<LittleEndian>(*tag)?;
        out.write_u16::<LittleEndian>(TYPE_ASCII)?;
        out.write_u32::<LittleEndian>(value.len() as u32)?;
        if value.len() <= 4 {
            let mut inline = [0u8; 4];
            inline[..value.len()].copy_from_slice(value);
            out.write_all(&inline)?;
        } else {
            out.write_u32::<LittleEndian>(data_offset)?;
            data.extend_from_slice(value);
            // Offsets must be word aligned.
            if data.len() % 2 == 1 {
                data.push(0);
            }
            data_offset = TIFF_HEADER_LEN + ifd_len + data.len() as u32;
        }
    }
    // No IFD1.
    out.write_u32::<LittleEndian>(0)?;
    out.write_all(&data)?;
    Ok(out)
}

/// Reads back an ASCII tag from an encoded payload.
#[cfg(test)]
pub(crate) fn read_ascii(payload: &[u8], wanted: u16) -> Option<String> {
    use byteorder::{ByteOrder, LittleEndian as LE};

    let tiff = payload.strip_prefix(EXIF_HEADER.as_slice())?;
    let ifd = LE::read_u32(&tiff[4..8]) as usize;
    let count = LE::read_u16(&tiff[ifd..ifd + 2]) as usize;
    (0..count).find_map(|i| {
        let entry = &tiff[ifd + 2 + i * 12..ifd + 14 + i * 12];
        if LE::read_u16(&entry[0..2]) != wanted {
            return None;
        }
        let len = LE::read_u32(&entry[4..8]) as usize;
        let bytes = if len <= 4 {
            &entry[8..8 + len]
        } else {
            let off = LE::read_u32(&entry[8..12]) as usize;
            &tiff[off..off + len]
        };
        Some(String::from_utf8_lossy(&bytes[..len - 1]).into_owned())
    })
}
