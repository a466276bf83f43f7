//! Little-endian field access on fixed 64-byte EEPROM pages.
//!
//! [`PageReader`] never fails: a field whose byte range falls outside the
//! buffer it was handed is logged and decoded as its type's default, so one
//! short page cannot abort a whole record. [`PageWriter`] is strict about
//! ranges, because a field that does not fit is a layout defect and not
//! something to recover from at runtime.

use std::fmt::Debug;

use bytes::{Buf, BufMut};
use tracing::{debug, error, warn};

use crate::error::{AppResult, SpectroError};

/// Bytes per EEPROM page.
pub const PAGE_SIZE: usize = 64;

/// Number of pages the record occupies.
pub const PAGE_COUNT: usize = 6;

/// The last byte of every page holds that page's revision number.
pub const REVISION_OFFSET: usize = PAGE_SIZE - 1;

/// Location of a single field: page index, byte offset within the page and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Page index, 0..[`PAGE_COUNT`]
    pub page: usize,
    /// Byte offset within the page
    pub offset: usize,
    /// Width in bytes
    pub len: usize,
    /// Name used in logs and truncation reports
    pub label: &'static str,
}

impl Field {
    /// `len` bytes at `offset` on `page`.
    pub const fn new(page: usize, offset: usize, len: usize, label: &'static str) -> Self {
        Self {
            page,
            offset,
            len,
            label,
        }
    }

    /// One-past-the-end byte index.
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Decode a NUL-terminated fixed-width string.
///
/// Bytes are mapped one-to-one onto chars (Latin-1), so arbitrary binary
/// content survives a decode/encode cycle.
pub fn latin1_until_nul(buf: &[u8]) -> String {
    buf.iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect()
}

/// Read-only view over a set of pages.
pub struct PageReader<'a, B> {
    pages: &'a [B],
}

impl<'a, B: AsRef<[u8]>> PageReader<'a, B> {
    /// Wrap `pages`; callers check the page count.
    pub fn new(pages: &'a [B]) -> Self {
        Self { pages }
    }

    fn slice(&self, field: Field) -> Option<&'a [u8]> {
        let Some(page) = self.pages.get(field.page).map(AsRef::as_ref) else {
            error!(
                page = field.page,
                offset = field.offset,
                len = field.len,
                label = field.label,
                "error unpacking EEPROM field: page missing"
            );
            return None;
        };
        if field.end() > page.len() {
            error!(
                page = field.page,
                offset = field.offset,
                len = field.len,
                label = field.label,
                available = page.len(),
                "error unpacking EEPROM field: buffer too short"
            );
            return None;
        }
        Some(&page[field.offset..field.end()])
    }

    fn numeric<T: Default + Debug>(
        &self,
        field: Field,
        width: usize,
        get: impl FnOnce(&mut &[u8]) -> T,
    ) -> T {
        let Some(mut buf) = self.slice(field) else {
            return T::default();
        };
        if buf.len() != width {
            error!(
                page = field.page,
                offset = field.offset,
                len = field.len,
                width,
                label = field.label,
                "error unpacking EEPROM field: width mismatch"
            );
            return T::default();
        }
        let value = get(&mut buf);
        debug!(label = field.label, ?value, "unpacked");
        value
    }

    /// Single byte. Out-of-range fields read as zero.
    pub fn u8(&self, field: Field) -> u8 {
        self.numeric(field, 1, |b| b.get_u8())
    }

    /// Any non-zero byte is `true`.
    pub fn bool(&self, field: Field) -> bool {
        self.u8(field) != 0
    }

    /// Little-endian.
    pub fn u16(&self, field: Field) -> u16 {
        self.numeric(field, 2, |b| b.get_u16_le())
    }

    /// Little-endian.
    pub fn i16(&self, field: Field) -> i16 {
        self.numeric(field, 2, |b| b.get_i16_le())
    }

    /// Little-endian.
    pub fn u32(&self, field: Field) -> u32 {
        self.numeric(field, 4, |b| b.get_u32_le())
    }

    /// Little-endian IEEE 754.
    pub fn f32(&self, field: Field) -> f32 {
        self.numeric(field, 4, |b| b.get_f32_le())
    }

    /// 16-bit value whose signedness depends on the record format.
    pub fn u16_or_i16(&self, field: Field, unsigned: bool) -> i32 {
        if unsigned {
            i32::from(self.u16(field))
        } else {
            i32::from(self.i16(field))
        }
    }

    /// NUL-terminated Latin-1 text.
    pub fn string(&self, field: Field) -> String {
        let value = self.slice(field).map(latin1_until_nul).unwrap_or_default();
        debug!(label = field.label, %value, "unpacked");
        value
    }

    /// Raw field contents.
    pub fn bytes(&self, field: Field) -> Vec<u8> {
        self.slice(field).map(<[u8]>::to_vec).unwrap_or_default()
    }
}

/// Builds a fresh set of zero-filled pages.
pub struct PageWriter {
    pages: [[u8; PAGE_SIZE]; PAGE_COUNT],
    truncated: Vec<&'static str>,
}

impl PageWriter {
    /// Start from zeroed pages with `revisions[i]` stamped into the last byte of page `i`.
    pub fn new(revisions: [u8; PAGE_COUNT]) -> Self {
        let mut pages = [[0u8; PAGE_SIZE]; PAGE_COUNT];
        for (page, rev) in pages.iter_mut().zip(revisions) {
            page[REVISION_OFFSET] = rev;
        }
        Self {
            pages,
            truncated: Vec::new(),
        }
    }

    fn range(&mut self, field: Field) -> AppResult<&mut [u8]> {
        // the revision byte is never user data
        if field.page >= PAGE_COUNT || field.end() > REVISION_OFFSET {
            return Err(SpectroError::EncodeRange {
                page: field.page,
                offset: field.offset,
                len: field.len,
            });
        }
        Ok(&mut self.pages[field.page][field.offset..field.end()])
    }

    fn unsigned(field: Field, value: i64, max: u64) -> u64 {
        if value < 0 {
            warn!(
                label = field.label,
                value, "rounding negative to zero when writing to unsigned field"
            );
            return 0;
        }
        let value = value as u64;
        if value > max {
            warn!(label = field.label, value, max, "saturating oversized value");
            return max;
        }
        value
    }

    /// Single byte.
    pub fn put_u8(&mut self, field: Field, value: u8) -> AppResult<()> {
        self.range(field)?.put_u8(value);
        Ok(())
    }

    /// `1` or `0`.
    pub fn put_bool(&mut self, field: Field, value: bool) -> AppResult<()> {
        self.put_u8(field, u8::from(value))
    }

    /// Unsigned 16-bit write; negative input is clamped to zero.
    pub fn put_u16(&mut self, field: Field, value: i64) -> AppResult<()> {
        let value = Self::unsigned(field, value, u64::from(u16::MAX)) as u16;
        self.range(field)?.put_u16_le(value);
        Ok(())
    }

    /// Signed little-endian 16-bit write.
    pub fn put_i16(&mut self, field: Field, value: i16) -> AppResult<()> {
        self.range(field)?.put_i16_le(value);
        Ok(())
    }

    /// Unsigned 32-bit write; negative input is clamped to zero.
    pub fn put_u32(&mut self, field: Field, value: i64) -> AppResult<()> {
        let value = Self::unsigned(field, value, u64::from(u32::MAX)) as u32;
        self.range(field)?.put_u32_le(value);
        Ok(())
    }

    /// Little-endian IEEE 754.
    pub fn put_f32(&mut self, field: Field, value: f32) -> AppResult<()> {
        self.range(field)?.put_f32_le(value);
        Ok(())
    }

    /// Left-justified, zero-padded string. Chars outside Latin-1 become `?`.
    ///
    /// Overlong values are cut to the field width; the field label is
    /// remembered so the caller can see which fields lost data.
    pub fn put_string(&mut self, field: Field, value: &str) -> AppResult<()> {
        let encoded: Vec<u8> = value
            .chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect();
        if encoded.len() > field.len {
            warn!(
                label = field.label,
                len = encoded.len(),
                width = field.len,
                "truncating string field"
            );
            self.truncated.push(field.label);
        }
        let dst = self.range(field)?;
        let n = encoded.len().min(dst.len());
        dst[..n].copy_from_slice(&encoded[..n]);
        Ok(())
    }

    /// The pages and the labels of truncated string fields.
    pub fn finish(self) -> ([[u8; PAGE_SIZE]; PAGE_COUNT], Vec<&'static str>) {
        (self.pages, self.truncated)
    }
}
