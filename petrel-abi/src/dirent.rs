//! Readdir / readdirplus trailer encoding.
//!
//! Directory pages are serialized into a readdir shared-buffer slice and
//! handed to the kernel as the downcall trailer. The layout is fixed ABI:
//!
//! ```text
//! +-----------+---------------------+----------+------+
//! | token u64 | directory_version u64 | count u32 | pad4 |
//! +-----------+---------------------+----------+------+
//! then per entry (each entry starts 8-aligned):
//! +-------------+------------+----------+------------------+
//! | name_len u32 | name bytes | pad to 8 | khandle 16 bytes |
//! +-------------+------------+----------+------------------+
//! ```
//!
//! Readdirplus appends `count` i32 error codes (plus 4 pad bytes when the
//! count is odd, keeping the next section 8-aligned), then `count` fixed
//! attribute blocks, each followed by a link-target string (same encoding
//! as names) when the attribute describes a symlink and the mask selects
//! link targets.

use alloc::string::String;
use alloc::vec::Vec;

use zerocopy::{FromBytes, IntoBytes};

use crate::{attrmask, Khandle, WireAttr, MAX_DIRENTS, NAME_MAX};

/// Byte size of the page header (count is padded to the 8-byte boundary).
pub const PAGE_HEADER_SIZE: usize = 24;

/// One decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub handle: u64,
}

/// One page of directory entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReaddirPage {
    pub token: u64,
    pub directory_version: u64,
    pub entries: Vec<DirEntry>,
}

/// Per-entry readdirplus extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlusEntry {
    pub error: i32,
    pub attr: WireAttr,
    pub link_target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// Destination buffer too small for the serialized page.
    Overflow,
    /// More than [`MAX_DIRENTS`] entries.
    TooManyEntries,
    /// An entry name exceeds [`NAME_MAX`] bytes.
    NameTooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    InvalidValue,
    InvalidUtf8,
}

fn pad8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

fn put_string(out: &mut [u8], pos: usize, s: &str) -> Result<usize, EncodeError> {
    let len = s.len();
    if len > NAME_MAX {
        return Err(EncodeError::NameTooLong);
    }
    let total = pad8(4 + len);
    if pos + total > out.len() {
        return Err(EncodeError::Overflow);
    }
    out[pos..pos + 4].copy_from_slice(&(len as u32).to_le_bytes());
    out[pos + 4..pos + 4 + len].copy_from_slice(s.as_bytes());
    out[pos + 4 + len..pos + total].fill(0);
    Ok(pos + total)
}

fn take_string(buf: &[u8], pos: usize) -> Result<(String, usize), DecodeError> {
    if pos + 4 > buf.len() {
        return Err(DecodeError::Truncated);
    }
    let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
    if len > NAME_MAX {
        return Err(DecodeError::InvalidValue);
    }
    let total = pad8(4 + len);
    if pos + total > buf.len() {
        return Err(DecodeError::Truncated);
    }
    let s = core::str::from_utf8(&buf[pos + 4..pos + 4 + len])
        .map_err(|_| DecodeError::InvalidUtf8)?;
    Ok((String::from(s), pos + total))
}

/// Serialize a directory page. Returns the number of bytes written.
pub fn encode_dirents(page: &ReaddirPage, out: &mut [u8]) -> Result<usize, EncodeError> {
    if page.entries.len() > MAX_DIRENTS {
        return Err(EncodeError::TooManyEntries);
    }
    if out.len() < PAGE_HEADER_SIZE {
        return Err(EncodeError::Overflow);
    }
    out[0..8].copy_from_slice(&page.token.to_le_bytes());
    out[8..16].copy_from_slice(&page.directory_version.to_le_bytes());
    out[16..20].copy_from_slice(&(page.entries.len() as u32).to_le_bytes());
    out[20..24].fill(0);

    let mut pos = PAGE_HEADER_SIZE;
    for entry in &page.entries {
        pos = put_string(out, pos, &entry.name)?;
        if pos + 16 > out.len() {
            return Err(EncodeError::Overflow);
        }
        let khandle = Khandle::from_handle(entry.handle);
        out[pos..pos + 16].copy_from_slice(khandle.as_bytes());
        pos += 16;
    }
    Ok(pos)
}

/// Decode a directory page. Returns the page and the offset one past it.
pub fn decode_dirents(buf: &[u8]) -> Result<(ReaddirPage, usize), DecodeError> {
    if buf.len() < PAGE_HEADER_SIZE {
        return Err(DecodeError::Truncated);
    }
    let token = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let directory_version = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let count = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;
    if count > MAX_DIRENTS {
        return Err(DecodeError::InvalidValue);
    }

    let mut entries = Vec::with_capacity(count);
    let mut pos = PAGE_HEADER_SIZE;
    for _ in 0..count {
        let (name, next) = take_string(buf, pos)?;
        pos = next;
        if pos + 16 > buf.len() {
            return Err(DecodeError::Truncated);
        }
        let khandle = Khandle::read_from_bytes(&buf[pos..pos + 16])
            .map_err(|_| DecodeError::Truncated)?;
        pos += 16;
        entries.push(DirEntry {
            name,
            handle: khandle.to_handle(),
        });
    }
    Ok((
        ReaddirPage {
            token,
            directory_version,
            entries,
        },
        pos,
    ))
}

/// Serialize a readdirplus page: the dirent page followed by per-entry
/// error codes and attributes. `plus` must have one element per entry.
pub fn encode_readdirplus(
    page: &ReaddirPage,
    plus: &[PlusEntry],
    out: &mut [u8],
) -> Result<usize, EncodeError> {
    debug_assert_eq!(page.entries.len(), plus.len());
    let mut pos = encode_dirents(page, out)?;

    let err_bytes = plus.len() * 4;
    let err_total = pad8(err_bytes);
    if pos + err_total > out.len() {
        return Err(EncodeError::Overflow);
    }
    for entry in plus {
        out[pos..pos + 4].copy_from_slice(&entry.error.to_le_bytes());
        pos += 4;
    }
    out[pos..pos + (err_total - err_bytes)].fill(0);
    pos += err_total - err_bytes;

    for entry in plus {
        let attr_bytes = entry.attr.as_bytes();
        if pos + attr_bytes.len() > out.len() {
            return Err(EncodeError::Overflow);
        }
        out[pos..pos + attr_bytes.len()].copy_from_slice(attr_bytes);
        pos += attr_bytes.len();
        if entry.attr.is_symlink() && entry.attr.mask & attrmask::LNK_TARGET != 0 {
            let target = entry.link_target.as_deref().unwrap_or("");
            pos = put_string(out, pos, target)?;
        }
    }
    Ok(pos)
}

/// Decode a readdirplus page.
pub fn decode_readdirplus(buf: &[u8]) -> Result<(ReaddirPage, Vec<PlusEntry>), DecodeError> {
    let (page, mut pos) = decode_dirents(buf)?;
    let count = page.entries.len();

    let err_total = pad8(count * 4);
    if pos + err_total > buf.len() {
        return Err(DecodeError::Truncated);
    }
    let mut errors = Vec::with_capacity(count);
    for i in 0..count {
        let off = pos + i * 4;
        errors.push(i32::from_le_bytes(buf[off..off + 4].try_into().unwrap()));
    }
    pos += err_total;

    let attr_size = core::mem::size_of::<WireAttr>();
    let mut plus = Vec::with_capacity(count);
    for error in errors {
        if pos + attr_size > buf.len() {
            return Err(DecodeError::Truncated);
        }
        let attr = WireAttr::read_from_bytes(&buf[pos..pos + attr_size])
            .map_err(|_| DecodeError::Truncated)?;
        pos += attr_size;
        let link_target = if attr.is_symlink() && attr.mask & attrmask::LNK_TARGET != 0 {
            let (target, next) = take_string(buf, pos)?;
            pos = next;
            Some(target)
        } else {
            None
        };
        plus.push(PlusEntry {
            error,
            attr,
            link_target,
        });
    }
    Ok((page, plus))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objtype;
    use alloc::format;
    use alloc::string::ToString;
    use alloc::vec;

    fn page(names: &[(&str, u64)]) -> ReaddirPage {
        ReaddirPage {
            token: 99,
            directory_version: 7,
            entries: names
                .iter()
                .map(|(name, handle)| DirEntry {
                    name: name.to_string(),
                    handle: *handle,
                })
                .collect(),
        }
    }

    #[test]
    fn empty_page_round_trips() {
        let page = ReaddirPage {
            token: 1,
            directory_version: 2,
            entries: Vec::new(),
        };
        let mut buf = [0u8; 64];
        let len = encode_dirents(&page, &mut buf).unwrap();
        assert_eq!(len, PAGE_HEADER_SIZE);
        let (decoded, consumed) = decode_dirents(&buf[..len]).unwrap();
        assert_eq!(decoded, page);
        assert_eq!(consumed, len);
    }

    #[test]
    fn dirents_round_trip() {
        let page = page(&[("a", 1), ("file.txt", 0xdead_beef_cafe), ("zzzzzzz", 3)]);
        let mut buf = [0u8; 4096];
        let len = encode_dirents(&page, &mut buf).unwrap();
        let (decoded, _) = decode_dirents(&buf[..len]).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn entries_start_eight_aligned() {
        // A 1-byte name consumes 4 + 1 -> padded to 8, so the khandle of the
        // first entry sits at header + 8.
        let page = page(&[("a", 0x1122_3344_5566_7788)]);
        let mut buf = [0u8; 256];
        encode_dirents(&page, &mut buf).unwrap();
        let khandle_off = PAGE_HEADER_SIZE + 8;
        assert_eq!(
            &buf[khandle_off..khandle_off + 4],
            &0x5566_7788u32.to_le_bytes()
        );
        // middle of the khandle stays zero
        assert_eq!(&buf[khandle_off + 4..khandle_off + 12], &[0u8; 8]);
        assert_eq!(
            &buf[khandle_off + 12..khandle_off + 16],
            &0x1122_3344u32.to_le_bytes()
        );
    }

    #[test]
    fn many_entries_round_trip() {
        let names: Vec<(String, u64)> = (0..MAX_DIRENTS)
            .map(|i| (format!("entry-{i}"), i as u64 + 1))
            .collect();
        let page = ReaddirPage {
            token: 0,
            directory_version: 0,
            entries: names
                .iter()
                .map(|(n, h)| DirEntry {
                    name: n.clone(),
                    handle: *h,
                })
                .collect(),
        };
        let mut buf = vec![0u8; 32 * MAX_DIRENTS + PAGE_HEADER_SIZE];
        let len = encode_dirents(&page, &mut buf).unwrap();
        let (decoded, _) = decode_dirents(&buf[..len]).unwrap();
        assert_eq!(decoded.entries.len(), MAX_DIRENTS);
        assert_eq!(decoded, page);
    }

    #[test]
    fn overflow_reported_not_panicked() {
        let page = page(&[("some-name", 1)]);
        let mut buf = [0u8; PAGE_HEADER_SIZE + 4];
        assert_eq!(encode_dirents(&page, &mut buf), Err(EncodeError::Overflow));
    }

    #[test]
    fn readdirplus_round_trip_with_symlink_target() {
        let page = page(&[("lib", 10), ("link", 11), ("x", 12)]);
        let mut link_attr = WireAttr::ZERO;
        link_attr.objtype = objtype::SYMLINK;
        link_attr.mask = attrmask::COMMON | attrmask::LNK_TARGET;
        let plus = vec![
            PlusEntry {
                error: 0,
                attr: WireAttr::ZERO,
                link_target: None,
            },
            PlusEntry {
                error: 0,
                attr: link_attr,
                link_target: Some("../target/path".to_string()),
            },
            PlusEntry {
                error: crate::err::ENOENT,
                attr: WireAttr::ZERO,
                link_target: None,
            },
        ];
        let mut buf = [0u8; 4096];
        let len = encode_readdirplus(&page, &plus, &mut buf).unwrap();
        let (dpage, dplus) = decode_readdirplus(&buf[..len]).unwrap();
        assert_eq!(dpage, page);
        assert_eq!(dplus, plus);
    }

    #[test]
    fn readdirplus_pads_odd_error_count() {
        // One entry: 4 error bytes pad to 8 so attrs start 8-aligned.
        let page = page(&[("f", 1)]);
        let plus = vec![PlusEntry {
            error: 0,
            attr: WireAttr::ZERO,
            link_target: None,
        }];
        let mut buf = [0u8; 1024];
        let len = encode_readdirplus(&page, &plus, &mut buf).unwrap();
        let dirent_len = encode_dirents(&page, &mut [0u8; 1024]).unwrap();
        assert_eq!(len, dirent_len + 8 + core::mem::size_of::<WireAttr>());
        let (_, dplus) = decode_readdirplus(&buf[..len]).unwrap();
        assert_eq!(dplus, plus);
    }
}
