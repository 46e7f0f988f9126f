//! Page-granular access to guest physical memory.

use std::ops::DerefMut;

use crate::error::{Error, Result};

/// Host-side view of guest physical memory, one page at a time.
///
/// A mapping is held only for as long as its page guard lives; dropping the
/// guard releases whatever host resource backs it.
pub trait GuestVspace {
    /// Guard for one mapped guest page. Derefs to exactly one page of bytes.
    type Page<'a>: DerefMut<Target = [u8]>
    where
        Self: 'a;

    /// Page size in bytes. Must be a power of two.
    fn page_size(&self) -> u64;

    /// Map the page starting at `page_addr` into the host.
    ///
    /// Fails with [`Error::UnbackedGuestPage`] when no frame backs it.
    fn map_page(&mut self, page_addr: u64) -> Result<Self::Page<'_>>;
}

/// One page-sized piece of a [`touch`] request.
#[derive(Debug)]
pub struct PageChunk<'a> {
    /// Guest physical address of the first byte of `data`
    pub paddr: u64,
    /// Host view of the chunk
    pub data: &'a mut [u8],
    /// Offset of `paddr` from the start of the request
    pub offset: usize,
}

/// Invoke `f` once per backing page spanned by `[addr, addr + len)`.
///
/// Each page is mapped right before `f` runs and unmapped right after,
/// including when `f` fails. The first failure aborts the walk.
pub fn touch<V, F>(vspace: &mut V, addr: u64, len: u64, mut f: F) -> Result<()>
where
    V: GuestVspace + ?Sized,
    F: FnMut(PageChunk<'_>) -> Result<()>,
{
    let page_size = vspace.page_size();
    let end = addr.checked_add(len).ok_or(Error::UnbackedGuestPage(addr))?;

    let mut cursor = addr;
    while cursor < end {
        let page_addr = cursor & !(page_size - 1);
        let in_page = (cursor - page_addr) as usize;
        let chunk_len = (page_size - in_page as u64).min(end - cursor) as usize;

        let mut page = vspace.map_page(page_addr)?;
        let data = page
            .get_mut(in_page..in_page + chunk_len)
            .ok_or(Error::UnbackedGuestPage(cursor))?;
        f(PageChunk { paddr: cursor, data, offset: (cursor - addr) as usize })?;

        cursor += chunk_len as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestRam;

    #[test]
    fn test_touch_splits_on_page_boundaries() {
        let mut ram = GuestRam::new(0x10000, 0x4000).unwrap();
        let mut chunks = Vec::new();
        touch(&mut ram, 0x10ff0, 0x1020, |chunk| {
            chunks.push((chunk.paddr, chunk.data.len(), chunk.offset));
            Ok(())
        })
        .unwrap();
        assert_eq!(chunks, vec![(0x10ff0, 0x10, 0), (0x11000, 0x1000, 0x10), (0x12000, 0x10, 0x1010)]);
    }

    #[test]
    fn test_touch_zero_length() {
        let mut ram = GuestRam::new(0, 0x1000).unwrap();
        let mut calls = 0;
        touch(&mut ram, 0x800, 0, |_| {
            calls += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_touch_releases_page_on_failure() {
        let mut ram = GuestRam::new(0, 0x3000).unwrap();
        let mut seen = 0;
        let err = touch(&mut ram, 0, 0x3000, |chunk| {
            seen += 1;
            if chunk.paddr == 0x1000 {
                return Err(Error::DeviceMapFailed("callback refused".into()));
            }
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::DeviceMapFailed(_)));
        assert_eq!(seen, 2);
        assert_eq!(ram.mapped_pages(), 0);
    }

    #[test]
    fn test_touch_unbacked_page() {
        let mut ram = GuestRam::new(0, 0x1000).unwrap();
        let err = touch(&mut ram, 0xff0, 0x20, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::UnbackedGuestPage(0x1000)));
        assert_eq!(ram.mapped_pages(), 0);
    }
}
