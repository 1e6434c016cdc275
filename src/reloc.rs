use anyhow::{bail, Result};

/// Delta byte that continues into the next entry without naming a fix-up.
pub const DELTA_CONT: u8 = 254;
/// Delta byte that terminates an encoded list.
pub const DELTA_END: u8 = 255;

#[derive(Debug, Clone, Copy)]
struct Entry {
    tag: u8,
    delta: u8,
}

/// In-order, delta-compressed list of fix-up addresses for one segment.
///
/// Each real entry pairs the tag of the value being fixed up (1..=3 for the
/// image segments, >= 5 for externals) with a single-byte delta from the
/// previous fix-up. A gap of 254 or more is bridged by `DELTA_CONT`
/// entries. Insertion is append-only and addresses must never decrease.
#[derive(Debug, Default)]
pub struct RelocList {
    entries: Vec<Entry>,
    last: u16,
    count: usize,
}

impl RelocList {
    pub fn new() -> Self {
        RelocList::default()
    }

    /// Append a fix-up. Fails on any address below the current tail.
    pub fn push(&mut self, tag: u8, addr: u16) -> Result<()> {
        if addr < self.last {
            bail!("backwards reloc");
        }
        let mut diff = addr - self.last;
        while diff >= u16::from(DELTA_CONT) {
            self.entries.push(Entry {
                tag: 0,
                delta: DELTA_CONT,
            });
            diff -= u16::from(DELTA_CONT);
        }
        self.entries.push(Entry {
            tag,
            delta: diff as u8,
        });
        self.last = addr;
        self.count += 1;
        Ok(())
    }

    /// Number of real fix-ups (continuation entries excluded).
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Walk the list in insertion order, decoding deltas back into
    /// absolute addresses.
    pub fn iter(&self) -> impl Iterator<Item = (u8, u16)> + '_ {
        let mut addr = 0u16;
        self.entries.iter().filter_map(move |e| {
            addr = addr.wrapping_add(u16::from(e.delta));
            if e.delta == DELTA_CONT {
                None
            } else {
                Some((e.tag, addr))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_in_order() {
        let mut list = RelocList::new();
        list.push(1, 17).unwrap();
        list.push(1, 20).unwrap();
        list.push(2, 300).unwrap();
        list.push(5, 300).unwrap();
        let got: Vec<_> = list.iter().collect();
        assert_eq!(got, vec![(1, 17), (1, 20), (2, 300), (5, 300)]);
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn wide_gap_uses_continuations() {
        let mut list = RelocList::new();
        list.push(1, 0).unwrap();
        list.push(1, 600).unwrap();
        // 600 = 254 + 254 + 92: two continuation entries then the real one
        assert_eq!(list.entries.len(), 4);
        assert_eq!(list.entries[1].delta, DELTA_CONT);
        assert_eq!(list.entries[2].delta, DELTA_CONT);
        assert_eq!(list.entries[3].delta, 92);
        let got: Vec<_> = list.iter().collect();
        assert_eq!(got, vec![(1, 0), (1, 600)]);
    }

    #[test]
    fn exact_continuation_boundary() {
        let mut list = RelocList::new();
        list.push(3, 254).unwrap();
        let got: Vec<_> = list.iter().collect();
        assert_eq!(got, vec![(3, 254)]);
    }

    #[test]
    fn backwards_insert_is_fatal() {
        let mut list = RelocList::new();
        list.push(1, 100).unwrap();
        assert!(list.push(1, 99).is_err());
    }
}
