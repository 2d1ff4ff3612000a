//! Open-addressed robinhood hash table with u64 keys and values.
//!
//! This is the second stage of the minimizer index: one table per
//! bucket, keyed by the hash bits above the bucket selector. Displaced
//! slots are swapped on insert so probe distances stay short, and a
//! `Moved` marker keeps lookups correct while a grow is rehashing in
//! place.
//!
//! In memory a cell is an explicit [`Slot`] variant; the serialized form
//! uses the key sentinels `!0` (empty) and `!0 - 1` (moved) so a dumped
//! table reloads bit-exactly.

use std::io::{Read, Write};

use crate::error::LramError;

const INIT_SIZE: usize = 256;
const THRESH: f64 = 0.4;

const KEY_EMPTY: u64 = u64::MAX;
const KEY_MOVED: u64 = u64::MAX - 1;
pub(crate) const VAL_INIT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Empty,
    Moved,
    Occupied { key: u64, val: u64 },
}

impl Slot {
    #[inline]
    fn is_vacant(&self) -> bool {
        matches!(self, Slot::Empty | Slot::Moved)
    }

    fn to_pair(self) -> (u64, u64) {
        match self {
            Slot::Empty => (KEY_EMPTY, VAL_INIT),
            Slot::Moved => (KEY_MOVED, VAL_INIT),
            Slot::Occupied { key, val } => (key, val),
        }
    }

    fn from_pair(key: u64, val: u64) -> Self {
        match key {
            KEY_EMPTY => Slot::Empty,
            KEY_MOVED => Slot::Moved,
            _ => Slot::Occupied { key, val },
        }
    }
}

/// u64 -> u64 robinhood map. Keys above `u64::MAX - 2` are reserved.
#[derive(Debug, Clone, Default)]
pub(crate) struct RhMap {
    slots: Vec<Slot>,
    mask: u64,
    cnt: u32,
    ub: u32,
}

impl RhMap {
    /// Table sized so that `n` keys keep occupancy at or under the load
    /// threshold.
    pub fn with_keys(n: usize) -> Self {
        let want = ((n as f64) / THRESH).ceil() as usize;
        let size = want.next_power_of_two().max(INIT_SIZE);
        Self {
            slots: vec![Slot::Empty; size],
            mask: size as u64 - 1,
            cnt: 0,
            ub: (size as f64 * THRESH) as u32,
        }
    }

    pub fn new() -> Self {
        Self::with_keys(1)
    }

    pub fn is_unallocated(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cnt as usize
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Find or claim the slot for `key`, robinhood-displacing richer
    /// entries along the way. Returns (index, inserted).
    fn allocate(slots: &mut [Slot], mask: u64, key: u64, val: u64) -> (usize, bool) {
        // walk until a vacant slot or one whose key is closer to home
        let poll = |slots: &[Slot], mut i: usize, mut dist: i64| -> (usize, Option<(u64, u64)>) {
            loop {
                match slots[i] {
                    Slot::Empty | Slot::Moved => return (i, None),
                    Slot::Occupied { key: k1, val: v1 } => {
                        if dist <= (k1 & mask) as i64 {
                            return (i, Some((k1, v1)));
                        }
                    }
                }
                if i == mask as usize {
                    dist -= mask as i64 + 1;
                }
                i = (i + 1) & mask as usize;
            }
        };

        let home = (key & mask) as usize;
        let (first, found) = poll(slots, home, home as i64);
        if let Some((k1, _)) = found {
            if k1 == key {
                return (first, false); // duplicated key
            }
        }

        // claim the slot, then push the displaced chain until it lands
        let (mut k0, mut v0) = (key, val);
        let mut i = first;
        let mut displaced = found;
        slots[i] = Slot::Occupied { key: k0, val: v0 };
        while let Some((k1, v1)) = displaced {
            // the previous occupant moves one step on
            if let Slot::Occupied { key: _, val } = &mut slots[i] {
                *val = v0;
            }
            k0 = k1;
            v0 = v1;
            i = (i + 1) & mask as usize;
            let (j, next) = poll(slots, i, (k0 & mask) as i64);
            i = j;
            displaced = next;
            slots[i] = Slot::Occupied { key: k0, val: v0 };
        }
        if let Slot::Occupied { key: _, val } = &mut slots[i] {
            *val = v0;
        }
        (first, true)
    }

    fn extend(&mut self) {
        let prev_size = self.slots.len();
        let size = 2 * prev_size;
        let mask = size as u64 - 1;
        self.mask = mask;
        self.ub = (size as f64 * THRESH) as u32;
        self.slots.resize(size, Slot::Empty);

        // rehash out-of-home entries, marking vacated slots Moved so
        // concurrent probes during this pass keep walking
        for i in 0..size {
            let Slot::Occupied { key, val } = self.slots[i] else {
                continue;
            };
            if (key & mask) as usize == i {
                continue;
            }
            self.slots[i] = Slot::Moved;
            Self::allocate(&mut self.slots, mask, key, val);
        }
    }

    /// Insert or overwrite.
    pub fn put(&mut self, key: u64, val: u64) {
        if self.slots.is_empty() {
            *self = Self::new();
        }
        if self.cnt >= self.ub {
            self.extend();
        }
        let (idx, inserted) = Self::allocate(&mut self.slots, self.mask, key, val);
        self.cnt += inserted as u32;
        self.slots[idx] = Slot::Occupied { key, val };
    }

    /// Claim the value slot for `key`, initializing it to [`VAL_INIT`]
    /// when the key is new, and return a mutable reference to it.
    pub fn entry_val(&mut self, key: u64) -> &mut u64 {
        if self.slots.is_empty() {
            *self = Self::new();
        }
        if self.cnt >= self.ub {
            self.extend();
        }
        let (idx, inserted) = Self::allocate(&mut self.slots, self.mask, key, VAL_INIT);
        self.cnt += inserted as u32;
        if inserted {
            self.slots[idx] = Slot::Occupied { key, val: VAL_INIT };
        }
        match &mut self.slots[idx] {
            Slot::Occupied { val, .. } => val,
            _ => unreachable!("allocate returned a vacant slot"),
        }
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        self.get_ref(key).copied()
    }

    /// Like [`Self::get`] but borrows the stored value.
    pub fn get_ref(&self, key: u64) -> Option<&u64> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.mask as usize;
        let mut pos = key as usize & mask;
        loop {
            match &self.slots[pos] {
                Slot::Occupied { key: k, val } if *k == key => return Some(val),
                Slot::Empty => return None,
                _ => {}
            }
            pos = (pos + 1) & mask;
        }
    }

    /// Reset to the initial table size, keeping nothing.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.slots.resize(INIT_SIZE, Slot::Empty);
        self.mask = INIT_SIZE as u64 - 1;
        self.cnt = 0;
        self.ub = (INIT_SIZE as f64 * THRESH) as u32;
    }

    /// Serialize as `(size, cnt)` then raw `(key, val)` pairs with the
    /// sentinel-key convention. A zero size marks an unallocated table.
    pub fn dump<W: Write>(&self, w: &mut W) -> crate::Result<()> {
        if self.slots.is_empty() {
            w.write_all(&0u32.to_le_bytes())?;
            w.write_all(&0u32.to_le_bytes())?;
            return Ok(());
        }
        w.write_all(&(self.slots.len() as u32).to_le_bytes())?;
        w.write_all(&self.cnt.to_le_bytes())?;
        for slot in &self.slots {
            let (k, v) = slot.to_pair();
            w.write_all(&k.to_le_bytes())?;
            w.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> crate::Result<Self> {
        let size = read_u32(r)? as usize;
        let cnt = read_u32(r)?;
        if size == 0 {
            return Ok(Self::default());
        }
        if !size.is_power_of_two() {
            return Err(LramError::Truncated(format!(
                "hash table size {size} is not a power of two"
            )));
        }
        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            let k = read_u64(r)?;
            let v = read_u64(r)?;
            slots.push(Slot::from_pair(k, v));
        }
        Ok(Self {
            slots,
            mask: size as u64 - 1,
            cnt,
            ub: (size as f64 * THRESH) as u32,
        })
    }

    /// For every occupied slot, its unwrapped home index is at or before
    /// the slot itself. Test support.
    #[cfg(test)]
    pub fn check_home_invariant(&self) -> bool {
        let size = self.slots.len();
        for i in 0..size {
            let Slot::Occupied { key, .. } = self.slots[i] else {
                continue;
            };
            let home = (key & self.mask) as usize;
            // walking back from i to home must not cross an Empty slot
            let mut j = i;
            while j != home {
                j = (j + size - 1) % size;
                if matches!(self.slots[j], Slot::Empty) {
                    return false;
                }
            }
        }
        true
    }
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> crate::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|e| LramError::Truncated(e.to_string()))?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64<R: Read>(r: &mut R) -> crate::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|e| LramError::Truncated(e.to_string()))?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mix(x: u64) -> u64 {
        let h = x.wrapping_mul(0x2545_F491_4F6C_DD1D);
        h ^ (h >> 29)
    }

    #[test]
    fn test_put_get() {
        let mut h = RhMap::new();
        for i in 0..1000u64 {
            h.put(mix(i), i);
        }
        for i in 0..1000u64 {
            assert_eq!(h.get(mix(i)), Some(i), "key {i}");
        }
        assert_eq!(h.get(mix(5000)), None);
        assert_eq!(h.len(), 1000);
    }

    #[test]
    fn test_put_overwrites() {
        let mut h = RhMap::new();
        h.put(42, 1);
        h.put(42, 2);
        assert_eq!(h.get(42), Some(2));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_entry_val() {
        let mut h = RhMap::new();
        {
            let v = h.entry_val(7);
            assert_eq!(*v, VAL_INIT);
            *v = 99;
        }
        assert_eq!(h.get(7), Some(99));
        assert_eq!(*h.entry_val(7), 99);
    }

    #[test]
    fn test_grow_keeps_entries() {
        // force several grows past the 0.4 load bound
        let mut h = RhMap::with_keys(4);
        for i in 0..5000u64 {
            h.put(mix(i), i);
        }
        for i in 0..5000u64 {
            assert_eq!(h.get(mix(i)), Some(i));
        }
    }

    #[test]
    fn test_home_invariant_after_puts() {
        let mut h = RhMap::new();
        for i in 0..3000u64 {
            h.put(mix(i), i);
            if i % 701 == 0 {
                assert!(h.check_home_invariant(), "after {i} puts");
            }
        }
        assert!(h.check_home_invariant());
    }

    #[test]
    fn test_dump_load_roundtrip() {
        let mut h = RhMap::new();
        for i in 0..500u64 {
            h.put(mix(i), i * 3);
        }
        let mut buf = Vec::new();
        h.dump(&mut buf).unwrap();
        let g = RhMap::load(&mut buf.as_slice()).unwrap();
        assert_eq!(g.len(), h.len());
        assert_eq!(g.size(), h.size());
        for i in 0..500u64 {
            assert_eq!(g.get(mix(i)), Some(i * 3));
        }
    }

    #[test]
    fn test_dump_load_empty() {
        let h = RhMap::default();
        let mut buf = Vec::new();
        h.dump(&mut buf).unwrap();
        let g = RhMap::load(&mut buf.as_slice()).unwrap();
        assert!(g.is_unallocated());
        assert_eq!(g.get(1), None);
    }
}
