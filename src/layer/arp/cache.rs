//! The ARP translation cache.
//!
//! A fixed set of thirty-two entries mapping a protocol address to a
//! hardware address. Entries age only through eviction: allocating into a
//! full table reclaims the entry with the oldest timestamp.
use crate::time::Instant;
use crate::wire::{EthernetAddress, Ipv4Address};

pub(crate) const CACHE_SIZE: usize = 32;

/// The resolution state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Free,
    /// A request is out; the hardware address is not yet known.
    Incomplete,
    Resolved,
    /// Resolved by configuration, never learned from the wire.
    #[allow(dead_code)]
    Static,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub(crate) state: State,
    pub(crate) pa: Ipv4Address,
    pub(crate) ha: EthernetAddress,
    pub(crate) timestamp: Instant,
}

impl Entry {
    const EMPTY: Entry = Entry {
        state: State::Free,
        pa: Ipv4Address::UNSPECIFIED,
        ha: EthernetAddress([0; 6]),
        timestamp: Instant { millis: 0 },
    };

    fn clear(&mut self) {
        *self = Self::EMPTY;
    }
}

/// The cache table. Invariant: a non-FREE protocol address appears at most
/// once.
#[derive(Debug)]
pub(crate) struct Cache {
    entries: [Entry; CACHE_SIZE],
}

impl Cache {
    pub(crate) fn new() -> Self {
        Cache { entries: [Entry::EMPTY; CACHE_SIZE] }
    }

    /// Find the entry for a protocol address.
    pub(crate) fn select(&self, pa: Ipv4Address) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.state != State::Free && entry.pa == pa)
    }

    /// Take a free entry, evicting the oldest one if the table is full.
    pub(crate) fn alloc(&mut self) -> &mut Entry {
        let index = match self.entries.iter().position(|entry| entry.state == State::Free) {
            Some(index) => index,
            None => {
                let index = self
                    .entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, entry)| entry.timestamp)
                    .map(|(index, _)| index)
                    .unwrap();
                self.entries[index].clear();
                index
            }
        };
        &mut self.entries[index]
    }

    /// Refresh the entry for `pa` with a learned hardware address.
    ///
    /// Returns whether an entry existed; a successful update marks it
    /// resolved and moves its timestamp forward.
    pub(crate) fn update(&mut self, pa: Ipv4Address, ha: EthernetAddress, now: Instant) -> bool {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.state != State::Free && entry.pa == pa);
        match entry {
            Some(entry) => {
                entry.state = State::Resolved;
                entry.ha = ha;
                entry.timestamp = now;
                true
            }
            None => false,
        }
    }

    /// Insert a resolved mapping, evicting if necessary.
    pub(crate) fn insert(&mut self, pa: Ipv4Address, ha: EthernetAddress, now: Instant) {
        let entry = self.alloc();
        entry.state = State::Resolved;
        entry.pa = pa;
        entry.ha = ha;
        entry.timestamp = now;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PA_1: Ipv4Address = Ipv4Address([192, 0, 2, 1]);
    const PA_2: Ipv4Address = Ipv4Address([192, 0, 2, 2]);
    const HA_A: EthernetAddress = EthernetAddress([0, 0, 0, 0, 0, 1]);
    const HA_B: EthernetAddress = EthernetAddress([0, 0, 0, 0, 0, 2]);

    fn ts(millis: i64) -> Instant {
        Instant::from_millis(millis)
    }

    #[test]
    fn insert_and_select() {
        let mut cache = Cache::new();
        assert!(cache.select(PA_1).is_none());

        cache.insert(PA_1, HA_A, ts(0));
        let entry = cache.select(PA_1).unwrap();
        assert_eq!(entry.state, State::Resolved);
        assert_eq!(entry.ha, HA_A);
        assert!(cache.select(PA_2).is_none());
    }

    #[test]
    fn update_refreshes_in_place() {
        let mut cache = Cache::new();
        assert!(!cache.update(PA_1, HA_A, ts(0)));

        cache.insert(PA_1, HA_A, ts(0));
        assert!(cache.update(PA_1, HA_B, ts(5)));
        let entry = cache.select(PA_1).unwrap();
        assert_eq!(entry.ha, HA_B);
        assert_eq!(entry.timestamp, ts(5));

        cache.insert(PA_2, HA_A, ts(6));
        assert_eq!(cache.select(PA_1).unwrap().ha, HA_B);
    }

    #[test]
    fn full_table_evicts_oldest() {
        let mut cache = Cache::new();
        for i in 0..CACHE_SIZE {
            let pa = Ipv4Address([10, 0, 0, i as u8]);
            cache.insert(pa, HA_A, ts(100 + i as i64));
        }
        // Entry with timestamp 100 is the oldest.
        cache.insert(PA_1, HA_B, ts(1000));
        assert!(cache.select(Ipv4Address([10, 0, 0, 0])).is_none());
        assert_eq!(cache.select(PA_1).unwrap().ha, HA_B);
        assert!(cache.select(Ipv4Address([10, 0, 0, 1])).is_some());
    }

    #[test]
    fn incomplete_entries_count_for_eviction() {
        let mut cache = Cache::new();
        {
            let entry = cache.alloc();
            entry.state = State::Incomplete;
            entry.pa = PA_1;
            entry.timestamp = ts(50);
        }
        for i in 0..CACHE_SIZE - 1 {
            let pa = Ipv4Address([10, 0, 0, i as u8]);
            cache.insert(pa, HA_A, ts(100 + i as i64));
        }
        cache.insert(PA_2, HA_B, ts(1000));
        assert!(cache.select(PA_1).is_none());
    }
}
