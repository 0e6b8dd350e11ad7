//! Window-TinyLFU cache (<https://arxiv.org/pdf/1512.00727.pdf>).
//!
//! ```text
//!           Window Cache Victim .---------. Main Cache Victim
//!          .------------------->| TinyLFU |<-----------------.
//!          |                    `---------'                  |
//! .-------------------.              |    .------------------.
//! | Window Cache (1%) |              |    | Main Cache (99%) |
//! |      (LRU)        |              |    |      (SLRU)      |
//! `-------------------'              |    `------------------'
//!          ^                         |               ^
//!          |                         `---------------'
//!       new item                        Winner
//! ```
//!
//! New entries start in the small window LRU, which absorbs bursts of
//! one-off accesses. A page pushed out of the window is admitted into the
//! main SLRU only if the frequency sketch estimates it to be hotter than
//! the main cache's eviction candidate; on a tie the window victim loses,
//! as recency alone is not evidence of reuse. The sketch's periodic reset
//! keeps entries that stopped being accessed from lingering.
//!
//! Not thread-safe; the disk actor owns it and serializes all access.

use std::collections::HashMap;
use std::hash::Hash;

use super::lru::{LruList, PageStore, Segment, Slru};
use super::sketch::FrequencySketch;

pub struct WTinyLfu<K, V> {
    sketch: FrequencySketch,
    /// Maps keys to their page in `store`.
    page_map: HashMap<K, super::lru::PageId>,
    store: PageStore<K, V>,
    window: LruList,
    main: Slru,
}

impl<K: Hash + Eq + Clone, V> WTinyLfu<K, V> {
    /// Creates a cache holding at most `capacity` entries (at least 1).
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        let window = window_capacity(capacity);
        Self {
            sketch: FrequencySketch::new(capacity),
            page_map: HashMap::new(),
            store: PageStore::new(),
            window: LruList::new(window),
            main: Slru::new((capacity as usize) - window),
        }
    }

    pub fn size(&self) -> usize {
        self.window.len() + self.main.len()
    }

    pub fn capacity(&self) -> usize {
        self.window.capacity() + self.main.capacity()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.page_map.contains_key(key)
    }

    /// Looks up `key`, recording the access in the frequency sketch
    /// whether or not it hits.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.sketch.record_access(key);
        let id = *self.page_map.get(key)?;
        match self.store.get(id).segment {
            Segment::Window => self.window.handle_hit(&mut self.store, id),
            _ => self.main.handle_hit(&mut self.store, id),
        }
        Some(&self.store.get(id).value)
    }

    /// Inserts or replaces `key`. May evict the admission loser when the
    /// cache is at capacity.
    pub fn insert(&mut self, key: K, value: V) {
        if self.window.is_full() {
            self.evict();
        }
        match self.page_map.get(&key).copied() {
            Some(id) => self.store.get_mut(id).value = value,
            None => {
                let id = self.store.alloc(key.clone(), Segment::Window, value);
                self.window.push_front(&mut self.store, id);
                self.page_map.insert(key, id);
            }
        }
    }

    pub fn erase(&mut self, key: &K) {
        if let Some(id) = self.page_map.remove(key) {
            match self.store.get(id).segment {
                Segment::Window => self.window.unlink(&mut self.store, id),
                _ => self.main.unlink(&mut self.store, id),
            }
            self.store.release(id);
        }
    }

    /// Resizes the cache, evicting down to the new capacity. The frequency
    /// sketch is rebuilt, so admission quality suffers until enough new
    /// history accumulates.
    pub fn change_capacity(&mut self, capacity: u32) {
        let capacity = capacity.max(1);
        self.sketch.change_capacity(capacity);
        let window = window_capacity(capacity);
        self.window.set_capacity(window);
        self.main.set_capacity((capacity as usize) - window);
        while self.window.len() > self.window.capacity() {
            self.evict_from(true);
        }
        while self.main.len() > self.main.capacity() {
            self.evict_from(false);
        }
    }

    /// Makes room in the window: transfers its victim into the main
    /// cache's probationary segment, or, if the cache as a whole is full,
    /// evicts whichever of the two victims the sketch ranks colder.
    fn evict(&mut self) {
        let Some(window_victim) = self.window.victim() else {
            return;
        };
        if self.size() >= self.capacity() {
            let window_freq = self.sketch.get_frequency(&self.store.get(window_victim).key);
            let main_freq = self
                .main
                .victim()
                .map(|id| self.sketch.get_frequency(&self.store.get(id).key));
            match main_freq {
                // The window victim is demonstrably hotter: it displaces
                // the main victim. Ties go to the main cache.
                Some(freq) if window_freq > freq => {
                    self.evict_from(false);
                    self.main
                        .transfer_page_from(&mut self.store, window_victim, &mut self.window);
                }
                Some(_) => self.evict_from(true),
                None => self.evict_from(true),
            }
        } else {
            self.main
                .transfer_page_from(&mut self.store, window_victim, &mut self.window);
        }
    }

    fn evict_from(&mut self, window: bool) {
        let victim = if window {
            self.window.victim()
        } else {
            self.main.victim()
        };
        if let Some(id) = victim {
            if window {
                self.window.unlink(&mut self.store, id);
            } else {
                self.main.unlink(&mut self.store, id);
            }
            let page = self.store.release(id);
            self.page_map.remove(&page.key);
        }
    }
}

/// The window gets 1% of the total capacity, at least one page.
fn window_capacity(total: u32) -> usize {
    (((total as f64) * 0.01).ceil() as usize).max(1)
}
