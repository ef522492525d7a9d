// A reference counted arena
//
// Bound images are handed out to the window manager as small copyable
// handles. Each slot carries a generation so a handle that outlived its
// image is caught instead of silently hitting whatever took its slot.
//
// Austin Shafer - 2024

/// A handle to an entry in an `Arena`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    h_index: u32,
    h_generation: u32,
}

impl Handle {
    pub fn index(&self) -> usize {
        self.h_index as usize
    }
}

struct Slot<T> {
    s_generation: u32,
    /// (refcount, value). None if this slot is free.
    s_entry: Option<(u32, T)>,
}

/// What happened on a release
#[derive(Debug, PartialEq)]
pub enum Release<T> {
    /// The handle does not refer to a live entry
    Stale,
    /// Other references remain, this many of them
    Remaining(u32),
    /// That was the last reference. The value is handed back so the
    /// caller controls when it is destroyed.
    Destroyed(T),
}

/// A handle-indexed, reference counted container
///
/// Entries start with a count of one. `acquire` adds a reference and
/// `release` drops one, returning the value once nothing refers to it.
pub struct Arena<T> {
    a_slots: Vec<Slot<T>>,
    /// Indices of free slots, reused before growing
    a_free: Vec<u32>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            a_slots: Vec::new(),
            a_free: Vec::new(),
        }
    }

    /// Add a value with a reference count of one
    pub fn insert(&mut self, val: T) -> Handle {
        match self.a_free.pop() {
            Some(index) => {
                let slot = &mut self.a_slots[index as usize];
                slot.s_entry = Some((1, val));
                Handle {
                    h_index: index,
                    h_generation: slot.s_generation,
                }
            }
            None => {
                self.a_slots.push(Slot {
                    s_generation: 0,
                    s_entry: Some((1, val)),
                });
                Handle {
                    h_index: (self.a_slots.len() - 1) as u32,
                    h_generation: 0,
                }
            }
        }
    }

    fn slot(&self, handle: Handle) -> Option<&Slot<T>> {
        self.a_slots
            .get(handle.index())
            .filter(|s| s.s_generation == handle.h_generation)
    }

    fn slot_mut(&mut self, handle: Handle) -> Option<&mut Slot<T>> {
        self.a_slots
            .get_mut(handle.index())
            .filter(|s| s.s_generation == handle.h_generation)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slot(handle)
            .and_then(|s| s.s_entry.as_ref())
            .map(|(_, v)| v)
    }

    /// Add a reference to `handle`
    ///
    /// Returns the new count, or None if the handle is stale.
    pub fn acquire(&mut self, handle: Handle) -> Option<u32> {
        let (count, _) = self.slot_mut(handle)?.s_entry.as_mut()?;
        *count += 1;
        Some(*count)
    }

    /// Drop a reference to `handle`
    pub fn release(&mut self, handle: Handle) -> Release<T> {
        let slot = match self.slot_mut(handle) {
            Some(s) => s,
            None => return Release::Stale,
        };

        match slot.s_entry.as_mut() {
            None => return Release::Stale,
            Some((count, _)) if *count > 1 => {
                *count -= 1;
                return Release::Remaining(*count);
            }
            Some(_) => {}
        }

        // last reference, free the slot and invalidate old handles
        let val = match slot.s_entry.take() {
            Some((_, v)) => v,
            None => return Release::Stale,
        };
        slot.s_generation = slot.s_generation.wrapping_add(1);
        self.a_free.push(handle.h_index);

        Release::Destroyed(val)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.a_slots.len() - self.a_free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry regardless of its count
    ///
    /// Used at teardown. Entries are returned in slot order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut ret = Vec::new();

        for (i, slot) in self.a_slots.iter_mut().enumerate() {
            if let Some((_, v)) = slot.s_entry.take() {
                slot.s_generation = slot.s_generation.wrapping_add(1);
                self.a_free.push(i as u32);
                ret.push(v);
            }
        }

        ret
    }
}
