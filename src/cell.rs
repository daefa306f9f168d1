use crossbeam_epoch::Shared;

// Slot states ride in the unused alignment bits of the cell pointer. A plain
// null is Empty; null tagged DEAD is the terminal migrated state; a live
// pointer carries TOMB or PRIME when the entry is deleted or mid-migration.
pub(crate) const TAG_TOMB: usize = 0b001;
pub(crate) const TAG_PRIME: usize = 0b010;
pub(crate) const TAG_DEAD: usize = 0b100;

/// A published entry. Immutable: every state change substitutes the slot's
/// atomic word, never a field of the cell.
// align(8) guarantees the three tag bits even for byte-sized key/value types.
#[repr(align(8))]
#[derive(Debug)]
pub(crate) struct Cell<K, V> {
    pub key: K,
    pub value: V,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum CellState {
    Empty,
    Live,
    Tombstone,
    Prime,
    Dead,
}

pub(crate) fn state_of<K, V>(cell: Shared<'_, Cell<K, V>>) -> CellState {
    let tag = cell.tag();
    if cell.is_null() {
        if tag & TAG_DEAD != 0 {
            CellState::Dead
        } else {
            CellState::Empty
        }
    } else if tag & TAG_PRIME != 0 {
        CellState::Prime
    } else if tag & TAG_TOMB != 0 {
        CellState::Tombstone
    } else {
        CellState::Live
    }
}

/// The terminal per-table state; carries no allocation.
pub(crate) fn dead<'g, K, V>() -> Shared<'g, Cell<K, V>> {
    Shared::null().with_tag(TAG_DEAD)
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_epoch::{self as epoch, Atomic, Owned};

    #[test]
    fn test_state_decoding() {
        let guard = unsafe { epoch::unprotected() };

        let empty: Shared<'_, Cell<u32, u32>> = Shared::null();
        assert_eq!(state_of(empty), CellState::Empty);
        assert_eq!(state_of(dead::<u32, u32>()), CellState::Dead);

        let slot = Atomic::new(Cell { key: 1_u32, value: 2_u32 });
        let live = slot.load(std::sync::atomic::Ordering::Acquire, guard);
        assert_eq!(state_of(live), CellState::Live);
        assert_eq!(state_of(live.with_tag(TAG_TOMB)), CellState::Tombstone);
        assert_eq!(state_of(live.with_tag(TAG_PRIME)), CellState::Prime);

        unsafe {
            drop(slot.into_owned());
        }
    }

    #[test]
    fn test_tag_survives_roundtrip() {
        let guard = unsafe { epoch::unprotected() };
        let owned = Owned::new(Cell { key: 9_u8, value: () });
        let shared = owned.into_shared(guard);
        let tombed = shared.with_tag(TAG_TOMB);
        // Tagging never perturbs the referent.
        assert_eq!(unsafe { tombed.deref() }.key, 9);
        unsafe {
            drop(tombed.with_tag(0).into_owned());
        }
    }
}
