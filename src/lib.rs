//! Lock-free concurrent collections.
//!
//! The core of the crate is [`NonBlockingHashMap`], a resizing,
//! open-addressed hash table derived from Cliff Click's non-blocking hash
//! map: per-slot memoized hashes, a five-state value cell driven purely by
//! CAS, and cooperative incremental resize where every mutator that sees a
//! migration in progress pays a chunk of the copy work. [`NonBlockingHashSet`]
//! is the same engine with unit values and an interning primitive.
//!
//! Single-key operations are linearizable per key and lock-free: no
//! operation ever blocks on another thread's progress. Aggregate views
//! ([`NonBlockingHashMap::len_estimate`], iteration) are racy by contract
//! and only settle under external quiescence.
//!
//! Around the core there are the usual collaborators: a Michael-Scott
//! [`Queue`], a Treiber [`Stack`], a cache-line [`StripedCounter`], an
//! object [`Pool`] and an interning [`Atomizer`].
//!
//! Memory reclamation is epoch-based (`crossbeam-epoch`): retired cells and
//! tables are freed once every thread that could have seen them has moved
//! on. Every operation pins an epoch for its own bounded duration;
//! iterators pin one for their whole lifetime.
//!
//! ```
//! use nonblocking::NonBlockingHashMap;
//!
//! let map: NonBlockingHashMap<String, u32> = NonBlockingHashMap::new();
//! map.put("a".to_string(), 1);
//! assert_eq!(map.get(&"a".to_string()), Some(1));
//! assert_eq!(map.remove(&"a".to_string()), Some(1));
//! assert_eq!(map.remove(&"a".to_string()), None);
//! ```

mod atomizer;
mod cell;
mod comparator;
mod counter;
mod error;
mod iter;
mod map;
mod pool;
mod queue;
mod set;
mod stack;
mod table;

pub use crate::atomizer::Atomizer;
pub use crate::comparator::{Comparator, IdentityComparator, NaturalComparator};
pub use crate::counter::StripedCounter;
pub use crate::error::Error;
pub use crate::iter::{Iter, RemoveWhere};
pub use crate::map::NonBlockingHashMap;
pub use crate::pool::Pool;
pub use crate::queue::Queue;
pub use crate::set::{Keys, NonBlockingHashSet};
pub use crate::stack::Stack;
pub use crate::table::ResizeTuning;
