//! Collection adapter: normalizes enumerable inputs into `(key, value)` streams.
//!
//! [`Source`] is a closed tagged union built by explicit constructors — one
//! variant per supported input shape — instead of runtime capability probing.
//! A [`SourceCursor`] walks a source on demand; the shared variants re-read
//! the underlying container on every pull, so worker code may grow or shrink
//! it mid-run and the cursor observes live state, never a snapshot.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};

// ── SourceKey ────────────────────────────────────────────────────────

/// Key half of a `(key, value)` pair.
///
/// Sequences, element sets, and lazy sources get positional keys; mappings
/// and named task graphs get their native keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SourceKey {
    Index(usize),
    Name(Arc<str>),
}

impl SourceKey {
    /// Build a named key.
    pub fn name(name: impl AsRef<str>) -> Self {
        SourceKey::Name(Arc::from(name.as_ref()))
    }

    /// The positional index, if this is a positional key.
    pub fn index(&self) -> Option<usize> {
        match self {
            SourceKey::Index(i) => Some(*i),
            SourceKey::Name(_) => None,
        }
    }

    /// The name, if this is a named key.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            SourceKey::Index(_) => None,
            SourceKey::Name(n) => Some(n),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKey::Index(i) => write!(f, "{i}"),
            SourceKey::Name(n) => write!(f, "{n}"),
        }
    }
}

// ── Cursor contract ──────────────────────────────────────────────────

/// Result of asking a cursor for its next pair.
#[derive(Debug)]
pub enum Pull<V> {
    /// A pair is available.
    Item(SourceKey, V),
    /// Nothing right now, but more may arrive (push-fed cursors only).
    Pending,
    /// The source will never yield another pair.
    Exhausted,
}

/// Position tracker over a stream of `(key, value)` pairs.
///
/// Finite sources only ever answer `Item` or `Exhausted` from
/// [`take_next`](Cursor::take_next). Push-fed cursors (pool queues,
/// scheduler ready-sets) answer `Pending` when empty and use
/// [`wait`](Cursor::wait) to park the kernel until items arrive.
#[async_trait]
pub trait Cursor<V>: Send {
    /// Pull the next pair, without blocking.
    fn take_next(&mut self) -> Pull<V>;

    /// Pairs left to pull, recomputed from the live size — never cached.
    ///
    /// `None` when the count is unknowable (lazy single-pass sources
    /// before exhaustion).
    fn remaining(&self) -> Option<usize>;

    /// Wait until more pairs may be available.
    ///
    /// Returns `false` when no further pair will ever arrive. Finite
    /// sources never have more coming, hence the default.
    async fn wait(&mut self) -> bool {
        false
    }
}

// ── Source ───────────────────────────────────────────────────────────

enum Repr<V> {
    Empty,
    Sequence(Vec<V>),
    Mapping(IndexMap<String, V>),
    Elements(IndexSet<V>),
    SharedSequence(Arc<Mutex<Vec<V>>>),
    SharedElements(Arc<Mutex<IndexSet<V>>>),
    Lazy(Box<dyn Iterator<Item = V> + Send>),
}

/// An enumerable input, adapted once per run.
///
/// Absent input is not an error: `Source::empty()` (or `None` via the
/// `From<Option<_>>` impl) yields zero tasks, so operations over it are
/// no-ops.
pub struct Source<V> {
    repr: Repr<V>,
}

impl<V> Source<V> {
    /// A source yielding no pairs.
    pub fn empty() -> Self {
        Self { repr: Repr::Empty }
    }

    /// An ordered sequence; keys are positions.
    pub fn sequence(items: impl IntoIterator<Item = V>) -> Self {
        Self {
            repr: Repr::Sequence(items.into_iter().collect()),
        }
    }

    /// A key→value mapping; iteration order is the map's insertion order.
    pub fn mapping(entries: IndexMap<String, V>) -> Self {
        Self {
            repr: Repr::Mapping(entries),
        }
    }

    /// A unique-element container; keys are positions.
    pub fn elements(set: IndexSet<V>) -> Self {
        Self {
            repr: Repr::Elements(set),
        }
    }

    /// A sequence that worker code may mutate while the run is in flight.
    /// Size is re-read on every pull.
    pub fn shared_sequence(items: Arc<Mutex<Vec<V>>>) -> Self {
        Self {
            repr: Repr::SharedSequence(items),
        }
    }

    /// A unique-element container that worker code may mutate while the run
    /// is in flight. Size is re-read on every pull.
    pub fn shared_elements(set: Arc<Mutex<IndexSet<V>>>) -> Self {
        Self {
            repr: Repr::SharedElements(set),
        }
    }

    /// A finite, single-pass, non-restartable sequence. Remaining length is
    /// unknowable until exhaustion is observed.
    pub fn lazy(iter: impl Iterator<Item = V> + Send + 'static) -> Self {
        Self {
            repr: Repr::Lazy(Box::new(iter)),
        }
    }

    /// Open a cursor at the start of this source.
    pub fn into_cursor(self) -> SourceCursor<V> {
        SourceCursor {
            repr: self.repr,
            pos: 0,
            seen_end: false,
        }
    }
}

impl<V> From<Option<Source<V>>> for Source<V> {
    fn from(value: Option<Source<V>>) -> Self {
        value.unwrap_or_else(Source::empty)
    }
}

impl<V> From<Vec<V>> for Source<V> {
    fn from(items: Vec<V>) -> Self {
        Source::sequence(items)
    }
}

impl<V> From<VecDeque<V>> for Source<V> {
    fn from(items: VecDeque<V>) -> Self {
        Source::sequence(items)
    }
}

impl<V> From<IndexMap<String, V>> for Source<V> {
    fn from(entries: IndexMap<String, V>) -> Self {
        Source::mapping(entries)
    }
}

// ── SourceCursor ─────────────────────────────────────────────────────

/// Cursor over a [`Source`]. Values are cloned out so shared containers
/// stay observable by their owners.
pub struct SourceCursor<V> {
    repr: Repr<V>,
    pos: usize,
    seen_end: bool,
}

fn lock_live<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl<V: Clone + Send> Cursor<V> for SourceCursor<V> {
    fn take_next(&mut self) -> Pull<V> {
        let pos = self.pos;
        let next = match &mut self.repr {
            Repr::Empty => None,
            Repr::Sequence(items) => items
                .get(pos)
                .map(|v| (SourceKey::Index(pos), v.clone())),
            Repr::Mapping(entries) => entries
                .get_index(pos)
                .map(|(k, v)| (SourceKey::name(k), v.clone())),
            Repr::Elements(set) => set
                .get_index(pos)
                .map(|v| (SourceKey::Index(pos), v.clone())),
            Repr::SharedSequence(items) => lock_live(items)
                .get(pos)
                .map(|v| (SourceKey::Index(pos), v.clone())),
            Repr::SharedElements(set) => lock_live(set)
                .get_index(pos)
                .map(|v| (SourceKey::Index(pos), v.clone())),
            Repr::Lazy(iter) => iter.next().map(|v| (SourceKey::Index(pos), v)),
        };
        match next {
            Some((key, value)) => {
                self.pos += 1;
                Pull::Item(key, value)
            }
            None => {
                self.seen_end = true;
                Pull::Exhausted
            }
        }
    }

    fn remaining(&self) -> Option<usize> {
        let len = match &self.repr {
            Repr::Empty => 0,
            Repr::Sequence(items) => items.len(),
            Repr::Mapping(entries) => entries.len(),
            Repr::Elements(set) => set.len(),
            Repr::SharedSequence(items) => lock_live(items).len(),
            Repr::SharedElements(set) => lock_live(set).len(),
            Repr::Lazy(_) => return self.seen_end.then_some(0),
        };
        Some(len.saturating_sub(self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<V: Clone + Send>(mut cursor: SourceCursor<V>) -> Vec<(SourceKey, V)> {
        let mut out = Vec::new();
        loop {
            match cursor.take_next() {
                Pull::Item(k, v) => out.push((k, v)),
                Pull::Pending => unreachable!("finite sources never pend"),
                Pull::Exhausted => return out,
            }
        }
    }

    #[test]
    fn test_sequence_positional_keys() {
        let pairs = drain(Source::sequence(vec!["a", "b", "c"]).into_cursor());
        let keys: Vec<_> = pairs.iter().filter_map(|(k, _)| k.index()).collect();
        assert_eq!(keys, vec![0, 1, 2]);
        assert_eq!(pairs[2].1, "c");
    }

    #[test]
    fn test_mapping_preserves_insertion_order() {
        let mut entries = IndexMap::new();
        entries.insert("one".to_string(), 1);
        entries.insert("two".to_string(), 2);
        let pairs = drain(Source::mapping(entries).into_cursor());
        assert_eq!(pairs[0].0.as_name(), Some("one"));
        assert_eq!(pairs[1].0.as_name(), Some("two"));
        assert_eq!(pairs[1].1, 2);
    }

    #[test]
    fn test_absent_input_is_empty() {
        let source: Source<u32> = None.into();
        let pairs = drain(source.into_cursor());
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_remaining_recomputed_not_cached() {
        let shared = Arc::new(Mutex::new(vec![1, 2, 3]));
        let mut cursor = Source::shared_sequence(shared.clone()).into_cursor();
        assert_eq!(cursor.remaining(), Some(3));
        let _ = cursor.take_next();
        shared.lock().unwrap().push(4);
        assert_eq!(cursor.remaining(), Some(3));
    }

    #[test]
    fn test_shared_elements_observe_live_removals() {
        let set: IndexSet<i32> = [1, 2, 3, 4].into_iter().collect();
        let shared = Arc::new(Mutex::new(set));
        let mut cursor = Source::shared_elements(shared.clone()).into_cursor();

        let mut visited = Vec::new();
        while let Pull::Item(_, v) = cursor.take_next() {
            visited.push(v);
            // Each visit removes the successor, shrinking the live set.
            shared.lock().unwrap().shift_remove(&(v + 1));
        }
        assert_eq!(visited, vec![1, 3]);
    }

    #[test]
    fn test_lazy_remaining_unknown_until_exhausted() {
        let mut cursor = Source::lazy(0..2).into_cursor();
        assert_eq!(cursor.remaining(), None);
        let _ = cursor.take_next();
        let _ = cursor.take_next();
        assert_eq!(cursor.remaining(), None);
        assert!(matches!(cursor.take_next(), Pull::Exhausted));
        assert_eq!(cursor.remaining(), Some(0));
    }
}
