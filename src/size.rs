//! Estimated in-memory byte cost of values.
//!
//! The calculator knows a fixed width for every scalar shape, walks
//! containers structurally, and falls back to serialized-length
//! estimation for opaque foreign values, cached per type name in a
//! bounded LRU.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{PlinthError, PlinthResult};
use crate::serializer::{JsonSerializer, Serializer};
use crate::value::Value;

/// Width of a reference / null value.
const REF_WIDTH: u64 = 8;
/// Header cost of a string or sequence.
const SEQ_HEADER: u64 = 24;
/// Header cost of a mapping.
const MAP_HEADER: u64 = 32;

/// Options for [`SizeCalculator`].
#[derive(Debug, Clone)]
pub struct SizeCalculatorOptions {
    /// Capacity of the per-type fallback cache.
    pub fallback_cache_size: usize,
}

impl Default for SizeCalculatorOptions {
    fn default() -> Self {
        Self {
            fallback_cache_size: 1000,
        }
    }
}

/// Computes an estimated byte cost for a [`Value`].
///
/// Measuring is deterministic: two calls on the same value return the
/// same result. Shared nodes are costed once per call; revisits (and
/// cycles) cost the reference width only.
pub struct SizeCalculator {
    serializer: Arc<dyn Serializer>,
    fallback: Mutex<LruCache<String, u64>>,
    closed: AtomicBool,
}

impl SizeCalculator {
    /// Create a calculator with the default JSON serializer.
    pub fn new() -> Self {
        Self::with_options(Arc::new(JsonSerializer), SizeCalculatorOptions::default())
    }

    /// Create a calculator with an explicit serializer and options.
    pub fn with_options(serializer: Arc<dyn Serializer>, options: SizeCalculatorOptions) -> Self {
        let capacity = NonZeroUsize::new(options.fallback_cache_size.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            serializer,
            fallback: Mutex::new(LruCache::new(capacity)),
            closed: AtomicBool::new(false),
        }
    }

    /// Estimate the byte cost of `value`.
    pub fn measure(&self, value: &Value) -> PlinthResult<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlinthError::Closed);
        }
        let mut visited = HashSet::new();
        self.measure_inner(value, &mut visited)
    }

    fn measure_inner(&self, value: &Value, visited: &mut HashSet<usize>) -> PlinthResult<u64> {
        Ok(match value {
            Value::Null => REF_WIDTH,
            Value::Bool(_) => 1,
            Value::Int16(_) => 2,
            Value::Int32(_) => 4,
            Value::Int(_) | Value::Float(_) | Value::Time(_) => 8,
            Value::Id(_) => 16,
            Value::Str(s) => SEQ_HEADER + 2 * s.encode_utf16().count() as u64,
            Value::Bytes(b) => SEQ_HEADER + b.len() as u64,
            Value::Seq(items) => {
                // Homogeneous fixed-width sequences skip the per-element walk.
                if let Some(width) = homogeneous_width(items) {
                    SEQ_HEADER + width * items.len() as u64
                } else {
                    let mut total = SEQ_HEADER;
                    for item in items {
                        total += self.measure_inner(item, visited)?;
                    }
                    total
                }
            }
            Value::Map(map) => {
                let mut total = MAP_HEADER;
                for (key, entry) in map {
                    total += SEQ_HEADER + 2 * key.encode_utf16().count() as u64;
                    total += self.measure_inner(entry, visited)?;
                }
                total
            }
            Value::Shared(shared) => {
                if !visited.insert(shared.ptr_id()) {
                    REF_WIDTH
                } else {
                    let inner = shared.get();
                    REF_WIDTH + self.measure_inner(&inner, visited)?
                }
            }
            Value::Opaque(opaque) => {
                SEQ_HEADER + self.fallback_length(opaque.type_name(), value)?
            }
        })
    }

    /// Serialized length of an opaque value, cached per type name.
    fn fallback_length(&self, type_name: &str, value: &Value) -> PlinthResult<u64> {
        if let Some(length) = self.fallback.lock().get(type_name) {
            return Ok(*length);
        }
        let length = self.serializer.serialize(value)?.len() as u64;
        let mut cache = self.fallback.lock();
        if cache.len() >= cache.cap().get() {
            // Evict the least-recently-used tenth in one sweep so the
            // cache does not thrash entry-by-entry at the boundary.
            let evict = (cache.cap().get() / 10).max(1);
            for _ in 0..evict {
                if cache.pop_lru().is_none() {
                    break;
                }
            }
        }
        cache.put(type_name.to_string(), length);
        Ok(length)
    }

    /// Number of cached fallback entries; exposed for tests.
    pub fn cache_count(&self) -> usize {
        self.fallback.lock().len()
    }

    /// Dispose the calculator; further calls fail with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Default for SizeCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed width for scalar shapes, `None` for variable-size shapes.
fn scalar_width(value: &Value) -> Option<u64> {
    match value {
        Value::Null => Some(REF_WIDTH),
        Value::Bool(_) => Some(1),
        Value::Int16(_) => Some(2),
        Value::Int32(_) => Some(4),
        Value::Int(_) | Value::Float(_) | Value::Time(_) => Some(8),
        Value::Id(_) => Some(16),
        _ => None,
    }
}

/// Shared element width of a homogeneous fixed-width sequence.
fn homogeneous_width(items: &[Value]) -> Option<u64> {
    let first = items.first()?;
    let width = scalar_width(first)?;
    let discriminant = std::mem::discriminant(first);
    items
        .iter()
        .all(|item| std::mem::discriminant(item) == discriminant)
        .then_some(width)
}
