//! Bounded local history of observed messages.
//!
//! The host application owns a [`RingBuffer`] and shares it with the
//! [`Bridge`](crate::bridge::Bridge); a co-located consumer polls it by
//! timestamp. Entries are never sorted: insertion order is the read
//! order, and timestamps are whatever the producers stamped.

use parking_lot::Mutex;

/// One stored entry: the stamp chosen at push time and the exact
/// serialization that was persisted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredMessage {
    pub timestamp: i64,
    pub json_text: String,
}

struct Inner {
    buf: Vec<Option<StoredMessage>>,
    /// next write index
    head: usize,
    /// number of valid entries, <= capacity
    count: usize,
}

/// Fixed-capacity circular store of recent messages. All operations
/// take the internal mutex for their full duration, so a push that has
/// returned is visible to any subsequent `get_since` from any thread.
pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl RingBuffer {
    /// Preallocates storage for `capacity` entries. `capacity` must be
    /// at least 1.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "RingBuffer capacity must be >= 1");
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || None);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                buf,
                head: 0,
                count: 0,
            }),
        }
    }

    /// Store `(timestamp, json_text)`, overwriting the oldest entry
    /// when full. Never fails.
    pub fn push(&self, timestamp: i64, json_text: impl Into<String>) {
        let mut inner = self.inner.lock();
        let head = inner.head;
        inner.buf[head] = Some(StoredMessage {
            timestamp,
            json_text: json_text.into(),
        });
        inner.head = (head + 1) % self.capacity;
        if inner.count < self.capacity {
            inner.count += 1;
        }
    }

    /// Every currently-stored entry with `timestamp > since_ts`
    /// (strict), in insertion order, oldest first. Allocates a fresh
    /// vector and leaves the buffer untouched.
    pub fn get_since(&self, since_ts: i64) -> Vec<StoredMessage> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for i in 0..inner.count {
            let idx = (inner.head + self.capacity - inner.count + i) % self.capacity;
            if let Some(entry) = &inner.buf[idx] {
                if entry.timestamp > since_ts {
                    out.push(entry.clone());
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().count == 0
    }

    /// Reset to empty without deallocating the backing storage.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.head = 0;
        inner.count = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
