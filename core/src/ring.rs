//! Fixed-capacity ring of recent PTY output bytes. This is the in-memory
//! fallback history source when the scrollback file cannot be read in time;
//! the durable copy lives with the output file manager.

use std::sync::Mutex;

pub struct RingBuffer {
    data: Mutex<Vec<u8>>,
    cap: usize,
}

impl RingBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Mutex::new(Vec::new()),
            cap,
        }
    }

    /// Append bytes; when over capacity, the oldest bytes are dropped.
    pub fn push(&self, bytes: &[u8]) {
        let mut g = match self.data.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        g.extend_from_slice(bytes);
        if g.len() > self.cap {
            let excess = g.len() - self.cap;
            g.drain(..excess);
        }
    }

    /// Copy of the current contents.
    pub fn dump(&self) -> Vec<u8> {
        match self.data.lock() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    pub fn clear(&self) {
        match self.data.lock() {
            Ok(mut g) => g.clear(),
            Err(p) => p.into_inner().clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_when_over_capacity() {
        let ring = RingBuffer::new(8);
        ring.push(b"abcdef");
        ring.push(b"ghij");
        assert_eq!(ring.dump(), b"cdefghij");
    }

    #[test]
    fn clear_empties() {
        let ring = RingBuffer::new(8);
        ring.push(b"abc");
        ring.clear();
        assert!(ring.dump().is_empty());
    }
}
