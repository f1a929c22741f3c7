//! Circular buffer of the most recent log lines.

use std::collections::VecDeque;

/// Fixed-capacity line buffer; the oldest line is evicted first.
#[derive(Debug)]
pub struct RecentLines {
    lines: VecDeque<String>,
    capacity: usize,
}

impl RecentLines {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Push raw formatter output, which may contain several lines.
    pub fn push_chunk(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if self.lines.len() == self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line.to_string());
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_line() {
        let mut ring = RecentLines::new(2);
        ring.push_chunk(b"one\n");
        ring.push_chunk(b"two\nthree\n");
        assert_eq!(ring.snapshot(), vec!["two".to_string(), "three".to_string()]);
    }

    #[test]
    fn test_skips_blank_lines() {
        let mut ring = RecentLines::new(4);
        ring.push_chunk(b"\n\n  \nhello   \n");
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.snapshot()[0], "hello");
    }
}
