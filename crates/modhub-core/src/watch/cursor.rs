use std::collections::HashMap;

/// Last modification index seen per watched prefix.
#[derive(Debug, Default, Clone)]
pub struct WatchCursor {
    last_seen: HashMap<String, u64>,
}

impl WatchCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `index` for `prefix`. Returns `false` if it equals the last
    /// index already seen, meaning the round carries nothing new.
    pub fn observe(&mut self, prefix: &str, index: u64) -> bool {
        match self.last_seen.get(prefix) {
            Some(last) if *last == index => false,
            _ => {
                self.last_seen.insert(prefix.to_string(), index);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_seen.clear();
    }
}
