use std::collections::HashMap;
use std::sync::Mutex;

/// Registry is a thread-safe string-keyed map used for the relay's
/// three tables: slots, pending handshakes, and paired connections.
/// All access goes through keyed get/insert/remove; iteration is not
/// exposed.
pub struct Registry<V> {
    entries: Mutex<HashMap<String, V>>,
}

/// Registry implementation block
impl<V> Registry<V> {
    /// new is a constructor for an empty Registry
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// insert stores a value under key only when the key is free; a
    /// rejected value is handed back to the caller. The
    /// insert-or-reject decision is atomic, so two concurrent
    /// registrations of one slot name resolve to exactly one winner.
    pub fn insert(&self, key: &str, value: V) -> Result<(), V> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if entries.contains_key(key) {
            return Err(value);
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }

    /// get returns a clone of the value stored under key
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .get(key)
            .cloned()
    }

    /// remove takes the value stored under key, transferring ownership
    /// to the caller; claiming a pending handshake is exactly this
    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .remove(key)
    }

    /// len returns the number of live entries
    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }

    /// is_empty reports whether the registry holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn insert_rejects_duplicate_keys_and_returns_the_value() {
        let reg = Registry::new();
        assert!(reg.insert("a", 1).is_ok());
        assert_eq!(reg.insert("a", 2), Err(2));
        assert_eq!(reg.get("a"), Some(1));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_transfers_ownership_once() {
        let reg: Registry<String> = Registry::new();
        assert!(reg.insert("k", "v".to_string()).is_ok());
        assert_eq!(reg.remove("k"), Some("v".to_string()));
        assert_eq!(reg.remove("k"), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn concurrent_inserts_of_one_key_have_one_winner() {
        let reg = Arc::new(Registry::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let reg = Arc::clone(&reg);
            handles.push(std::thread::spawn(move || reg.insert("slot", i).is_ok()));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(reg.len(), 1);
    }
}
