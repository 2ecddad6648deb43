/// Ordered RTSP header map.
///
/// Names are stored as first received (case-preserving) and looked up
/// case-insensitively per RFC 2326 §4.2. Setting a name that already exists
/// replaces its value in place, so a duplicated header in a parsed message
/// keeps its first position and its last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert or overwrite (last write wins).
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("CSeq", "42");
        assert_eq!(headers.get("cseq"), Some("42"));
        assert_eq!(headers.get("CSEQ"), Some("42"));
    }

    #[test]
    fn last_write_wins_and_keeps_position() {
        let mut headers = Headers::new();
        headers.set("Session", "A");
        headers.set("CSeq", "1");
        headers.set("session", "B");

        let names: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["Session", "CSeq"]);
        assert_eq!(headers.get("Session"), Some("B"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn remove_header() {
        let mut headers = Headers::new();
        headers.set("Content-Length", "5");
        assert_eq!(headers.remove("content-length"), Some("5".to_string()));
        assert!(headers.is_empty());
        assert_eq!(headers.remove("Content-Length"), None);
    }
}
