//! Ordered ICAP header map.
//!
//! Names compare case-insensitively and stay unique. Inserting a name that
//! already exists replaces its value in place, so the first spelling and the
//! original position are kept while the last value wins.

use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header. Returns the previous value, if any.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Remove a header, keeping the order of the rest.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|i| self.entries.remove(i).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[inline]
    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, String)>,
        fn(&'a (String, String)) -> (&'a str, &'a str),
    >;

    fn into_iter(self) -> Self::IntoIter {
        fn pair(e: &(String, String)) -> (&str, &str) {
            (e.0.as_str(), e.1.as_str())
        }
        self.entries.iter().map(pair as fn(&'a (String, String)) -> (&'a str, &'a str))
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (n, v) in iter {
            headers.insert(n, v);
        }
        headers
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            writeln!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.insert("Host", "icap-server.net");
        assert_eq!(h.get("host"), Some("icap-server.net"));
        assert_eq!(h.get("HOST"), Some("icap-server.net"));
        assert!(h.contains("hOsT"));
    }

    #[test]
    fn last_write_wins_in_place() {
        let mut h = Headers::new();
        h.insert("Allow", "204");
        h.insert("Host", "a");
        let prev = h.insert("allow", "206");
        assert_eq!(prev.as_deref(), Some("204"));
        assert_eq!(h.len(), 2);
        let order: Vec<_> = h.iter().collect();
        assert_eq!(order, vec![("Allow", "206"), ("Host", "a")]);
    }

    #[test]
    fn remove_keeps_order() {
        let mut h: Headers = [("A", "1"), ("B", "2"), ("C", "3")].into_iter().collect();
        assert_eq!(h.remove("b").as_deref(), Some("2"));
        let names: Vec<_> = (&h).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["A", "C"]);
        assert!(h.remove("missing").is_none());
    }
}
