//! Event-loop identity, addresses and the directory that maps one to the other.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

/// Opaque name of one running region controller process.
///
/// Names usually look like `host:pid=1234` but are never parsed; they are
/// only compared for equality and used as map keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventLoopName(String);

impl EventLoopName {
    /// Wrap a raw name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventLoopName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventLoopName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EventLoopName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for EventLoopName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One TCP endpoint through which an event-loop may be reached.
///
/// Serialized as a two-element `[host, port]` array, which is how the
/// directory endpoint reports it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, u16)", into = "(String, u16)")]
pub struct Address {
    /// Hostname or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<(String, u16)> for Address {
    fn from((host, port): (String, u16)) -> Self {
        Self { host, port }
    }
}

impl From<Address> for (String, u16) {
    fn from(addr: Address) -> Self {
        (addr.host, addr.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Authoritative mapping of event-loop name to candidate addresses.
///
/// Rebuilt wholesale on every poll; never merged with a previous directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Directory(BTreeMap<EventLoopName, Vec<Address>>);

impl Directory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the candidate list for an event-loop.
    pub fn insert(&mut self, name: impl Into<EventLoopName>, addresses: Vec<Address>) {
        self.0.insert(name.into(), addresses);
    }

    /// Candidate addresses for an event-loop, in directory order.
    pub fn addresses(&self, name: &str) -> Option<&[Address]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// All event-loop names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &EventLoopName> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EventLoopName, &[Address])> {
        self.0.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(EventLoopName, Vec<Address>)> for Directory {
    fn from_iter<I: IntoIterator<Item = (EventLoopName, Vec<Address>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Body returned by the directory endpoint: `{"eventloops": {...}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryResponse {
    pub eventloops: Directory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_response_parses_host_port_pairs() {
        let body = r#"{
            "eventloops": {
                "host1:pid=1001": [["1.1.1.1", 1111], ["1.1.1.2", 2222]],
                "host2:pid=3003": [["2.2.2.2", 5555]]
            }
        }"#;
        let resp: DirectoryResponse = serde_json::from_str(body).unwrap();
        let dir = resp.eventloops;
        assert_eq!(dir.len(), 2);
        assert_eq!(
            dir.addresses("host1:pid=1001").unwrap(),
            &[Address::new("1.1.1.1", 1111), Address::new("1.1.1.2", 2222)]
        );
        assert_eq!(
            dir.addresses("host2:pid=3003").unwrap()[0].to_string(),
            "2.2.2.2:5555"
        );
    }

    #[test]
    fn test_address_serializes_as_pair() {
        let json = serde_json::to_string(&Address::new("10.0.0.1", 4000)).unwrap();
        assert_eq!(json, r#"["10.0.0.1",4000]"#);
    }

    #[test]
    fn test_eventloop_name_is_opaque() {
        let name = EventLoopName::from("host:pid=12");
        assert_eq!(name.as_str(), "host:pid=12");
        assert_eq!(serde_json::to_string(&name).unwrap(), r#""host:pid=12""#);
    }

    #[test]
    fn test_malformed_address_rejected() {
        let body = r#"{"eventloops": {"a": [["host"]]}}"#;
        assert!(serde_json::from_str::<DirectoryResponse>(body).is_err());
    }
}
