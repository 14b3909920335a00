//! Static host tables.
//!
//! Two tables take precedence over the DNS: the system hosts file and the
//! per-network custom host table from the configuration. The custom table
//! is authoritative when configured: a name present there is answered
//! from the table and never sent upstream.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use domain::base::name::Name;

//------------ Hosts ---------------------------------------------------------

/// A static name to address table with a reverse view.
///
/// Name comparison is case-insensitive through the name type itself.
#[derive(Clone, Debug, Default)]
pub struct Hosts {
    /// Name to addresses.
    forward: HashMap<Name<Vec<u8>>, Vec<IpAddr>>,

    /// Address to names.
    reverse: HashMap<IpAddr, Vec<Name<Vec<u8>>>>,
}

impl Hosts {
    /// Creates an empty table.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a table from the system hosts file, empty on failure.
    pub fn system() -> Self {
        let mut res = Self::new();
        let _ = res.parse_file("/etc/hosts");
        res
    }

    /// Creates a table from configured (name, address) pairs.
    ///
    /// Unparseable names are skipped.
    pub fn from_pairs(pairs: &[(String, IpAddr)]) -> Self {
        let mut res = Self::new();
        for (name, addr) in pairs {
            if let Ok(name) = Name::from_str(name) {
                res.add(name, *addr);
            }
        }
        res
    }

    /// Returns whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Adds a forward and reverse mapping.
    pub fn add(&mut self, name: Name<Vec<u8>>, addr: IpAddr) {
        self.forward
            .entry(name.clone())
            .or_default()
            .push(addr);
        self.reverse.entry(addr).or_default().push(name);
    }

    /// Looks up the addresses of a name.
    pub fn lookup_host(&self, name: &Name<Vec<u8>>) -> Option<&[IpAddr]> {
        self.forward.get(name).map(Vec::as_slice)
    }

    /// Looks up the names of an address.
    pub fn lookup_addr(&self, addr: IpAddr) -> Option<&[Name<Vec<u8>>]> {
        self.reverse.get(&addr).map(Vec::as_slice)
    }

    /// Adds the entries of a hosts file.
    pub fn parse_file(&mut self, path: impl AsRef<Path>) -> io::Result<()> {
        let content = std::fs::read_to_string(path)?;
        for line in content.lines() {
            self.parse_line(line);
        }
        Ok(())
    }

    /// Parses a single hosts-file line, ignoring anything malformed.
    fn parse_line(&mut self, line: &str) {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        let mut words = line.split_whitespace();
        let addr = match words.next().and_then(|w| IpAddr::from_str(w).ok()) {
            Some(addr) => addr,
            None => return,
        };
        for word in words {
            if let Ok(name) = Name::from_str(word) {
                self.add(name, addr);
            }
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name<Vec<u8>> {
        Name::from_str(s).unwrap()
    }

    #[test]
    fn parse_and_lookup() {
        let mut hosts = Hosts::new();
        hosts.parse_line("127.0.0.1 localhost localhost.localdomain");
        hosts.parse_line("::1 localhost # comment");
        hosts.parse_line("not-an-address foo");

        let addrs = hosts.lookup_host(&name("localhost")).unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(
            hosts.lookup_addr("127.0.0.1".parse().unwrap()).unwrap().len(),
            2
        );
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let hosts = Hosts::from_pairs(&[(
            "Router.Example.Com".into(),
            "192.0.2.1".parse().unwrap(),
        )]);
        assert!(hosts.lookup_host(&name("router.example.com")).is_some());
    }
}
