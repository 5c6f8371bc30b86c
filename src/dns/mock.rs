//! Fixture-backed stand-in for the hickory resolver, used by unit tests.

use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Clone, Default)]
pub struct Resolver {
    /// MX answers in query order: (host, preference).
    pub mx: Vec<(String, u16)>,
    /// TXT answers per fully qualified name.
    pub txt: HashMap<String, Vec<String>>,
    pub ips: Vec<IpAddr>,
    pub cname: HashMap<String, Vec<String>>,
    /// When set, every lookup fails with this message.
    pub fail_with: Option<String>,
}

impl Resolver {
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_txt(mut self, name: &str, value: &str) -> Self {
        self.txt
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn with_mx(mut self, host: &str, preference: u16) -> Self {
        self.mx.push((host.to_string(), preference));
        self
    }

    pub fn with_cname(mut self, name: &str, target: &str) -> Self {
        self.cname
            .entry(name.to_string())
            .or_default()
            .push(target.to_string());
        self
    }
}
