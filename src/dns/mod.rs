use base64ct::{Base64, Base64Unpadded, Encoding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
#[cfg(not(test))]
use std::net::SocketAddr;
#[cfg(not(test))]
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

#[cfg(not(test))]
use hickory_resolver::{
    Resolver,
    config::{NameServerConfig, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::{
        rr::{RData, RecordType},
        xfer::Protocol,
    },
};

#[cfg(test)]
pub mod mock;

#[cfg(not(test))]
const DEFAULT_DNS_PORT: u16 = 53;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("dns lookup failed: {0}")]
    Lookup(String),
}

/// One mail exchanger for a recipient domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    pub host: String,
    pub preference: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Verified,
    Info,
    Failed,
}

/// Outcome of a single DNS record check during domain verification.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifyResult {
    pub status: VerifyStatus,
    pub reason: String,
    pub value: Option<String>,
}

impl VerifyResult {
    pub fn verified(reason: impl Into<String>) -> Self {
        Self {
            status: VerifyStatus::Verified,
            reason: reason.into(),
            value: None,
        }
    }

    pub fn info(reason: impl Into<String>, value: Option<String>) -> Self {
        Self {
            status: VerifyStatus::Info,
            reason: reason.into(),
            value,
        }
    }

    pub fn failed(reason: impl Into<String>, value: Option<String>) -> Self {
        Self {
            status: VerifyStatus::Failed,
            reason: reason.into(),
            value,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == VerifyStatus::Verified
    }
}

/// Everything `domain:verify` learns about a sending domain in one pass.
#[derive(Debug, Deserialize, Serialize)]
pub struct DomainVerification {
    pub timestamp: DateTime<Utc>,
    pub mx: VerifyResult,
    pub spf: VerifyResult,
    pub dkim: VerifyResult,
    pub dmarc: VerifyResult,
    pub return_path: VerifyResult,
}

impl DomainVerification {
    /// DMARC is advisory; the other four records gate the domain.
    pub fn all_required_passed(&self) -> bool {
        self.mx.passed() && self.spf.passed() && self.dkim.passed() && self.return_path.passed()
    }
}

#[derive(Clone)]
pub struct DnsResolver {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    resolver: mock::Resolver,
}

impl DnsResolver {
    /// Build a resolver. `nameserver` overrides the defaults; a bare
    /// address gets the standard DNS port.
    #[cfg(not(test))]
    pub fn new(
        nameserver: Option<&str>,
        timeout: Duration,
        cache_ttl: Duration,
    ) -> Result<Self, DnsError> {
        let mut options = ResolverOpts::default();
        options.timeout = timeout;
        options.attempts = 2;
        options.positive_max_ttl = Some(cache_ttl);

        let mut config = ResolverConfig::new();
        for addr in Self::nameserver_addrs(nameserver)? {
            config.add_name_server(NameServerConfig {
                socket_addr: addr,
                protocol: Protocol::Udp,
                tls_dns_name: None,
                http_endpoint: None,
                trust_negative_responses: false,
                bind_addr: None,
            });
        }

        Ok(Self {
            resolver: Resolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(options)
                .build(),
        })
    }

    #[cfg(not(test))]
    fn nameserver_addrs(nameserver: Option<&str>) -> Result<Vec<SocketAddr>, DnsError> {
        match nameserver {
            Some(spec) => {
                let addr = if let Ok(addr) = spec.parse::<SocketAddr>() {
                    addr
                } else {
                    let ip: IpAddr = spec.parse().map_err(|_| {
                        DnsError::Lookup(format!("invalid nameserver address: {spec}"))
                    })?;
                    SocketAddr::new(ip, DEFAULT_DNS_PORT)
                };
                Ok(vec![addr])
            }
            None => Ok(vec![
                SocketAddr::new([1, 1, 1, 1].into(), DEFAULT_DNS_PORT),
                SocketAddr::new([8, 8, 8, 8].into(), DEFAULT_DNS_PORT),
            ]),
        }
    }

    #[cfg(test)]
    pub fn mock(resolver: mock::Resolver) -> Self {
        Self { resolver }
    }

    /// MX hosts for a domain, ascending by preference with query order
    /// preserved among ties. A domain without MX records resolves to
    /// itself at preference 0 (RFC 5321 apex fallback).
    pub async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxHost>, DnsError> {
        let name = fqdn(domain);

        #[cfg(not(test))]
        let mut hosts: Vec<MxHost> = match self.resolver.mx_lookup(&name).await {
            Ok(lookup) => lookup
                .iter()
                .map(|mx| MxHost {
                    host: mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                    preference: mx.preference(),
                })
                .collect(),
            Err(err) if is_not_found(&err) => Vec::new(),
            Err(err) => return Err(DnsError::Lookup(err.to_string())),
        };

        #[cfg(test)]
        let mut hosts: Vec<MxHost> = {
            if let Some(message) = &self.resolver.fail_with {
                return Err(DnsError::Lookup(message.clone()));
            }
            let _ = &name;
            self.resolver
                .mx
                .iter()
                .map(|(host, preference)| MxHost {
                    host: host.clone(),
                    preference: *preference,
                })
                .collect()
        };

        hosts.sort_by_key(|mx| mx.preference);

        if hosts.is_empty() {
            debug!(domain, "no MX records, falling back to apex A record");
            hosts.push(MxHost {
                host: domain.trim_end_matches('.').to_string(),
                preference: 0,
            });
        }

        Ok(hosts)
    }

    /// All TXT strings published at a name. Absence is an empty list, not
    /// an error.
    pub async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let fqdn = fqdn(name);
        trace!(name = %fqdn, "requesting TXT records");

        #[cfg(not(test))]
        {
            match self.resolver.txt_lookup(&fqdn).await {
                Ok(lookup) => Ok(lookup
                    .iter()
                    .map(|txt| {
                        let data: Vec<u8> =
                            txt.txt_data().iter().flat_map(|part| part.iter().copied()).collect();
                        String::from_utf8_lossy(&data).into_owned()
                    })
                    .collect()),
                Err(err) if is_not_found(&err) => Ok(Vec::new()),
                Err(err) => Err(DnsError::Lookup(err.to_string())),
            }
        }

        #[cfg(test)]
        {
            if let Some(message) = &self.resolver.fail_with {
                return Err(DnsError::Lookup(message.clone()));
            }
            Ok(self
                .resolver
                .txt
                .get(fqdn.trim_end_matches('.'))
                .cloned()
                .unwrap_or_default())
        }
    }

    pub async fn lookup_cname(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let fqdn = fqdn(name);

        #[cfg(not(test))]
        {
            match self.resolver.lookup(fqdn, RecordType::CNAME).await {
                Ok(lookup) => Ok(lookup
                    .iter()
                    .filter_map(|rdata| match rdata {
                        RData::CNAME(cname) => {
                            Some(cname.0.to_utf8().trim_end_matches('.').to_string())
                        }
                        _ => None,
                    })
                    .collect()),
                Err(err) if is_not_found(&err) => Ok(Vec::new()),
                Err(err) => Err(DnsError::Lookup(err.to_string())),
            }
        }

        #[cfg(test)]
        {
            if let Some(message) = &self.resolver.fail_with {
                return Err(DnsError::Lookup(message.clone()));
            }
            Ok(self
                .resolver
                .cname
                .get(fqdn.trim_end_matches('.'))
                .cloned()
                .unwrap_or_default())
        }
    }

    pub async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        let fqdn = fqdn(host);

        #[cfg(not(test))]
        {
            match self.resolver.lookup_ip(fqdn).await {
                Ok(lookup) => Ok(lookup.iter().collect()),
                Err(err) if is_not_found(&err) => Ok(Vec::new()),
                Err(err) => Err(DnsError::Lookup(err.to_string())),
            }
        }

        #[cfg(test)]
        {
            if let Some(message) = &self.resolver.fail_with {
                return Err(DnsError::Lookup(message.clone()));
            }
            let _ = fqdn;
            Ok(self.resolver.ips.clone())
        }
    }

    /// The single TXT record at `name` starting with `prefix`, erroring on
    /// absence or conflicting duplicates.
    async fn singular_txt(&self, name: &str, prefix: &str) -> Result<String, VerifyResult> {
        let records = self
            .lookup_txt(name)
            .await
            .map_err(|_| VerifyResult::failed("could not retrieve DNS record", None))?;

        let mut matching = records.into_iter().filter(|r| r.starts_with(prefix));

        let Some(record) = matching.next() else {
            return Err(VerifyResult::failed("record not present", None));
        };

        if matching.next().is_some() {
            return Err(VerifyResult::failed(
                "multiple conflicting DNS records present",
                None,
            ));
        }

        Ok(record)
    }

    pub async fn verify_mx(&self, domain: &str) -> VerifyResult {
        match self.lookup_mx(domain).await {
            Ok(hosts) if hosts.len() == 1 && hosts[0].preference == 0 && hosts[0].host == domain => {
                // apex fallback only works when the name itself resolves
                match self.resolve_ip(domain).await {
                    Ok(ips) if !ips.is_empty() => VerifyResult::info(
                        "no MX records set, mail will use the apex A record",
                        None,
                    ),
                    _ => VerifyResult::failed("no MX records set", None),
                }
            }
            Ok(hosts) => VerifyResult::verified(format!("{} MX record(s) present", hosts.len())),
            Err(_) => VerifyResult::failed("could not retrieve DNS record", None),
        }
    }

    pub async fn verify_spf(&self, domain: &str, spf_include: &str) -> VerifyResult {
        let domain = domain.trim_matches('.');
        let record = match self.singular_txt(domain, "v=spf1").await {
            Ok(record) => record,
            Err(result) => return result,
        };
        trace!(domain, record = %record, "spf record");

        if record == format!("v=spf1 {spf_include} -all") {
            return VerifyResult::verified("correct");
        }

        if !record.split(' ').any(|term| term == spf_include) {
            return VerifyResult::failed(
                format!("SPF record is missing \"{spf_include}\""),
                Some(record),
            );
        }

        let last = record.split(' ').next_back();
        if last != Some("-all") && last != Some("~all") {
            return VerifyResult::failed(
                "SPF record should end with -all (or ~all)",
                Some(record),
            );
        }

        VerifyResult::verified("present")
    }

    pub async fn verify_dkim(
        &self,
        domain: &str,
        selector: &str,
        expected_public_key: &[u8],
    ) -> VerifyResult {
        let domain = domain.trim_matches('.');
        let name = format!("{selector}._domainkey.{domain}");

        let record = match self.singular_txt(&name, "v=DKIM1").await {
            Ok(record) => record,
            Err(result) => return result,
        };
        trace!(domain, record = %record, "dkim record");

        let Some(published) = record
            .split(';')
            .filter_map(|field| field.trim().split_once('='))
            .find(|(key, _)| *key == "p")
            .map(|(_, value)| value.to_string())
        else {
            return VerifyResult::failed("no public key in DKIM record", Some(record));
        };

        let decoded = Base64::decode_vec(&published)
            .or_else(|_| Base64Unpadded::decode_vec(&published));
        let Ok(published) = decoded else {
            return VerifyResult::failed("could not decode DKIM public key", Some(record));
        };

        if published == expected_public_key {
            VerifyResult::verified("present")
        } else {
            VerifyResult::failed("public key in DNS record does not match", Some(record))
        }
    }

    pub async fn verify_dmarc(&self, domain: &str) -> VerifyResult {
        let domain = domain.trim_matches('.');
        let record = match self.singular_txt(&format!("_dmarc.{domain}"), "v=DMARC1").await {
            Ok(record) => record,
            Err(result) => return VerifyResult::info(result.reason, result.value),
        };

        // normalize before comparing policies
        let normalized = record.trim_end_matches(';').replace("; ", ";");
        if normalized.starts_with("v=DMARC1;p=reject") || normalized.starts_with("v=DMARC1;p=quarantine")
        {
            VerifyResult::verified("present")
        } else {
            VerifyResult::info("configured without an enforcing policy", Some(record))
        }
    }

    /// The bounce subdomain must CNAME to the platform's return-path host
    /// so DSNs come back to us.
    pub async fn verify_return_path(&self, name: &str, expected_target: &str) -> VerifyResult {
        match self.lookup_cname(name).await {
            Ok(targets) => {
                if targets
                    .iter()
                    .any(|t| t.trim_end_matches('.') == expected_target.trim_end_matches('.'))
                {
                    VerifyResult::verified("present")
                } else if targets.is_empty() {
                    VerifyResult::failed("no CNAME record set", None)
                } else {
                    VerifyResult::failed(
                        format!("CNAME does not point at {expected_target}"),
                        Some(targets.join(", ")),
                    )
                }
            }
            Err(_) => VerifyResult::failed("could not retrieve DNS record", None),
        }
    }
}

fn fqdn(name: &str) -> String {
    // queries that end with a '.' are fully qualified and cheaper
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

#[cfg(not(test))]
fn is_not_found(err: &hickory_resolver::ResolveError) -> bool {
    use hickory_resolver::{ResolveErrorKind, proto::ProtoErrorKind};

    match err.kind() {
        ResolveErrorKind::Proto(proto) => {
            matches!(proto.kind(), ProtoErrorKind::NoRecordsFound { .. })
        }
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dkim;

    #[tokio::test]
    async fn mx_records_sort_by_preference_keeping_tie_order() {
        let dns = DnsResolver::mock(
            mock::Resolver::default()
                .with_mx("backup.example.net", 20)
                .with_mx("mx-a.example.net", 10)
                .with_mx("mx-b.example.net", 10),
        );

        let hosts = dns.lookup_mx("example.net").await.unwrap();
        assert_eq!(
            hosts,
            vec![
                MxHost { host: "mx-a.example.net".into(), preference: 10 },
                MxHost { host: "mx-b.example.net".into(), preference: 10 },
                MxHost { host: "backup.example.net".into(), preference: 20 },
            ]
        );
    }

    #[tokio::test]
    async fn missing_mx_falls_back_to_apex() {
        let dns = DnsResolver::mock(mock::Resolver::default());

        let hosts = dns.lookup_mx("example.net").await.unwrap();
        assert_eq!(
            hosts,
            vec![MxHost { host: "example.net".into(), preference: 0 }]
        );
    }

    #[tokio::test]
    async fn lookup_errors_propagate() {
        let dns = DnsResolver::mock(mock::Resolver::failing("network unreachable"));
        assert!(dns.lookup_mx("example.net").await.is_err());
        assert!(dns.lookup_txt("example.net").await.is_err());
    }

    #[tokio::test]
    async fn spf_verification_states() {
        let dns = |record: &str| {
            DnsResolver::mock(mock::Resolver::default().with_txt("example.net", record))
        };

        assert!(
            dns("v=spf1 include:spf.sendmill.net -all")
                .verify_spf("example.net", "include:spf.sendmill.net")
                .await
                .passed()
        );

        assert_eq!(
            dns("v=spf1 include:other.net -all")
                .verify_spf("example.net", "include:spf.sendmill.net")
                .await
                .status,
            VerifyStatus::Failed
        );

        assert_eq!(
            dns("v=spf1 include:spf.sendmill.net +all")
                .verify_spf("example.net", "include:spf.sendmill.net")
                .await
                .status,
            VerifyStatus::Failed
        );

        // absent record
        let empty = DnsResolver::mock(mock::Resolver::default());
        assert_eq!(
            empty
                .verify_spf("example.net", "include:spf.sendmill.net")
                .await
                .status,
            VerifyStatus::Failed
        );
    }

    #[tokio::test]
    async fn conflicting_spf_records_fail() {
        let dns = DnsResolver::mock(
            mock::Resolver::default()
                .with_txt("example.net", "v=spf1 include:a -all")
                .with_txt("example.net", "v=spf1 include:b -all"),
        );

        let result = dns
            .verify_spf("example.net", "include:a")
            .await;
        assert_eq!(result.status, VerifyStatus::Failed);
        assert!(result.reason.contains("conflicting"));
    }

    #[tokio::test]
    async fn dkim_verification_compares_published_key() {
        let der = dkim::generate_key(2048).unwrap();
        let record = dkim::dns_record_value(&der).unwrap();

        let dns = DnsResolver::mock(
            mock::Resolver::default().with_txt("sm1._domainkey.example.net", &record),
        );

        let expected = dkim::public_key_der(&der).unwrap();
        assert!(
            dns.verify_dkim("example.net", "sm1", &expected)
                .await
                .passed()
        );

        let other = dkim::generate_key(2048).unwrap();
        let wrong = dkim::public_key_der(&other).unwrap();
        assert!(
            !dns.verify_dkim("example.net", "sm1", &wrong)
                .await
                .passed()
        );
    }

    #[tokio::test]
    async fn dmarc_absent_is_informational() {
        let dns = DnsResolver::mock(mock::Resolver::default());
        assert_eq!(
            dns.verify_dmarc("example.net").await.status,
            VerifyStatus::Info
        );

        let dns = DnsResolver::mock(
            mock::Resolver::default().with_txt("_dmarc.example.net", "v=DMARC1; p=reject"),
        );
        assert!(dns.verify_dmarc("example.net").await.passed());
    }

    #[tokio::test]
    async fn mx_verification_distinguishes_records_from_apex_fallback() {
        let dns = DnsResolver::mock(mock::Resolver::default().with_mx("mx.example.net", 10));
        assert!(dns.verify_mx("example.net").await.passed());

        // no MX and no A record
        let dns = DnsResolver::mock(mock::Resolver::default());
        assert_eq!(dns.verify_mx("example.net").await.status, VerifyStatus::Failed);

        // no MX but the apex resolves
        let mut resolver = mock::Resolver::default();
        resolver.ips = vec!["192.0.2.10".parse().unwrap()];
        let dns = DnsResolver::mock(resolver);
        assert_eq!(dns.verify_mx("example.net").await.status, VerifyStatus::Info);
    }

    #[tokio::test]
    async fn return_path_checks_cname_target() {
        let dns = DnsResolver::mock(
            mock::Resolver::default().with_cname("bounce.example.net", "rp.sendmill.net."),
        );

        assert!(
            dns.verify_return_path("bounce.example.net", "rp.sendmill.net")
                .await
                .passed()
        );
        assert!(
            !dns.verify_return_path("bounce.example.net", "other.sendmill.net")
                .await
                .passed()
        );
    }
}
