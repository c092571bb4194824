//! Local file sources: `/etc/hosts` style files and simple zone files
//! replayed from an in-memory record map.

use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use hickory_proto::rr::rdata::{A, AAAA, CNAME, NS, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::error::{GudgeonError, Result};
use crate::util;

/// Hammered hosts get a small TTL so records stay refreshable.
const FILE_TTL: u32 = 60;
const MAX_CHAIN: usize = 8;

pub struct FileSource {
    name: String,
    /// `(owner, qtype)` keyed by canonical name without the trailing dot.
    records: FxHashMap<(String, RecordType), Vec<Record>>,
    /// Wildcard suffix → rdata for any strict subdomain.
    wildcards: FxHashMap<String, Vec<(RecordType, RData)>>,
}

impl FileSource {
    /// Loads a file, preferring zone format; files yielding no zone
    /// records are parsed as hosts files.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GudgeonError::Load(format!("reading {path:?}: {e}")))?;
        let name = path.display().to_string();
        let zone = Self::from_zonefile_text(&name, &text);
        if !zone.records.is_empty() || !zone.wildcards.is_empty() {
            return Ok(zone);
        }
        Ok(Self::from_hostfile_text(&name, &text))
    }

    pub fn from_hostfile_text(name: &str, text: &str) -> Self {
        let mut source = Self::empty(name);
        for line in text.lines() {
            let line = strip_comment(line);
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }

            if let Ok(ip) = tokens[0].parse::<IpAddr>() {
                for host in &tokens[1..] {
                    source.add_address(host, ip);
                }
            } else if tokens.len() > 1 {
                // no leading address: `target alias1 alias2` declares CNAMEs
                let target = util::canonicalize(tokens[0]);
                for alias in &tokens[1..] {
                    source.add_cname(alias, &target);
                }
            }
        }
        source
    }

    pub fn from_zonefile_text(name: &str, text: &str) -> Self {
        let mut source = Self::empty(name);
        for line in text.lines() {
            let line = strip_comment(line);
            if line.is_empty() || line.starts_with('$') {
                continue;
            }
            if let Some((owner, ttl, rtype, rdata)) = parse_zone_line(line) {
                source.add_record(&owner, ttl, rtype, rdata);
            }
        }
        source
    }

    fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: FxHashMap::default(),
            wildcards: FxHashMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum::<usize>()
            + self.wildcards.values().map(Vec::len).sum::<usize>()
    }

    fn add_address(&mut self, host: &str, ip: IpAddr) {
        let rdata = match ip {
            IpAddr::V4(v4) => RData::A(A::from(v4)),
            IpAddr::V6(v6) => RData::AAAA(AAAA::from(v6)),
        };
        let rtype = rdata.record_type();
        if let Some(suffix) = host.strip_prefix("*.") {
            self.wildcards
                .entry(util::canonicalize(suffix))
                .or_default()
                .push((rtype, rdata));
        } else {
            self.add_record(&util::canonicalize(host), FILE_TTL, rtype, rdata);
        }
    }

    fn add_cname(&mut self, alias: &str, target: &str) {
        let Some(target_name) = fqdn(target) else {
            return;
        };
        self.add_record(
            &util::canonicalize(alias),
            FILE_TTL,
            RecordType::CNAME,
            RData::CNAME(CNAME(target_name)),
        );
    }

    fn add_record(&mut self, owner: &str, ttl: u32, rtype: RecordType, rdata: RData) {
        let Some(owner_name) = fqdn(owner) else {
            warn!("Skipping record with unusable name '{}' in {}", owner, self.name);
            return;
        };
        self.records
            .entry((owner.to_string(), rtype))
            .or_default()
            .push(Record::from_rdata(owner_name, ttl, rdata));
    }

    /// Records answering `(qname, qtype)`, following CNAME chains and
    /// falling back to wildcard entries.
    pub fn lookup(&self, qname: &str, qtype: RecordType) -> Vec<Record> {
        self.resolve(&util::canonicalize(qname), qtype, 0)
    }

    fn resolve(&self, name: &str, qtype: RecordType, depth: usize) -> Vec<Record> {
        if depth > MAX_CHAIN {
            return Vec::new();
        }
        if let Some(records) = self.records.get(&(name.to_string(), qtype)) {
            return records.clone();
        }

        let mut out = Vec::new();
        if qtype != RecordType::CNAME {
            if let Some(cnames) = self.records.get(&(name.to_string(), RecordType::CNAME)) {
                out.extend(cnames.iter().cloned());
                for record in cnames {
                    if let Some(RData::CNAME(target)) = record.data() {
                        let target = util::canonicalize(&target.0.to_string());
                        out.extend(self.resolve(&target, qtype, depth + 1));
                    }
                }
            }
        }
        if !out.is_empty() {
            return out;
        }

        // wildcards match strict subdomains
        for suffix in util::domain_list(name).iter().skip(1) {
            if let Some(entries) = self.wildcards.get(*suffix) {
                let Some(owner) = fqdn(name) else {
                    return out;
                };
                for (rtype, rdata) in entries {
                    if *rtype == qtype {
                        out.push(Record::from_rdata(owner.clone(), FILE_TTL, rdata.clone()));
                    }
                }
                if !out.is_empty() {
                    return out;
                }
            }
        }
        out
    }
}

fn strip_comment(line: &str) -> &str {
    line.split(|c| c == '#' || c == ';')
        .next()
        .unwrap_or_default()
        .trim()
}

fn fqdn(name: &str) -> Option<Name> {
    Name::from_str(&format!("{}.", name.trim_end_matches('.'))).ok()
}

/// `name [ttl] [class] type data`, relative names and directives out of
/// scope.
fn parse_zone_line(line: &str) -> Option<(String, u32, RecordType, RData)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 3 {
        return None;
    }
    let owner = util::canonicalize(tokens[0]);
    let mut idx = 1;

    let ttl = match tokens[idx].parse::<u32>() {
        Ok(ttl) => {
            idx += 1;
            ttl
        }
        Err(_) => FILE_TTL,
    };
    if tokens
        .get(idx)
        .is_some_and(|t| t.eq_ignore_ascii_case("in") || t.eq_ignore_ascii_case("ch"))
    {
        idx += 1;
    }

    let rtype = tokens.get(idx)?;
    let data = tokens.get(idx + 1..)?;
    if data.is_empty() {
        return None;
    }

    let rdata = match rtype.to_ascii_uppercase().as_str() {
        "A" => RData::A(A::from(data[0].parse::<std::net::Ipv4Addr>().ok()?)),
        "AAAA" => RData::AAAA(AAAA::from(data[0].parse::<std::net::Ipv6Addr>().ok()?)),
        "CNAME" => RData::CNAME(CNAME(fqdn(data[0])?)),
        "NS" => RData::NS(NS(fqdn(data[0])?)),
        "TXT" => RData::TXT(TXT::new(vec![data.join(" ")])),
        _ => return None,
    };
    Some((owner, ttl, rdata.record_type(), rdata))
}
