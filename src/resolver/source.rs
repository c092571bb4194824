//! Source variants behind one `answer` operation.

use std::net::IpAddr;
use std::path::Path;

use hickory_proto::op::{Message, MessageType};

use super::dns_source::DnsSource;
use super::file_source::FileSource;
use super::{RequestContext, ResolutionContext, ResolverSet};
use crate::error::Result;

/// A concrete upstream endpoint: a local file replayed from memory, a
/// remote DNS server, or a lazy reference to another resolver.
pub enum Source {
    File(FileSource),
    Dns(DnsSource),
    Named(String),
}

impl Source {
    /// Classifies a specification string the way the config contract
    /// reads: an existing file is a zone or hosts source, an address-like
    /// string is a DNS source, anything else names another resolver.
    pub fn from_spec(spec: &str) -> Result<Self> {
        if Path::new(spec).exists() {
            return Ok(Self::File(FileSource::from_file(Path::new(spec))?));
        }
        if spec.parse::<IpAddr>().is_ok() || spec.contains(':') || spec.contains('/') {
            return Ok(Self::Dns(DnsSource::new(spec)?));
        }
        Ok(Self::Named(spec.to_string()))
    }

    pub fn named(target: &str) -> Self {
        Self::Named(target.to_string())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::File(file) => file.name(),
            Self::Dns(dns) => dns.name(),
            Self::Named(target) => target,
        }
    }

    pub(crate) async fn answer(
        &self,
        set: &ResolverSet,
        rctx: &mut RequestContext,
        resctx: &mut ResolutionContext,
        request: &Message,
    ) -> Result<Option<Message>> {
        match self {
            Self::File(file) => Ok(file_response(file, request)),
            Self::Dns(dns) => dns.answer(request).await,
            Self::Named(target) => set.answer(target, rctx, resctx, request).await,
        }
    }

    pub(crate) async fn close(&self) {
        if let Self::Dns(dns) = self {
            dns.close().await;
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        match self {
            Self::Dns(dns) => dns.worker_count(),
            _ => 0,
        }
    }
}

fn file_response(source: &FileSource, request: &Message) -> Option<Message> {
    let query = request.queries().first()?;
    let records = source.lookup(&query.name().to_string(), query.query_type());
    if records.is_empty() {
        return None;
    }

    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.add_query(query.clone());
    for record in records {
        response.add_answer(record);
    }
    Some(response)
}
