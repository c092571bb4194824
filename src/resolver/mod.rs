//! Resolver graph: named resolvers composed of ordered (or balanced)
//! sources, scoped by domain globs and search suffixes. Named sources
//! reference other resolvers lazily; a visited set carried in the
//! request context breaks reference cycles at query time.

pub mod dns_source;
pub mod file_source;
pub mod source;

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::Name;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

pub use self::source::Source;
use crate::config::Config;
use crate::error::{GudgeonError, Result};
use crate::util;

/// Per-query state threaded through the resolver graph.
#[derive(Debug, Default)]
pub struct RequestContext {
    visited: FxHashSet<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a resolver as visited; false when it was already entered
    /// within this request.
    fn enter(&mut self, resolver: &str) -> bool {
        self.visited.insert(resolver.to_string())
    }
}

/// Resolution metadata accumulated while answering one request.
#[derive(Debug, Default, Clone)]
pub struct ResolutionContext {
    /// Innermost resolver that produced the answer.
    pub resolver: Option<String>,
    /// Source that produced the answer.
    pub source: Option<String>,
    /// Source failures encountered along the way; hidden from the client.
    pub errors: Vec<String>,
}

pub struct Resolver {
    name: String,
    sources: Vec<Source>,
    domains: Vec<String>,
    search: Vec<String>,
    balance: bool,
    rotation: AtomicUsize,
}

impl Resolver {
    async fn answer(
        &self,
        set: &ResolverSet,
        rctx: &mut RequestContext,
        resctx: &mut ResolutionContext,
        request: &Message,
    ) -> Result<Option<Message>> {
        let Some(query) = request.queries().first() else {
            return Ok(None);
        };
        let qname = util::canonicalize(&query.name().to_string());

        // scoped resolvers skip non-matching names without failing
        if !self.domains.is_empty()
            && !self.domains.iter().any(|g| util::glob_matches(g, &qname))
        {
            return Ok(None);
        }

        if let Some(response) = self.query_sources(set, rctx, resctx, request).await? {
            return Ok(Some(response));
        }

        // single-label names retry with each search suffix appended
        if !self.search.is_empty() && util::is_single_label(&qname) {
            for suffix in &self.search {
                let expanded = format!("{}.{}", qname, suffix.trim_matches('.'));
                let Some(retry) = rewrite_query(request, &expanded) else {
                    continue;
                };
                if let Some(response) =
                    self.query_sources(set, rctx, resctx, &retry).await?
                {
                    return Ok(Some(restore_query(&response, request, &expanded)));
                }
            }
        }
        Ok(None)
    }

    /// Walks sources in declared order, or from a rotating start index
    /// when balancing. The first non-empty response wins; errors are
    /// captured and the walk continues.
    async fn query_sources(
        &self,
        set: &ResolverSet,
        rctx: &mut RequestContext,
        resctx: &mut ResolutionContext,
        request: &Message,
    ) -> Result<Option<Message>> {
        let count = self.sources.len();
        if count == 0 {
            return Ok(None);
        }
        let start = if self.balance {
            self.rotation.fetch_add(1, Ordering::Relaxed) % count
        } else {
            0
        };

        for offset in 0..count {
            let source = &self.sources[(start + offset) % count];
            match source.answer(set, rctx, resctx, request).await {
                Ok(Some(response)) if !util::is_empty_response(&response) => {
                    if resctx.source.is_none() {
                        resctx.source = Some(source.name().to_string());
                    }
                    return Ok(Some(response));
                }
                Ok(_) => {}
                Err(e @ GudgeonError::CycleDetected(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        "Source '{}' failed in resolver '{}': {}",
                        source.name(),
                        self.name,
                        e
                    );
                    resctx.errors.push(format!("{}: {}", source.name(), e));
                }
            }
        }
        Ok(None)
    }
}

/// All configured resolvers by name. Entries under `sources` in the
/// configuration become resolvers as well, so resolvers can reference
/// them like any other named target.
pub struct ResolverSet {
    resolvers: FxHashMap<String, Resolver>,
}

impl ResolverSet {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut resolvers = FxHashMap::default();

        for bundle in &config.sources {
            let sources = bundle
                .spec
                .iter()
                .map(|spec| Source::from_spec(spec))
                .collect::<Result<Vec<_>>>()?;
            resolvers.insert(
                bundle.name.clone(),
                Resolver {
                    name: bundle.name.clone(),
                    sources,
                    domains: Vec::new(),
                    search: Vec::new(),
                    balance: bundle.balance,
                    rotation: AtomicUsize::new(0),
                },
            );
        }

        for rc in &config.resolvers {
            let mut sources = Vec::new();
            for host in &rc.hosts {
                sources.push(Source::from_spec(host)?);
            }
            for target in &rc.sources {
                sources.push(Source::named(target));
            }
            if resolvers.contains_key(&rc.name) {
                warn!(
                    "Resolver '{}' overrides a source bundle of the same name",
                    rc.name
                );
            }
            resolvers.insert(
                rc.name.clone(),
                Resolver {
                    name: rc.name.clone(),
                    sources,
                    domains: rc.domains.clone(),
                    search: rc.search.clone(),
                    balance: rc.balance,
                    rotation: AtomicUsize::new(0),
                },
            );
        }

        Ok(Self { resolvers })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }

    /// Answers through the named resolver. Boxed because named sources
    /// re-enter this method while resolving references.
    pub fn answer<'a>(
        &'a self,
        name: &'a str,
        rctx: &'a mut RequestContext,
        resctx: &'a mut ResolutionContext,
        request: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Message>>> + Send + 'a>> {
        Box::pin(async move {
            let Some(resolver) = self.resolvers.get(name) else {
                debug!("No resolver named '{}'", name);
                return Ok(None);
            };
            if !rctx.enter(name) {
                return Err(GudgeonError::CycleDetected(name.to_string()));
            }
            let response = resolver.answer(self, rctx, resctx, request).await?;
            if response
                .as_ref()
                .is_some_and(|r| !util::is_empty_response(r))
                && resctx.resolver.is_none()
            {
                resctx.resolver = Some(name.to_string());
            }
            Ok(response)
        })
    }

    /// Closes every dns source, draining their worker pools.
    pub async fn close(&self) {
        for resolver in self.resolvers.values() {
            for source in &resolver.sources {
                source.close().await;
            }
        }
    }

    /// Live workers across all dns sources.
    pub fn worker_count(&self) -> usize {
        self.resolvers
            .values()
            .flat_map(|r| r.sources.iter())
            .map(Source::worker_count)
            .sum()
    }
}

fn rewrite_query(request: &Message, expanded: &str) -> Option<Message> {
    let original = request.queries().first()?;
    let name = Name::from_str(&format!("{}.", expanded.trim_end_matches('.'))).ok()?;
    let mut query = Query::query(name, original.query_type());
    query.set_query_class(original.query_class());

    let mut message = Message::new();
    message.set_id(request.id());
    message.set_op_code(request.op_code());
    message.set_message_type(MessageType::Query);
    message.set_recursion_desired(request.recursion_desired());
    message.add_query(query);
    Some(message)
}

/// Rewrites a search-suffix response so the question and answer owner
/// names match the original single-label query. The CNAME chain inside
/// the answer is preserved untouched.
fn restore_query(response: &Message, request: &Message, expanded: &str) -> Message {
    let Some(original) = request.queries().first() else {
        return response.clone();
    };
    let Ok(expanded_name) = Name::from_str(&format!("{}.", expanded.trim_end_matches('.'))) else {
        return response.clone();
    };
    let original_name = original.name().clone();

    let mut out = Message::new();
    out.set_id(request.id());
    out.set_message_type(MessageType::Response);
    out.set_op_code(response.op_code());
    out.set_response_code(response.response_code());
    out.set_recursion_desired(request.recursion_desired());
    out.set_recursion_available(true);
    out.add_query(original.clone());
    for record in response.answers() {
        let mut record = record.clone();
        if record.name() == &expanded_name {
            record.set_name(original_name.clone());
        }
        out.add_answer(record);
    }
    for record in response.name_servers() {
        out.add_name_server(record.clone());
    }
    for record in response.additionals() {
        out.add_additional(record.clone());
    }
    out
}
