//! Engine: the top-level dispatcher composing consumer → group → rule
//! store → cache → resolver for every inbound query.
//!
//! The engine is a single long-lived object owning all pipeline state.
//! Everything is frozen after construction except the source worker
//! pools, the cache and the shutdown flag.

pub mod matcher;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{info, warn};

pub use self::matcher::AddressMatcher;
use crate::cache::QueryCache;
use crate::config::{BlockResponse, Config};
use crate::error::{GudgeonError, Result};
use crate::resolver::{RequestContext, ResolutionContext, ResolverSet};
use crate::rule::{self, ListMeta, Match, Rule, RuleKind, RuleStore};
use crate::util;

const DEFAULT_GROUP: &str = "default";

/// Transport the query arrived on, recorded per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProtocol {
    Udp,
    Tcp,
}

impl ClientProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

/// Per-query metadata handed back with every response, consumed by the
/// query log and stats.
#[derive(Debug, Clone)]
pub struct ResolutionResult {
    pub consumer: String,
    pub protocol: ClientProtocol,
    /// Group that blocked, answered from cache, or produced the answer.
    pub group: Option<String>,
    pub rule_match: Match,
    pub blocked: bool,
    pub cached: bool,
    pub resolver: Option<String>,
    pub source: Option<String>,
    /// Source failures along the way; never surfaced to the client.
    pub errors: Vec<String>,
}

impl Default for ResolutionResult {
    fn default() -> Self {
        Self {
            consumer: DEFAULT_GROUP.to_string(),
            protocol: ClientProtocol::Udp,
            group: None,
            rule_match: Match::None,
            blocked: false,
            cached: false,
            resolver: None,
            source: None,
            errors: Vec::new(),
        }
    }
}

struct ActiveConsumer {
    name: String,
    groups: Vec<String>,
    matchers: Vec<AddressMatcher>,
    block: bool,
}

struct ActiveGroup {
    resolvers: Vec<String>,
    block_response: BlockResponse,
}

pub struct Engine {
    consumers: Vec<ActiveConsumer>,
    groups: FxHashMap<String, ActiveGroup>,
    group_order: Vec<String>,
    store: Box<dyn RuleStore>,
    cache: Option<QueryCache>,
    resolvers: ResolverSet,
    default_block: BlockResponse,
    shutdown: AtomicBool,
}

impl Engine {
    /// Builds the full pipeline from configuration: loads every list from
    /// disk into the rule store, wires groups to resolvers and consumers
    /// to groups. List read failures are fatal to that list only; store
    /// and configuration failures abort construction.
    pub fn from_config(config: &Config) -> Result<Self> {
        let default_block: BlockResponse = config
            .global
            .block_response
            .parse()
            .map_err(|e| GudgeonError::Config(format!("{e:#}")))?;

        let rules_db = config.home.join("data").join("rules.db");
        let mut store = rule::create_store(&config.storage.rules, Some(&rules_db))?;

        // inject the implicit default group
        let mut working_groups = config.groups.clone();
        if !working_groups.iter().any(|g| g.name == DEFAULT_GROUP) {
            working_groups.push(crate::config::GroupConfig {
                name: DEFAULT_GROUP.to_string(),
                resolvers: Vec::new(),
                lists: Vec::new(),
                tags: vec![DEFAULT_GROUP.to_string()],
                block_response: None,
            });
        }

        let mut groups = FxHashMap::default();
        let mut group_order = Vec::new();
        for group in &working_groups {
            // lists are assigned by name or by tag
            let assigned = config.lists.iter().filter(|list| {
                group.lists.contains(&list.name)
                    || list.tags.iter().any(|tag| group.tags.contains(tag))
            });

            for list in assigned {
                let path = list.path(&group.name, &config.home);
                let kind = RuleKind::parse(&list.kind);
                let text = match std::fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(e) => {
                        // the engine continues without this list
                        warn!("Skipping list '{}' for group '{}': {}", list.name, group.name, e);
                        continue;
                    }
                };
                let rules: Vec<Rule> = text
                    .lines()
                    .filter_map(|line| Rule::parse(line, kind))
                    .collect();
                let meta = ListMeta {
                    canonical: list.canonical_name(&group.name),
                    kind,
                    path: Some(path),
                };
                let loaded = store.load(&group.name, &rules, &meta)?;
                info!(
                    "Loaded {} rules from list '{}' into group '{}'",
                    loaded, meta.canonical, group.name
                );
            }

            let resolvers = if group.resolvers.is_empty() {
                vec![DEFAULT_GROUP.to_string()]
            } else {
                group.resolvers.clone()
            };
            let block_response = config
                .block_response_for(group)
                .map_err(|e| GudgeonError::Config(format!("{e:#}")))?;
            groups.insert(
                group.name.clone(),
                ActiveGroup {
                    resolvers,
                    block_response,
                },
            );
            group_order.push(group.name.clone());
        }

        let mut consumers = Vec::with_capacity(config.consumers.len());
        for consumer in &config.consumers {
            let mut matchers = consumer
                .matches
                .iter()
                .map(AddressMatcher::from_config)
                .collect::<Result<Vec<_>>>()?;
            // exact ip > range > cidr within one consumer
            matchers.sort_by_key(AddressMatcher::specificity);

            let mut consumer_groups = consumer.groups.clone();
            if !consumer_groups.iter().any(|g| g == DEFAULT_GROUP) {
                consumer_groups.push(DEFAULT_GROUP.to_string());
            }
            consumers.push(ActiveConsumer {
                name: consumer.name.clone(),
                groups: consumer_groups,
                matchers,
                block: consumer.block,
            });
        }

        let resolvers = ResolverSet::from_config(config)?;

        let cache = config.storage.cache.then(|| {
            QueryCache::new(
                group_order.iter().map(String::as_str),
                config.storage.cache_entries,
                config.global.min_ttl,
                config.global.max_ttl,
            )
        });

        Ok(Self {
            consumers,
            groups,
            group_order,
            store,
            cache,
            resolvers,
            default_block,
            shutdown: AtomicBool::new(false),
        })
    }

    /// First matching consumer in declaration order, or the implicit
    /// default consumer scoped to the default group.
    fn classify(&self, client: IpAddr) -> (&str, Vec<String>, bool) {
        for consumer in &self.consumers {
            if consumer.matchers.iter().any(|m| m.matches(client)) {
                return (consumer.name.as_str(), consumer.groups.clone(), consumer.block);
            }
        }
        (DEFAULT_GROUP, vec![DEFAULT_GROUP.to_string()], false)
    }

    /// Convenience membership check mirroring the handle path.
    pub fn is_domain_blocked(&self, client: IpAddr, domain: &str) -> bool {
        let (_, groups, block) = self.classify(client);
        if block {
            return true;
        }
        self.store
            .is_match_any(&groups, &util::canonicalize(domain))
            .is_block()
    }

    /// Answers one inbound query. Wire-level failures are surfaced as a
    /// SERVFAIL rcode, never as an error.
    pub async fn handle(
        &self,
        client: IpAddr,
        local: IpAddr,
        protocol: ClientProtocol,
        request: &Message,
    ) -> (Message, ResolutionResult) {
        let mut result = ResolutionResult {
            protocol,
            ..ResolutionResult::default()
        };

        if self.shutdown.load(Ordering::SeqCst) {
            return (response_template(request, ResponseCode::ServFail), result);
        }
        let Some(query) = request.queries().first().cloned() else {
            return (response_template(request, ResponseCode::ServFail), result);
        };

        // 1. classify the client
        let (consumer_name, groups, consumer_blocked) = self.classify(client);
        result.consumer = consumer_name.to_string();
        if consumer_blocked {
            result.blocked = true;
            let response = self.blocked_response(request, self.default_block, local);
            return (response, result);
        }

        // 3. rule check, authoritative before the cache so blocked
        // answers are never cached
        let domain = util::canonicalize(&query.name().to_string());
        let rule_match = self.store.is_match_any(&groups, &domain);
        result.rule_match = rule_match.clone();
        let allowed = match rule_match {
            Match::Block(_) => {
                result.blocked = true;
                let group = groups.first().map(String::as_str).unwrap_or(DEFAULT_GROUP);
                result.group = Some(group.to_string());
                let policy = self
                    .groups
                    .get(group)
                    .map(|g| g.block_response)
                    .unwrap_or(self.default_block);
                return (self.blocked_response(request, policy, local), result);
            }
            Match::Allow(_) => true,
            Match::None => false,
        };

        // 4. cache check per group; allow-flagged queries go straight to
        // the resolvers
        if !allowed {
            if let Some(cache) = &self.cache {
                for group in &groups {
                    if let Some(response) = cache.query(group, request).await {
                        result.cached = true;
                        result.group = Some(group.clone());
                        return (finalize(response, request), result);
                    }
                }
            }
        }

        // 5. walk each group's resolvers until one yields an answer
        let mut rctx = RequestContext::new();
        let mut resctx = ResolutionContext::default();
        let mut answered: Option<(String, Message)> = None;
        let mut invoked: FxHashSet<&str> = FxHashSet::default();

        'groups: for group_name in &groups {
            let Some(group) = self.groups.get(group_name) else {
                continue;
            };
            for resolver_name in &group.resolvers {
                if !invoked.insert(resolver_name.as_str()) {
                    continue;
                }
                match self
                    .resolvers
                    .answer(resolver_name, &mut rctx, &mut resctx, request)
                    .await
                {
                    Ok(Some(response)) if !util::is_empty_response(&response) => {
                        answered = Some((group_name.clone(), response));
                        break 'groups;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(
                            "Resolver '{}' failed for '{}': {}",
                            resolver_name, domain, e
                        );
                        resctx.errors.push(format!("{resolver_name}: {e}"));
                    }
                }
            }
        }

        result.resolver = resctx.resolver.clone();
        result.source = resctx.source.clone();
        result.errors = resctx.errors;

        // 6. store and return
        match answered {
            Some((group, response)) => {
                if let Some(cache) = &self.cache {
                    cache.store(&group, request, &response).await;
                }
                result.group = Some(group);
                (finalize(response, request), result)
            }
            None => (response_template(request, ResponseCode::ServFail), result),
        }
    }

    fn blocked_response(
        &self,
        request: &Message,
        policy: BlockResponse,
        local: IpAddr,
    ) -> Message {
        let qtype = request
            .queries()
            .first()
            .map(|q| q.query_type())
            .unwrap_or(RecordType::A);

        let ip = match policy {
            BlockResponse::NxDomain => {
                return response_template(request, ResponseCode::NXDomain);
            }
            BlockResponse::Endpoint => local,
            BlockResponse::Literal(ip) => ip,
        };

        let mut response = response_template(request, ResponseCode::NoError);
        let rdata = match (qtype, ip) {
            (RecordType::A, IpAddr::V4(v4)) => Some(RData::A(A::from(v4))),
            (RecordType::AAAA, IpAddr::V6(v6)) => Some(RData::AAAA(AAAA::from(v6))),
            _ => None,
        };
        if let (Some(rdata), Some(query)) = (rdata, request.queries().first()) {
            response.add_answer(Record::from_rdata(query.name().clone(), 0, rdata));
        }
        response
    }

    /// Flips the shutdown flag and drains every source worker pool.
    /// Queries arriving afterwards get SERVFAIL.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.resolvers.close().await;
        info!("Engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Live upstream workers across all sources.
    pub fn worker_count(&self) -> usize {
        self.resolvers.worker_count()
    }

    pub fn group_names(&self) -> &[String] {
        &self.group_order
    }
}

fn response_template(request: &Message, rcode: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(rcode);
    if let Some(query) = request.queries().first() {
        response.add_query(query.clone());
    }
    response
}

/// Pins the response to the request: id, RD bit, RA=1.
fn finalize(mut response: Message, request: &Message) -> Message {
    response.set_id(request.id());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response
}
