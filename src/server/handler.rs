//! Wire adapter: accepts hickory-server requests, runs them through the
//! engine, logs the outcome and writes the response back.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::{Message, MessageType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::Header;
use hickory_server::server::{Protocol, Request, RequestHandler, ResponseHandler, ResponseInfo};
use tracing::error;

use crate::engine::{ClientProtocol, Engine, ResolutionResult};
use crate::logger::{QueryLogAction, QueryLogEntry, QueryLogger};
use crate::rule::Match;
use crate::stats::StatsCollector;
use crate::util;

#[derive(Clone)]
pub struct DnsHandler {
    engine: Arc<Engine>,
    stats: Arc<StatsCollector>,
    logger: Arc<QueryLogger>,
    /// Address of the listening interface, used for ENDPOINT blocks.
    local_ip: IpAddr,
}

impl DnsHandler {
    pub fn new(
        engine: Arc<Engine>,
        stats: Arc<StatsCollector>,
        logger: Arc<QueryLogger>,
        local_ip: IpAddr,
    ) -> Self {
        Self {
            engine,
            stats,
            logger,
            local_ip,
        }
    }

    fn log_and_count(
        &self,
        client: IpAddr,
        request: &Message,
        response: &Message,
        result: &ResolutionResult,
        elapsed_ms: u64,
    ) {
        let failed = response.response_code()
            == hickory_proto::op::ResponseCode::ServFail
            && !result.blocked;

        let action = if result.blocked {
            self.stats.inc_blocked();
            QueryLogAction::Blocked
        } else if result.cached {
            self.stats.inc_cached();
            QueryLogAction::Cached
        } else if failed {
            self.stats.inc_failed();
            QueryLogAction::Failed
        } else if result.rule_match.is_allow() {
            QueryLogAction::Allowed
        } else {
            QueryLogAction::Forwarded
        };

        if let Some(source) = &result.source {
            self.stats.record_source_latency(source, elapsed_ms);
        }

        let (domain, query_type) = match request.queries().first() {
            Some(query) => (
                util::canonicalize(&query.name().to_string()),
                query.query_type(),
            ),
            None => (String::new(), hickory_proto::rr::RecordType::A),
        };
        let list = match &result.rule_match {
            Match::Allow(Some(rule_ref)) | Match::Block(Some(rule_ref)) => {
                Some(rule_ref.list.clone())
            }
            _ => None,
        };

        self.logger.log(QueryLogEntry {
            client_ip: client,
            consumer: result.consumer.clone(),
            domain: domain.into(),
            query_type,
            action,
            list,
            resolver: result.resolver.clone(),
            source: result.source.clone(),
            latency_ms: elapsed_ms,
        });
    }
}

#[async_trait::async_trait]
impl RequestHandler for DnsHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        self.stats.inc_queries();
        let start = Instant::now();
        let client = request.src().ip();
        let protocol = match request.protocol() {
            Protocol::Tcp => ClientProtocol::Tcp,
            _ => ClientProtocol::Udp,
        };

        // rebuild the wire message for the engine
        let mut message = Message::new();
        message.set_id(request.header().id());
        message.set_op_code(request.header().op_code());
        message.set_message_type(MessageType::Query);
        message.set_recursion_desired(request.header().recursion_desired());
        message.add_query(request.query().original().clone());

        let (response, result) = self
            .engine
            .handle(client, self.local_ip, protocol, &message)
            .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.log_and_count(client, &message, &response, &result, elapsed_ms);

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(false);
        header.set_recursion_available(true);
        header.set_response_code(response.response_code());

        let builder = MessageResponseBuilder::from_message_request(request);
        let message_response = builder.build(
            header,
            response.answers(),
            response.name_servers(),
            &[],
            response.additionals(),
        );
        match response_handle.send_response(message_response).await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to send response: {}", e);
                ResponseInfo::from(header)
            }
        }
    }
}
