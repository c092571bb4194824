//! End-to-end scenarios through a fully constructed engine: blocking,
//! allow precedence, caching, failover, block response variants and
//! shutdown behavior.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tempfile::TempDir;
use tokio::net::UdpSocket;

use gudgeon::config::{
    Config, ConsumerConfig, GroupConfig, ListConfig, MatchConfig, ResolverConfig,
};
use gudgeon::engine::{ClientProtocol, Engine};

const CLIENT: &str = "10.0.0.30";
const LOCAL: &str = "192.168.1.1";

fn write_file(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path.to_str().unwrap().to_string()
}

fn query(name: &str, qtype: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(0x5757);
    message.set_recursion_desired(true);
    message.add_query(hickory_proto::op::Query::query(
        Name::from_str(name).unwrap(),
        qtype,
    ));
    message
}

fn list(name: &str, kind: &str, src: &str) -> ListConfig {
    ListConfig {
        name: name.to_string(),
        kind: kind.to_string(),
        src: src.to_string(),
        tags: vec![],
    }
}

fn group(name: &str, lists: Vec<&str>, block_response: Option<&str>) -> GroupConfig {
    GroupConfig {
        name: name.to_string(),
        resolvers: vec!["default".to_string()],
        lists: lists.into_iter().map(String::from).collect(),
        tags: vec![],
        block_response: block_response.map(String::from),
    }
}

fn consumer(name: &str, ip: &str, groups: Vec<&str>, block: bool) -> ConsumerConfig {
    ConsumerConfig {
        name: name.to_string(),
        groups: groups.into_iter().map(String::from).collect(),
        matches: vec![MatchConfig {
            ip: Some(ip.to_string()),
            ..MatchConfig::default()
        }],
        block,
    }
}

fn resolver(name: &str, hosts: Vec<String>) -> ResolverConfig {
    ResolverConfig {
        name: name.to_string(),
        hosts,
        sources: vec![],
        domains: vec![],
        search: vec![],
        balance: false,
    }
}

fn client_ip() -> IpAddr {
    CLIENT.parse().unwrap()
}

fn local_ip() -> IpAddr {
    LOCAL.parse().unwrap()
}

async fn handle(engine: &Engine, request: &Message) -> (Message, gudgeon::engine::ResolutionResult) {
    engine
        .handle(client_ip(), local_ip(), ClientProtocol::Udp, request)
        .await
}

/// Local upstream answering every A query with a fixed address at the
/// given TTL.
async fn spawn_upstream(ttl: u32) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            let request = Message::from_vec(&buf[..len]).unwrap();
            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.set_recursion_available(true);
            if let Some(query) = request.queries().first() {
                let name = query.name().clone();
                response.add_query(query.clone());
                response.add_answer(Record::from_rdata(
                    name,
                    ttl,
                    RData::A(A::new(198, 51, 100, 5)),
                ));
            }
            let _ = socket.send_to(&response.to_vec().unwrap(), peer).await;
        }
    });
    addr
}

#[tokio::test]
async fn test_block_by_exact_rule() {
    let tmp = TempDir::new().unwrap();
    let ads = write_file(tmp.path(), "ads.list", "ads.example\n");
    let hosts = write_file(tmp.path(), "hosts", "198.51.100.9 upstream.example\n");

    let config = Config {
        home: tmp.path().to_path_buf(),
        lists: vec![list("ads", "block", &ads)],
        groups: vec![group("default", vec!["ads"], None)],
        consumers: vec![consumer("lan", CLIENT, vec!["default"], false)],
        resolvers: vec![resolver("default", vec![hosts])],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    let request = query("ads.example.", RecordType::A);
    let (response, result) = handle(&engine, &request).await;

    assert_eq!(response.response_code(), ResponseCode::NXDomain);
    assert!(response.answers().is_empty());
    assert!(result.blocked);
    assert_eq!(result.consumer, "lan");
    // round trip: id and question preserved
    assert_eq!(response.id(), request.id());
    assert_eq!(
        response.queries().first().unwrap(),
        request.queries().first().unwrap()
    );
}

#[tokio::test]
async fn test_allow_overrides_block() {
    let tmp = TempDir::new().unwrap();
    let blocked = write_file(tmp.path(), "ads.list", "ads.example\n");
    let allowed = write_file(tmp.path(), "safe.list", "safe.ads.example\n");
    let hosts = write_file(tmp.path(), "hosts", "198.51.100.10 safe.ads.example\n");

    let config = Config {
        home: tmp.path().to_path_buf(),
        lists: vec![list("ads", "block", &blocked), list("safe", "allow", &allowed)],
        groups: vec![group("default", vec!["ads", "safe"], None)],
        consumers: vec![consumer("lan", CLIENT, vec!["default"], false)],
        resolvers: vec![resolver("default", vec![hosts])],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    let (response, result) = handle(&engine, &query("safe.ads.example.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(!response.answers().is_empty());
    assert!(!result.blocked);
    assert!(result.rule_match.is_allow());

    // the sibling subdomain is still blocked
    let (response, result) = handle(&engine, &query("other.ads.example.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::NXDomain);
    assert!(result.blocked);
}

#[tokio::test]
async fn test_wildcard_blocks_subdomains_only() {
    let tmp = TempDir::new().unwrap();
    let trackers = write_file(tmp.path(), "trackers.list", "*.tracker.example\n");
    let hosts = write_file(tmp.path(), "hosts", "198.51.100.11 tracker.example\n");

    let config = Config {
        home: tmp.path().to_path_buf(),
        lists: vec![list("trackers", "block", &trackers)],
        groups: vec![group("default", vec!["trackers"], None)],
        consumers: vec![consumer("lan", CLIENT, vec!["default"], false)],
        resolvers: vec![resolver("default", vec![hosts])],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    let (response, result) = handle(&engine, &query("pixel.tracker.example.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::NXDomain);
    assert!(result.blocked);

    // the bare suffix resolves upstream
    let (response, result) = handle(&engine, &query("tracker.example.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(!response.answers().is_empty());
    assert!(!result.blocked);
}

#[tokio::test]
async fn test_case_insensitive_blocking() {
    let tmp = TempDir::new().unwrap();
    let ads = write_file(tmp.path(), "ads.list", "ads.example\n");
    let hosts = write_file(tmp.path(), "hosts", "198.51.100.9 upstream.example\n");

    let config = Config {
        home: tmp.path().to_path_buf(),
        lists: vec![list("ads", "block", &ads)],
        groups: vec![group("default", vec!["ads"], None)],
        consumers: vec![],
        resolvers: vec![resolver("default", vec![hosts])],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    let (response, _) = handle(&engine, &query("AdS.ExAmPlE.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn test_cache_hit_decrements_ttl() {
    let tmp = TempDir::new().unwrap();
    let upstream = spawn_upstream(120).await;

    let config = Config {
        home: tmp.path().to_path_buf(),
        groups: vec![group("default", vec![], None)],
        consumers: vec![],
        resolvers: vec![resolver("default", vec![upstream.to_string()])],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    let request = query("example.com.", RecordType::A);
    let (first, result) = handle(&engine, &request).await;
    assert!(!result.cached);
    assert_eq!(first.answers()[0].ttl(), 120);

    let mut second_request = query("example.com.", RecordType::A);
    second_request.set_id(0x1111);
    let (second, result) = handle(&engine, &second_request).await;
    assert!(result.cached);
    assert_eq!(second.id(), 0x1111);
    let ttl = second.answers()[0].ttl();
    assert!(ttl <= 120 && ttl >= 118, "ttl {ttl} not decremented from 120");
}

#[tokio::test]
async fn test_cache_entry_expires() {
    let tmp = TempDir::new().unwrap();
    let upstream = spawn_upstream(1).await;

    let config = Config {
        home: tmp.path().to_path_buf(),
        groups: vec![group("default", vec![], None)],
        consumers: vec![],
        resolvers: vec![resolver("default", vec![upstream.to_string()])],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    let request = query("short.example.", RecordType::A);
    let (_, result) = handle(&engine, &request).await;
    assert!(!result.cached);

    let (_, result) = handle(&engine, &request).await;
    assert!(result.cached, "entry should be served within its ttl");

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let (_, result) = handle(&engine, &request).await;
    assert!(!result.cached, "expired entry must miss");
}

#[tokio::test]
async fn test_source_failover_records_answering_source() {
    let tmp = TempDir::new().unwrap();
    let upstream = spawn_upstream(60).await;

    // first source is unreachable, second answers
    let config = Config {
        home: tmp.path().to_path_buf(),
        groups: vec![group("default", vec![], None)],
        consumers: vec![],
        resolvers: vec![resolver(
            "default",
            vec!["127.0.0.1:1/tcp".to_string(), upstream.to_string()],
        )],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    let (response, result) = handle(&engine, &query("failover.example.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(!response.answers().is_empty());
    assert_eq!(result.source.as_deref(), Some(upstream.to_string().as_str()));
    assert!(!result.errors.is_empty(), "dead source failure is captured");
}

#[tokio::test]
async fn test_endpoint_block_response() {
    let tmp = TempDir::new().unwrap();
    let ads = write_file(tmp.path(), "ads.list", "ads.example\n");
    let hosts = write_file(tmp.path(), "hosts", "198.51.100.9 upstream.example\n");

    let config = Config {
        home: tmp.path().to_path_buf(),
        lists: vec![list("ads", "block", &ads)],
        groups: vec![group("default", vec!["ads"], Some("endpoint"))],
        consumers: vec![],
        resolvers: vec![resolver("default", vec![hosts])],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    let (response, result) = handle(&engine, &query("ads.example.", RecordType::A)).await;
    assert!(result.blocked);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    let answers = response.answers();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].ttl(), 0);
    assert_eq!(
        answers[0].data(),
        Some(&RData::A(A::from("192.168.1.1".parse::<std::net::Ipv4Addr>().unwrap())))
    );
}

#[tokio::test]
async fn test_literal_block_response() {
    let tmp = TempDir::new().unwrap();
    let ads = write_file(tmp.path(), "ads.list", "ads.example\n");

    let config = Config {
        home: tmp.path().to_path_buf(),
        lists: vec![list("ads", "block", &ads)],
        groups: vec![group("default", vec!["ads"], Some("0.0.0.0"))],
        consumers: vec![],
        resolvers: vec![],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    let (response, _) = handle(&engine, &query("ads.example.", RecordType::A)).await;
    assert_eq!(response.answers().len(), 1);
    assert_eq!(response.answers()[0].ttl(), 0);
    assert_eq!(
        response.answers()[0].data(),
        Some(&RData::A(A::new(0, 0, 0, 0)))
    );
}

#[tokio::test]
async fn test_blocked_consumer_short_circuits() {
    let tmp = TempDir::new().unwrap();
    let hosts = write_file(tmp.path(), "hosts", "198.51.100.9 anything.example\n");

    let config = Config {
        home: tmp.path().to_path_buf(),
        groups: vec![group("default", vec![], None)],
        consumers: vec![consumer("banned", CLIENT, vec!["default"], true)],
        resolvers: vec![resolver("default", vec![hosts])],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    let (response, result) = handle(&engine, &query("anything.example.", RecordType::A)).await;
    assert!(result.blocked);
    assert_eq!(result.consumer, "banned");
    assert_eq!(response.response_code(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn test_unmatched_client_uses_default_group() {
    let tmp = TempDir::new().unwrap();
    let kids_list = write_file(tmp.path(), "kids.list", "games.example\n");
    let hosts = write_file(tmp.path(), "hosts", "198.51.100.9 games.example\n");

    // the blocking list only applies to the kids consumer at 10.0.0.99
    let config = Config {
        home: tmp.path().to_path_buf(),
        lists: vec![list("games", "block", &kids_list)],
        groups: vec![
            GroupConfig {
                name: "kids".to_string(),
                resolvers: vec!["default".to_string()],
                lists: vec!["games".to_string()],
                tags: vec![],
                block_response: None,
            },
            group("default", vec![], None),
        ],
        consumers: vec![consumer("kids", "10.0.0.99", vec!["kids"], false)],
        resolvers: vec![resolver("default", vec![hosts])],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    // matched client is blocked through the kids group
    let (response, _) = engine
        .handle(
            "10.0.0.99".parse().unwrap(),
            local_ip(),
            ClientProtocol::Udp,
            &query("games.example.", RecordType::A),
        )
        .await;
    assert_eq!(response.response_code(), ResponseCode::NXDomain);

    // any other client falls to the default consumer and resolves
    let (response, result) = handle(&engine, &query("games.example.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(result.consumer, "default");
}

#[tokio::test]
async fn test_all_paths_exhausted_yields_servfail() {
    let tmp = TempDir::new().unwrap();

    let config = Config {
        home: tmp.path().to_path_buf(),
        groups: vec![group("default", vec![], None)],
        consumers: vec![],
        resolvers: vec![resolver("default", vec!["127.0.0.1:1/tcp".to_string()])],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    let request = query("unreachable.example.", RecordType::A);
    let (response, result) = handle(&engine, &request).await;
    assert_eq!(response.response_code(), ResponseCode::ServFail);
    assert_eq!(response.id(), request.id());
    assert!(!result.blocked);
}

#[tokio::test]
async fn test_shutdown_stops_responses_and_workers() {
    let tmp = TempDir::new().unwrap();
    let upstream = spawn_upstream(60).await;

    let config = Config {
        home: tmp.path().to_path_buf(),
        groups: vec![group("default", vec![], None)],
        consumers: vec![],
        resolvers: vec![resolver("default", vec![upstream.to_string()])],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    let (response, _) = handle(&engine, &query("pre.example.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);

    engine.shutdown().await;
    assert!(engine.is_shut_down());
    assert_eq!(engine.worker_count(), 0);

    let (response, result) = handle(&engine, &query("post.example.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::ServFail);
    assert!(result.source.is_none());
}

#[tokio::test]
async fn test_is_domain_blocked_convenience() {
    let tmp = TempDir::new().unwrap();
    let ads = write_file(tmp.path(), "ads.list", "ads.example\n");

    let config = Config {
        home: tmp.path().to_path_buf(),
        lists: vec![list("ads", "block", &ads)],
        groups: vec![group("default", vec!["ads"], None)],
        consumers: vec![],
        resolvers: vec![],
        ..Config::default()
    };
    let engine = Engine::from_config(&config).unwrap();

    assert!(engine.is_domain_blocked(client_ip(), "ads.example."));
    assert!(engine.is_domain_blocked(client_ip(), "sub.ads.example"));
    assert!(!engine.is_domain_blocked(client_ip(), "example.org"));
}
