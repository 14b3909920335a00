//! End-to-end scenarios against in-process stub servers.

mod common;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use domain::base::iana::{Rtype};
use domain::base::name::Name;
use domain::base::MessageBuilder;
use std::str::FromStr;

use netresolv::{
    Family, Hosts, LookupArgs, LookupError, MockClock, QueryFlags,
    Resolver, ResolverConfig, ResolverParams, StaticRoutes,
};

use common::{Rr, StubServer};

const NETID: u32 = 100;
const UID: u32 = 10001;

fn resolver() -> Resolver<MockClock> {
    Resolver::with_parts(
        Arc::new(StaticRoutes::new(NETID)),
        Hosts::new(),
        MockClock::new(),
    )
}

fn config_for(server: &StubServer) -> ResolverConfig {
    ResolverConfig {
        netid: NETID,
        servers: vec![server.addr()],
        params: ResolverParams {
            base_timeout_msec: 500,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn args() -> LookupArgs {
    LookupArgs::on_network(NETID, UID)
}

#[tokio::test]
async fn basic_a_lookup_via_search_domain() {
    let stub = StubServer::start(&[(
        "hello.example.com",
        Rr::A("1.2.3.5".parse().unwrap()),
    )])
    .await;
    let resolver = resolver();
    resolver.create_network_cache(NETID).unwrap();
    let mut config = config_for(&stub);
    config.search_domains = vec!["example.com".into()];
    resolver.set_resolver_configuration(config).unwrap();

    let mut args = args();
    args.family = Some(Family::V4);
    let found = resolver.lookup_host("hello", args).await.unwrap();
    assert_eq!(
        found.addresses(),
        vec!["1.2.3.5".parse::<IpAddr>().unwrap()]
    );
    assert_eq!(
        stub.queries(),
        vec![("hello.example.com".into(), Rtype::A)]
    );
}

#[tokio::test]
async fn dns64_synthesis_for_v4only_host() {
    let stub = StubServer::start(&[(
        "v4only.example.com",
        Rr::A("1.2.3.4".parse().unwrap()),
    )])
    .await;
    let resolver = resolver();
    resolver.create_network_cache(NETID).unwrap();
    resolver
        .set_resolver_configuration(config_for(&stub))
        .unwrap();
    resolver.set_prefix64(NETID, Some("64:ff9b::/96")).unwrap();

    let mut args = args();
    args.family = Some(Family::V6);
    let found = resolver
        .lookup_host("v4only.example.com", args)
        .await
        .unwrap();
    assert_eq!(
        found.addresses(),
        vec!["64:ff9b::102:304".parse::<IpAddr>().unwrap()]
    );

    // Upstream saw the empty AAAA first, then the A for synthesis.
    let queries = stub.queries();
    assert_eq!(queries[0].1, Rtype::AAAA);
    assert!(queries.iter().any(|(_, qtype)| *qtype == Rtype::A));
}

#[tokio::test]
async fn native_aaaa_suppresses_synthesis() {
    let stub = StubServer::start(&[
        ("dual.example.com", Rr::A("1.2.3.4".parse().unwrap())),
        ("dual.example.com", Rr::Aaaa("2001:db8::7".parse().unwrap())),
    ])
    .await;
    let resolver = resolver();
    resolver.create_network_cache(NETID).unwrap();
    resolver
        .set_resolver_configuration(config_for(&stub))
        .unwrap();
    resolver.set_prefix64(NETID, Some("64:ff9b::/96")).unwrap();

    let mut args = args();
    args.family = Some(Family::V6);
    let found = resolver
        .lookup_host("dual.example.com", args)
        .await
        .unwrap();
    assert_eq!(
        found.addresses(),
        vec!["2001:db8::7".parse::<IpAddr>().unwrap()]
    );
}

#[tokio::test]
async fn unresponsive_server_is_quarantined() {
    let dead = StubServer::silent().await;
    let live = StubServer::start(&[
        ("one.example.org", Rr::A("9.9.9.1".parse().unwrap())),
    ])
    .await;

    let resolver = resolver();
    resolver.create_network_cache(NETID).unwrap();
    resolver
        .set_resolver_configuration(ResolverConfig {
            netid: NETID,
            servers: vec![dead.addr(), live.addr()],
            params: ResolverParams {
                base_timeout_msec: 120,
                min_samples: 2,
                retry_count: 1,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

    // Unique names so the cache never short-circuits the selector.
    let total = 20;
    for i in 0..total {
        let name = format!("n{}.example.org", i);
        let mut args = args();
        args.family = Some(Family::V4);
        // Most names are absent upstream; any authoritative outcome is
        // fine, only transport behavior matters here.
        let _ = resolver.lookup_host(&name, args).await;
    }

    let info = resolver.get_resolver_info(NETID).unwrap();
    let dead_stats = info
        .stats
        .iter()
        .find(|snapshot| snapshot.server == dead.addr())
        .unwrap();
    assert!(dead_stats.counts.timeouts <= 5);
    assert!(!dead_stats.usable);

    // The workable server saw every question.
    assert!(live.query_count() >= total);
}

#[tokio::test]
async fn search_domains_are_pruned_to_the_valid_one() {
    let stub = StubServer::start(&[(
        "test13.domain13.org",
        Rr::Aaaa("2001:db8::13".parse().unwrap()),
    )])
    .await;
    let resolver = resolver();
    resolver.create_network_cache(NETID).unwrap();

    let long = "x".repeat(300);
    let mut config = config_for(&stub);
    config.search_domains = vec![
        String::new(),
        " ".into(),
        long,
        "bad domain".into(),
        "also bad!".into(),
        "-".repeat(80),
        "domain13.org".into(),
    ];
    resolver.set_resolver_configuration(config).unwrap();

    let mut args = args();
    args.family = Some(Family::V6);
    let found = resolver.lookup_host("test13", args).await.unwrap();
    assert_eq!(
        found.addresses(),
        vec!["2001:db8::13".parse::<IpAddr>().unwrap()]
    );
    assert_eq!(
        stub.queries(),
        vec![("test13.domain13.org".into(), Rtype::AAAA)]
    );
}

#[tokio::test]
async fn concurrent_identical_queries_coalesce() {
    let stub = StubServer::start_with_delay(
        &[("slow.example.com", Rr::A("5.5.5.5".parse().unwrap()))],
        Duration::from_millis(100),
    )
    .await;
    let resolver = Arc::new(resolver());
    resolver.create_network_cache(NETID).unwrap();
    resolver
        .set_resolver_configuration(config_for(&stub))
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move {
            let mut args = args();
            args.family = Some(Family::V4);
            resolver.lookup_host("slow.example.com", args).await
        }));
    }
    for handle in handles {
        let found = handle.await.unwrap().unwrap();
        assert_eq!(
            found.addresses(),
            vec!["5.5.5.5".parse::<IpAddr>().unwrap()]
        );
    }
    assert_eq!(stub.query_count(), 1);
}

#[tokio::test]
async fn negative_answers_are_cached() {
    let stub = StubServer::start(&[]).await;
    let resolver = resolver();
    resolver.create_network_cache(NETID).unwrap();
    resolver
        .set_resolver_configuration(config_for(&stub))
        .unwrap();

    let mut args_v4 = args();
    args_v4.family = Some(Family::V4);
    for _ in 0..3 {
        let err = resolver
            .lookup_host("missing.example.com", args_v4)
            .await
            .unwrap_err();
        assert_eq!(err, LookupError::HostNotFound);
    }
    // One upstream query; the repeats were served negatively from the
    // cache.
    assert_eq!(stub.query_count(), 1);
}

#[tokio::test]
async fn flush_clears_answers_but_not_stats() {
    let stub = StubServer::start(&[(
        "keep.example.com",
        Rr::A("8.8.8.8".parse().unwrap()),
    )])
    .await;
    let resolver = resolver();
    resolver.create_network_cache(NETID).unwrap();
    resolver
        .set_resolver_configuration(config_for(&stub))
        .unwrap();

    let mut args = args();
    args.family = Some(Family::V4);
    resolver.lookup_host("keep.example.com", args).await.unwrap();
    assert_eq!(stub.query_count(), 1);

    // Cached.
    resolver.lookup_host("keep.example.com", args).await.unwrap();
    assert_eq!(stub.query_count(), 1);

    resolver.flush_network_cache(NETID).unwrap();

    // Gone from the cache, still in the stats.
    resolver.lookup_host("keep.example.com", args).await.unwrap();
    assert_eq!(stub.query_count(), 2);
    let info = resolver.get_resolver_info(NETID).unwrap();
    assert_eq!(info.stats[0].counts.successes, 2);
}

#[tokio::test]
async fn identical_reconfiguration_keeps_stats() {
    let stub = StubServer::start(&[(
        "again.example.com",
        Rr::A("7.7.7.7".parse().unwrap()),
    )])
    .await;
    let resolver = resolver();
    resolver.create_network_cache(NETID).unwrap();
    resolver
        .set_resolver_configuration(config_for(&stub))
        .unwrap();

    let mut args = args();
    args.family = Some(Family::V4);
    resolver
        .lookup_host("again.example.com", args)
        .await
        .unwrap();

    resolver
        .set_resolver_configuration(config_for(&stub))
        .unwrap();
    let info = resolver.get_resolver_info(NETID).unwrap();
    assert_eq!(info.stats[0].counts.successes, 1);
}

#[tokio::test]
async fn raw_query_round_trips_with_caller_id() {
    let stub = StubServer::start(&[(
        "raw.example.com",
        Rr::A("3.3.3.3".parse().unwrap()),
    )])
    .await;
    let resolver = resolver();
    resolver.create_network_cache(NETID).unwrap();
    resolver
        .set_resolver_configuration(config_for(&stub))
        .unwrap();

    let mut builder = MessageBuilder::new_vec();
    builder.header_mut().set_id(0x1337);
    builder.header_mut().set_rd(true);
    let mut builder = builder.question();
    builder
        .push((
            Name::<Vec<u8>>::from_str("raw.example.com").unwrap(),
            Rtype::A,
        ))
        .unwrap();
    let msg = builder.into_message().into_octets();

    let reply = resolver
        .raw_query(NETID, UID, msg.clone(), QueryFlags::default())
        .await
        .unwrap();
    assert_eq!(&reply[..2], &0x1337u16.to_be_bytes());

    // Bypassing the cache reaches upstream again.
    let before = stub.query_count();
    resolver
        .raw_query(
            NETID,
            UID,
            msg,
            QueryFlags::NO_CACHE_LOOKUP | QueryFlags::NO_CACHE_STORE,
        )
        .await
        .unwrap();
    assert_eq!(stub.query_count(), before + 1);
}

#[tokio::test]
async fn reverse_lookup_unsynthesizes_nat64_addresses() {
    let stub = StubServer::start(&[(
        "4.3.2.1.in-addr.arpa",
        Rr::Ptr("v4host.example.com."),
    )])
    .await;
    let resolver = resolver();
    resolver.create_network_cache(NETID).unwrap();
    resolver
        .set_resolver_configuration(config_for(&stub))
        .unwrap();
    resolver.set_prefix64(NETID, Some("64:ff9b::/96")).unwrap();

    let names = resolver
        .lookup_addr("64:ff9b::102:304".parse().unwrap(), args())
        .await
        .unwrap();
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].to_string(), "v4host.example.com");

    // The synthesized ip6.arpa name was tried first.
    let queries = stub.queries();
    assert!(queries[0].0.ends_with("ip6.arpa"));
    assert_eq!(
        queries.last().unwrap().0,
        "4.3.2.1.in-addr.arpa"
    );
}

#[tokio::test]
async fn custom_hosts_are_authoritative() {
    let stub = StubServer::start(&[(
        "pinned.example.com",
        Rr::A("6.6.6.6".parse().unwrap()),
    )])
    .await;
    let resolver = resolver();
    resolver.create_network_cache(NETID).unwrap();
    let mut config = config_for(&stub);
    config.options.custom_hosts = vec![(
        "pinned.example.com".into(),
        "10.0.0.1".parse().unwrap(),
    )];
    resolver.set_resolver_configuration(config).unwrap();

    let mut args = args();
    args.family = Some(Family::V4);
    let found = resolver
        .lookup_host("pinned.example.com", args)
        .await
        .unwrap();
    assert_eq!(
        found.addresses(),
        vec!["10.0.0.1".parse::<IpAddr>().unwrap()]
    );
    assert_eq!(stub.query_count(), 0);
}

#[tokio::test]
async fn destroyed_network_fails_lookups() {
    let stub = StubServer::start(&[]).await;
    let resolver = resolver();
    resolver.create_network_cache(NETID).unwrap();
    resolver
        .set_resolver_configuration(config_for(&stub))
        .unwrap();
    resolver.destroy_network_cache(NETID).unwrap();

    let err = resolver
        .lookup_host("anything.example.com", args())
        .await
        .unwrap_err();
    assert!(matches!(err, LookupError::System(_)));
}
