mod common;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;

use trust_dns_proto::rr::RecordType;

use switchyard::app::dns::{answer_ips, new_query, DomainStrategy};
use switchyard::config;
use switchyard::session::{Network, Session, SocksAddr};
use switchyard::Runtime;

use common::spawn_dns_server;

fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

fn runtime(upstream: SocketAddr) -> Runtime {
    let config = config::from_string(&format!(
        r#"{{
            "log": {{"disabled": true}},
            "dns": {{
                "servers": [
                    {{"tag": "upstream", "address": "udp://{}"}},
                    {{"tag": "refuse", "address": "rcode://refused"}}
                ],
                "rules": [{{"domain_suffix": "ads.test", "server": "refuse"}}],
                "final": "upstream",
                "reverse_mapping": true
            }},
            "outbounds": [
                {{"type": "direct", "tag": "direct"}},
                {{"type": "block", "tag": "block"}}
            ],
            "route": {{
                "rules": [
                    {{"domain": "fake.test", "outbound": "block"}},
                    {{"ip_cidr": "10.0.0.0/8", "outbound": "block"}}
                ],
                "final": "direct"
            }}
        }}"#,
        upstream
    ))
    .unwrap();
    Runtime::build(&config, Vec::new()).unwrap()
}

fn session(destination: SocksAddr) -> Session {
    Session {
        network: Network::Tcp,
        destination,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_lookup_cache_and_rules() {
    let (addr, queries) =
        spawn_dns_server(HashMap::from([("www.example.test", vec![v4(10, 0, 0, 1)])])).await;
    let rt = runtime(addr);

    let ips = rt
        .dns
        .lookup("www.example.test", DomainStrategy::Ipv4Only)
        .await
        .unwrap();
    assert_eq!(ips, vec![v4(10, 0, 0, 1)]);
    assert_eq!(queries.load(Ordering::SeqCst), 1);

    // Answered from the cache.
    let ips = rt
        .dns
        .lookup("WWW.example.test.", DomainStrategy::Ipv4Only)
        .await
        .unwrap();
    assert_eq!(ips, vec![v4(10, 0, 0, 1)]);
    assert_eq!(queries.load(Ordering::SeqCst), 1);

    assert_eq!(
        rt.dns.reverse_lookup(&v4(10, 0, 0, 1)).as_deref(),
        Some("www.example.test")
    );

    // Routed to the refusing server by the dns rule, upstream never sees it.
    assert!(rt
        .dns
        .lookup("tracker.ads.test", DomainStrategy::Ipv4Only)
        .await
        .is_err());
    assert!(rt
        .dns
        .lookup("missing.test", DomainStrategy::Ipv4Only)
        .await
        .is_err());
    assert_eq!(queries.load(Ordering::SeqCst), 2);
    rt.shutdown();
}

#[tokio::test]
async fn test_route_resolves_for_ip_rules() {
    let (addr, _) =
        spawn_dns_server(HashMap::from([("www.example.test", vec![v4(10, 0, 0, 1)])])).await;
    let rt = runtime(addr);

    let d = rt
        .router
        .explain(&session(SocksAddr::Domain("www.example.test".to_string(), 80)))
        .await
        .unwrap();
    assert_eq!(d.matched_rule.as_deref(), Some("ip_cidr=10.0.0.0/8 => block"));
    assert_eq!(d.outbound, "block");

    // An IP destination picks up the domain a lookup resolved it from.
    let mut sess = session(SocksAddr::Ip(SocketAddr::new(v4(10, 0, 0, 1), 80)));
    let result = rt.router.route(&mut sess).await.unwrap();
    assert_eq!(result.tag, "block");
    assert_eq!(sess.domain.as_deref(), Some("www.example.test"));

    // Unresolvable: the ip rule cannot match and the flow falls to final.
    let d = rt
        .router
        .explain(&session(SocksAddr::Domain("missing.test".to_string(), 80)))
        .await
        .unwrap();
    assert_eq!(d.matched_rule, None);
    assert_eq!(d.outbound, "direct");
    rt.shutdown();
}

#[tokio::test]
async fn test_fakeip_round_trip() {
    let (addr, queries) =
        spawn_dns_server(HashMap::from([("fake.test", vec![v4(93, 184, 216, 34)])])).await;
    let config = config::from_string(&format!(
        r#"{{
            "log": {{"disabled": true}},
            "dns": {{
                "servers": [
                    {{"tag": "upstream", "address": "udp://{}"}},
                    {{"tag": "fake", "address": "fakeip"}}
                ],
                "rules": [{{"domain": "fake.test", "server": "fake"}}],
                "final": "upstream",
                "fakeip": {{"enabled": true}}
            }},
            "outbounds": [{{"type": "block", "tag": "block"}}, {{"type": "direct", "tag": "direct"}}],
            "route": {{
                "rules": [
                    {{"ip_cidr": "198.18.0.0/15", "outbound": "block"}},
                    {{"domain": "fake.test", "outbound": "direct"}}
                ],
                "final": "block"
            }}
        }}"#,
        addr
    ))
    .unwrap();
    let rt = Runtime::build(&config, Vec::new()).unwrap();

    // A DNS client asking through the inbound gets a fake answer.
    let client = Session {
        network: Network::Udp,
        inbound_tag: "dns-in".to_string(),
        destination: SocksAddr::Domain("fake.test".to_string(), 53),
        ..Default::default()
    };
    let request = new_query("fake.test", RecordType::A).unwrap();
    let response = rt.dns.exchange(&client, &request).await.unwrap();
    let (ips, _) = answer_ips(&response);
    assert_eq!(ips.len(), 1);
    let fake = ips[0];
    assert!(rt.dns.fakeip().unwrap().contains(&fake));
    assert_eq!(queries.load(Ordering::SeqCst), 0);

    // The core itself always resolves for real.
    let real = rt
        .dns
        .lookup("fake.test", DomainStrategy::Ipv4Only)
        .await
        .unwrap();
    assert_eq!(real, vec![v4(93, 184, 216, 34)]);
    assert_eq!(queries.load(Ordering::SeqCst), 1);

    // A connection to the fake address is routed by its domain, and the
    // ip_cidr rule sees the real address rather than the fake one.
    let mut sess = session(SocksAddr::Ip(SocketAddr::new(fake, 443)));
    let result = rt.router.route(&mut sess).await.unwrap();
    assert_eq!(result.tag, "direct");
    assert_eq!(sess.destination, SocksAddr::Domain("fake.test".to_string(), 443));
    assert_eq!(
        sess.origin_destination,
        Some(SocksAddr::Ip(SocketAddr::new(fake, 443)))
    );
    assert!(!sess.destination_addresses.iter().any(|ip| rt.dns.fakeip().unwrap().contains(ip)));

    // An address in the fake range nobody was given.
    let mut sess = session(SocksAddr::Ip(SocketAddr::new(v4(198, 18, 255, 254), 443)));
    assert!(matches!(
        rt.router.route(&mut sess).await,
        Err(switchyard::Error::Dns(_))
    ));
    rt.shutdown();
}
