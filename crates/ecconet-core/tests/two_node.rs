//! End-to-end tests driving two [`Coordinator`]s over an in-memory bus built
//! from [`ecconet_test::LoopbackHost`] and [`ecconet_test::relay`].

use ecconet_core::address::AddressManager;
use ecconet_core::coordinator::Coordinator;
use ecconet_core::ftp::client::FtpOutcome;
use ecconet_test::{LoopbackHost, relay};

#[test]
fn unassigned_node_claims_an_address_distinct_from_its_static_peer() {
    let mut static_host = LoopbackHost::new([1, 1, 1, 1]);
    let mut static_node = Coordinator::new(AddressManager::new_static(10));
    static_node.reset(&mut static_host, 0);

    let guid = [0xEE4C_AD97, 0x331C_E9EC, 0x9E95_7DBC, 0xA4A6_9FE5];
    let mut roaming_host = LoopbackHost::new([2, 2, 2, 2]);
    let mut roaming_node = Coordinator::new(AddressManager::new_unassigned(guid));
    roaming_node.reset(&mut roaming_host, 0);

    let mut now_ms = 0u64;
    for _ in 0..8 {
        static_node.clock(&mut static_host, now_ms);
        roaming_node.clock(&mut roaming_host, now_ms);
        relay(&mut static_host, &mut roaming_node, now_ms);
        relay(&mut roaming_host, &mut static_node, now_ms);
        now_ms += 20;
        if roaming_node.own_address().is_some() {
            break;
        }
    }

    let assigned = roaming_node.own_address().expect("roaming node never claimed an address");
    assert_ne!(assigned, 10);
}

#[test]
fn client_reads_a_public_file_from_a_peers_server() {
    let mut server_host = LoopbackHost::new([3, 3, 3, 3]);
    let contents = b"hello from the public file".to_vec();
    server_host.seed_file("product.inf", contents.clone(), 0);
    let mut server = Coordinator::new(AddressManager::new_static(10));
    server.reset(&mut server_host, 0);

    let mut client_host = LoopbackHost::new([4, 4, 4, 4]);
    let mut client = Coordinator::new(AddressManager::new_static(20));
    client.reset(&mut client_host, 0);

    let action = client
        .ftp_client_mut()
        .read_file(10, "product.inf", 0, false, 0)
        .expect("client should be idle and able to start a read");
    client.send_ftp_request(10, &action, 0);

    let mut now_ms = 0u64;
    let mut outcome = None;
    for _ in 0..10 {
        client.clock(&mut client_host, now_ms);
        relay(&mut client_host, &mut server, now_ms);

        server.clock(&mut server_host, now_ms);
        relay(&mut server_host, &mut client, now_ms);

        now_ms += 20;
        let outcomes = client.clock(&mut client_host, now_ms);
        if let Some(o) = outcomes.into_iter().next() {
            outcome = Some(o);
            break;
        }
        relay(&mut client_host, &mut server, now_ms);
        now_ms += 20;
    }

    match outcome.expect("read never completed") {
        FtpOutcome::Read { data, .. } => assert_eq!(data, contents),
        other => panic!("expected a completed read, got {other:?}"),
    }
}
