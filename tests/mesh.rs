//! In-process mesh scenarios over the memory transport
//!
//! Stands up two- and three-agent meshes inside one runtime and drives real
//! traffic through them: direct proxying, transit splicing with end-to-end
//! encryption, duplicate-session resolution, route withdrawal on peer loss,
//! and node-info flooding.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use weft::agent::{Agent, Core, MeshConn};
use weft::config::Config;
use weft::identity::{AgentId, Identity};
use weft::proto::{Destination, StreamKind, WireCode};
use weft::WeftError;

/// Config tuned for fast test convergence.
fn test_config() -> Config {
    let mut config = Config::default();
    config.routing.advertise_interval = Duration::from_millis(200);
    config.routing.node_info_interval = Duration::from_millis(200);
    config.routing.route_ttl = Duration::from_secs(2);
    config.limits.stream_open_timeout = Duration::from_secs(2);
    config
}

fn exit_config(routes: &[&str]) -> Config {
    let mut config = test_config();
    config.exit.enabled = true;
    config.exit.routes = routes.iter().map(|s| s.to_string()).collect();
    // Explicit resolver config; the tests only dial literal addresses.
    config.exit.dns.servers = vec!["127.0.0.1:53".into()];
    config
}

/// Build an agent on an ephemeral identity and spawn its event loop.
fn spawn_agent(config: Config, name: &str) -> Arc<Core> {
    let agent = Agent::with_identity(config, Identity::ephemeral(name)).unwrap();
    let core = agent.handle();
    tokio::spawn(agent.run());
    core
}

fn spawn_agent_with_id(config: Config, id: AgentId, name: &str) -> Arc<Core> {
    let agent = Agent::with_identity(config, Identity::ephemeral_with_id(id, name)).unwrap();
    let core = agent.handle();
    tokio::spawn(agent.run());
    core
}

/// A TCP echo server on loopback; returns its port.
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    port
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

async fn open_data(
    core: &Arc<Core>,
    destination: Destination,
) -> Result<MeshConn, WeftError> {
    core.open_mesh_stream(StreamKind::Data, destination, vec![]).await
}

#[tokio::test]
async fn two_agent_direct_proxy() {
    let ingress = spawn_agent(test_config(), "ingress");
    let exit = spawn_agent(exit_config(&["127.0.0.0/8"]), "exit");
    Core::connect_memory(&ingress, &exit).await.unwrap();
    settle().await;

    assert_eq!(ingress.sessions.len(), 1);
    assert!(ingress.routes.len() >= 1, "route should arrive with the seed advert");

    let port = spawn_echo_server().await;
    let conn = open_data(&ingress, Destination::V4("127.0.0.1".parse().unwrap(), port))
        .await
        .unwrap();
    let MeshConn::Stream(mut stream, handle) = conn else {
        panic!("expected a mesh stream");
    };

    stream.write_all(b"through the mesh").await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = [0u8; 16];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through the mesh");

    // Half-close propagates: shutting down our write drains the echo and
    // then EOF arrives.
    stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    assert_eq!(ingress.streams.active_total(), 1);
    drop(handle);
    drop(stream);
    settle().await;
    assert_eq!(ingress.streams.active_total(), 0, "stream count returns to zero");
}

#[tokio::test]
async fn no_route_is_reported() {
    let lonely = spawn_agent(test_config(), "lonely");
    let err = open_data(&lonely, Destination::V4("203.0.113.9".parse().unwrap(), 80))
        .await
        .unwrap_err();
    match err {
        WeftError::Wire(WireCode::NoRoute) => {}
        other => panic!("expected no_route, got {}", other),
    }
}

#[tokio::test]
async fn three_agent_transit_splice() {
    let ingress = spawn_agent(test_config(), "ingress");
    let transit = spawn_agent(test_config(), "transit");
    let exit = spawn_agent(exit_config(&["127.0.0.0/8"]), "exit");

    Core::connect_memory(&transit, &exit).await.unwrap();
    settle().await;
    Core::connect_memory(&ingress, &transit).await.unwrap();
    settle().await;

    // Ingress sees the exit prefix at metric 2 via the transit hop.
    let routes = ingress.routes_view();
    let learned = routes
        .iter()
        .find(|r| r.prefix == "127.0.0.0/8")
        .expect("route flooded through transit");
    assert_eq!(learned.metric, 2);
    assert_eq!(learned.next_hop, Some(transit.identity.id));
    assert_eq!(learned.origin, exit.identity.id);

    // Traffic crosses both hops, end-to-end encrypted past the transit.
    let port = spawn_echo_server().await;
    let conn = open_data(&ingress, Destination::V4("127.0.0.1".parse().unwrap(), port))
        .await
        .unwrap();
    let MeshConn::Stream(mut stream, _handle) = conn else {
        panic!("expected a mesh stream");
    };
    stream.write_all(b"two hops out").await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = [0u8; 12];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two hops out");
    drop(stream);
    drop(_handle);

    // Killing the transit withdraws the route from the ingress table.
    transit.shutdown();
    settle().await;
    assert!(
        !ingress
            .routes_view()
            .iter()
            .any(|r| r.next_hop == Some(transit.identity.id)),
        "routes via the dead transit must be purged"
    );
}

#[tokio::test]
async fn duplicate_sessions_resolve_deterministically() {
    let low = spawn_agent_with_id(test_config(), AgentId([0x01; 16]), "low");
    let high = spawn_agent_with_id(test_config(), AgentId([0x02; 16]), "high");

    // Both directions race.
    let (first, second) = tokio::join!(
        Core::connect_memory(&low, &high),
        Core::connect_memory(&high, &low),
    );
    first.unwrap();
    second.unwrap();
    settle().await;

    assert_eq!(low.sessions.len(), 1, "exactly one session survives on the low side");
    assert_eq!(high.sessions.len(), 1, "exactly one session survives on the high side");

    // The connection dialed by the higher ID survives: the lower-ID agent
    // holds it as listener-accepted.
    let low_view = &low.peers()[0];
    let high_view = &high.peers()[0];
    assert_eq!(low_view.direction, weft::peer::Direction::Accepted);
    assert_eq!(high_view.direction, weft::peer::Direction::Dialer);
}

#[tokio::test]
async fn route_loops_are_suppressed() {
    let a = spawn_agent(exit_config(&["10.0.0.0/8"]), "origin");
    let b = spawn_agent(test_config(), "b");
    let c = spawn_agent(test_config(), "c");

    // Triangle: adverts can circle a -> b -> c -> a.
    Core::connect_memory(&a, &b).await.unwrap();
    Core::connect_memory(&b, &c).await.unwrap();
    Core::connect_memory(&c, &a).await.unwrap();

    // Let several advertise cycles run.
    tokio::time::sleep(Duration::from_millis(900)).await;

    // The origin never learns its own prefix back.
    assert!(
        a.routes_view().iter().all(|r| r.next_hop.is_none()),
        "origin must hold only its local route"
    );
    // Everyone else holds exactly one entry per (prefix, origin).
    for core in [&b, &c] {
        let learned: Vec<_> = core
            .routes_view()
            .into_iter()
            .filter(|r| r.prefix == "10.0.0.0/8")
            .collect();
        assert_eq!(learned.len(), 1, "one route entry per (prefix, origin)");
        assert!(learned[0].metric <= core.config.routing.max_hops);
    }
}

#[tokio::test]
async fn node_info_floods_and_probes_cross_transit() {
    let a = spawn_agent(test_config(), "a");
    let t = spawn_agent(test_config(), "t");
    let b = spawn_agent(test_config(), "b");

    Core::connect_memory(&t, &b).await.unwrap();
    settle().await;
    Core::connect_memory(&a, &t).await.unwrap();
    settle().await;

    // A learned B's descriptor through T and knows the way back.
    assert!(a.nodes.get(&b.identity.id).is_some(), "descriptor flooded across transit");
    assert_eq!(a.nodes.via(&b.identity.id), Some(t.identity.id));

    // mesh_test probes both the direct peer and the distant agent.
    let results = a.mesh_test().await;
    assert_eq!(results.len(), 2);
    for result in &results {
        assert!(result.ok, "probe to {} failed: {:?}", result.agent.short(), result.error);
    }

    // The cache answers the second call.
    let again = a.mesh_test().await;
    assert_eq!(again.len(), 2);
}

#[tokio::test]
async fn descriptor_version_supersession_is_idempotent() {
    let a = spawn_agent(test_config(), "a");
    let b = spawn_agent(test_config(), "b");
    Core::connect_memory(&a, &b).await.unwrap();
    settle().await;

    let first = a.nodes.get(&b.identity.id).expect("descriptor arrives");
    settle().await;
    let later = a.nodes.get(&b.identity.id).expect("descriptor still present");
    // Periodic refloods carry increasing versions; the store never goes
    // backwards.
    assert!(later.version >= first.version);
}

#[tokio::test]
async fn forward_key_pairs_listener_and_exit() {
    // Exit agent terminates key "door" toward a local echo server.
    let port = spawn_echo_server().await;
    let mut exit_side = test_config();
    exit_side.forward.exits.push(weft::config::ForwardExit {
        key: "door".into(),
        target: format!("127.0.0.1:{}", port),
    });
    let exit = spawn_agent(exit_side, "forward-exit");
    let ingress = spawn_agent(test_config(), "forward-ingress");
    Core::connect_memory(&ingress, &exit).await.unwrap();
    settle().await;

    // The ingress resolves the key via node-info and opens the stream.
    let agent = ingress
        .find_forward_exit_agent("door")
        .expect("exit advertises the key");
    assert_eq!(agent, exit.identity.id);

    let (mut stream, _handle) = ingress
        .open_agent_stream(agent, StreamKind::Forward, b"door".to_vec())
        .await
        .unwrap();
    stream.write_all(b"knock").await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"knock");
}

#[tokio::test]
async fn sleep_and_wake_commands_propagate() {
    let a = spawn_agent(test_config(), "a");
    let b = spawn_agent(test_config(), "b");
    Core::connect_memory(&a, &b).await.unwrap();
    settle().await;

    a.send_sleep().await.unwrap();
    settle().await;
    assert!(a.status().sleeping);
    assert!(b.status().sleeping, "sleep floods to peers before teardown");
    assert_eq!(a.sessions.len(), 0, "sleep tears down peer sessions");
}

#[tokio::test]
async fn stream_limits_surface_too_many_streams() {
    let mut config = test_config();
    config.limits.max_streams_per_peer = 0;
    let a = spawn_agent(config, "limited");
    let b = spawn_agent(exit_config(&["127.0.0.0/8"]), "exit");
    Core::connect_memory(&a, &b).await.unwrap();
    settle().await;

    let err = open_data(&a, Destination::V4("127.0.0.1".parse().unwrap(), 1))
        .await
        .unwrap_err();
    match err {
        WeftError::Wire(WireCode::TooManyStreams) => {}
        other => panic!("expected too_many_streams, got {}", other),
    }
}
