use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use zerocopy::{AsBytes, FromZeroes};

use replog::channel::frame::{
    encode_command_header, ConnectHeader, ConnectionType, Opcode, CONNECT_HEADER_LEN,
};
use replog::channel::ChannelManager;
use replog::config::Config;
use replog::controller::{Controller, Role};
use replog::group::{MemberInfo, MemberRole, StaticMembership};
use replog::state_log::StateLog;
use replog::term_log::CommitWait;

const GROUP_ID: u64 = 42;
const TOKEN_1: u64 = 0x1111;
const TOKEN_2: u64 = 0x2222;

struct Node {
    controller: Arc<Controller>,
    manager: Arc<ChannelManager>,
    state_log: Arc<StateLog>,
    _tmp: tempfile::TempDir,
}

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn reserve_addrs(n: usize) -> Vec<SocketAddr> {
    let listeners: Vec<std::net::TcpListener> = (0..n)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap())
        .collect()
}

async fn spawn_cluster(n: usize) -> Vec<Node> {
    init_tracing();
    let addrs = reserve_addrs(n);
    let members: Vec<MemberInfo> = (0..n)
        .map(|i| MemberInfo {
            id: i as u64 + 1,
            addr: addrs[i],
            role: MemberRole::Normal,
        })
        .collect();

    let mut nodes = Vec::with_capacity(n);
    for member in &members {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            base_path: tmp.path().join("db"),
            group_id: GROUP_ID,
            local_member_id: member.id,
            group_token_1: TOKEN_1,
            group_token_2: TOKEN_2,
            listen_addr: member.addr,
            min_segment_len: 4096,
            max_segment_len: 1024 * 1024,
            ..Config::default()
        };
        let state_log = Arc::new(
            StateLog::open_with_sizing(
                &config.base_path,
                config.min_segment_len,
                config.max_segment_len,
            )
            .unwrap(),
        );
        let group = Arc::new(StaticMembership::new(GROUP_ID, member.id, members.clone()));
        let manager = ChannelManager::new(config.clone());
        let controller = Controller::new(config, state_log.clone(), manager.clone(), group);
        controller.start().await.unwrap();
        nodes.push(Node {
            controller,
            manager,
            state_log,
            _tmp: tmp,
        });
    }
    nodes
}

async fn wait_for_leader(nodes: &[Node], timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    loop {
        for (i, node) in nodes.iter().enumerate() {
            if node.controller.role() == Role::Leader {
                return i;
            }
        }
        assert!(Instant::now() < deadline, "no leader elected in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Writes through whichever node currently leads, retrying across
/// elections. Returns the writing node and the end position.
async fn write_via_leader(nodes: &[&Node], data: &[u8], timeout: Duration) -> (usize, u64) {
    let deadline = Instant::now() + timeout;
    loop {
        for (i, node) in nodes.iter().enumerate() {
            if node.controller.role() == Role::Leader {
                if let Ok(end) = node.controller.write(data) {
                    return (i, end);
                }
            }
        }
        assert!(Instant::now() < deadline, "no leader accepted the write");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread")]
async fn three_node_happy_path() {
    let nodes = spawn_cluster(3).await;
    wait_for_leader(&nodes, Duration::from_secs(20)).await;

    let data = vec![42u8; 1000];
    let all: Vec<&Node> = nodes.iter().collect();
    let (leader, end) = write_via_leader(&all, &data, Duration::from_secs(10)).await;
    let base = end - 1000;

    match nodes[leader]
        .controller
        .wait_for_commit(end, Duration::from_secs(10))
        .await
    {
        CommitWait::Reached(commit) => assert!(commit >= end),
        other => panic!("commit did not advance: {other:?}"),
    }

    // every follower converges and can read the bytes back in order
    for (i, node) in nodes.iter().enumerate() {
        if i == leader {
            continue;
        }
        let caught_up = wait_until(Duration::from_secs(10), || {
            node.state_log.capture_highest().appliable() >= end
        })
        .await;
        assert!(caught_up, "follower {i} never converged");

        let mut reader = node.state_log.open_reader(base).unwrap();
        let mut buf = vec![0u8; 1000];
        let mut read = 0;
        while read < 1000 {
            let n = reader.read(&mut buf[read..]).await.unwrap();
            assert!(n > 0, "reader stalled at {read}");
            read += n;
        }
        assert_eq!(buf, data);
    }

    for node in &nodes {
        node.controller.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn leader_failure_triggers_reelection() {
    let nodes = spawn_cluster(3).await;
    let old_leader = wait_for_leader(&nodes, Duration::from_secs(20)).await;
    let old_term = nodes[old_leader].controller.current_term();

    nodes[old_leader].controller.shutdown();

    let survivors: Vec<&Node> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != old_leader)
        .map(|(_, n)| n)
        .collect();

    let elected = wait_until(Duration::from_secs(20), || {
        survivors.iter().any(|n| {
            n.controller.role() == Role::Leader && n.controller.current_term() > old_term
        })
    })
    .await;
    assert!(elected, "no new leader after failure");

    // the two survivors still form a quorum
    let (writer, end) =
        write_via_leader(&survivors, b"after failover", Duration::from_secs(10)).await;
    assert!(survivors[writer].controller.current_term() > old_term);
    match survivors[writer]
        .controller
        .wait_for_commit(end, Duration::from_secs(10))
        .await
    {
        CommitWait::Reached(_) => {}
        other => panic!("no quorum after failover: {other:?}"),
    }

    for node in &nodes {
        node.controller.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn partitioned_follower_catches_up() {
    let nodes = spawn_cluster(3).await;
    let leader = wait_for_leader(&nodes, Duration::from_secs(20)).await;
    let behind = (0..3).find(|i| *i != leader).unwrap();

    nodes[behind].manager.set_partitioned(true);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let payload = vec![7u8; 100_000];
    let active: Vec<&Node> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != behind)
        .map(|(_, n)| n)
        .collect();
    let (writer, end) = write_via_leader(&active, &payload, Duration::from_secs(10)).await;
    match active[writer]
        .controller
        .wait_for_commit(end, Duration::from_secs(10))
        .await
    {
        CommitWait::Reached(_) => {}
        other => panic!("quorum of two should commit: {other:?}"),
    }
    assert!(nodes[behind].state_log.capture_highest().contig < end);

    nodes[behind].manager.set_partitioned(false);

    let caught_up = wait_until(Duration::from_secs(15), || {
        nodes[behind].state_log.capture_highest().contig >= end
    })
    .await;
    assert!(caught_up, "partitioned follower never caught up");

    for node in &nodes {
        node.controller.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn forged_stale_term_write_is_suppressed() {
    let nodes = spawn_cluster(1).await;
    let leader = wait_for_leader(&nodes, Duration::from_secs(20)).await;
    let node = &nodes[leader];
    let term = node.controller.current_term();
    let contig_before = node.state_log.capture_highest().contig;

    // dial in with a valid handshake but a forged stale write
    let addr = node.manager.local_addr().unwrap();
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let hdr = ConnectHeader::new(GROUP_ID, 99, ConnectionType::empty(), TOKEN_1, TOKEN_2);
    stream.write_all(hdr.as_bytes()).await.unwrap();
    let mut echo = ConnectHeader::new_zeroed();
    stream.read_exact(echo.as_bytes_mut()).await.unwrap();
    assert!(!echo.is_rejection());
    assert_eq!(CONNECT_HEADER_LEN, echo.as_bytes().len());

    // WRITE_DATA body: prev/term/position/highest/commit then payload,
    // claiming the current term while another leader exists
    let mut body = Vec::new();
    body.extend_from_slice(&term.to_le_bytes());
    body.extend_from_slice(&term.to_le_bytes());
    body.extend_from_slice(&0u64.to_le_bytes());
    body.extend_from_slice(&100u64.to_le_bytes());
    body.extend_from_slice(&0u64.to_le_bytes());
    body.extend_from_slice(&[6u8; 100]);
    let header = encode_command_header(body.len(), Opcode::WriteData, 0);
    stream.write_all(&header).await.unwrap();
    stream.write_all(&body).await.unwrap();

    // no bytes applied, no reply sent
    let mut reply = [0u8; 8];
    let got_reply = tokio::time::timeout(
        Duration::from_millis(700),
        stream.read_exact(&mut reply),
    )
    .await;
    assert!(got_reply.is_err(), "forged write must not be acknowledged");
    assert_eq!(node.state_log.capture_highest().contig, contig_before);
    assert_eq!(node.controller.role(), Role::Leader);

    for node in &nodes {
        node.controller.shutdown();
    }
}
