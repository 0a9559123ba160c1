use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, TimeZone, Utc};
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

use faktory::clock::format_ts;
use faktory::{Clock, Job, ManualClock, Server};
use faktory_config::ServerOptions;
use faktory_protocol::{
    Hi, MAX_LINE_LEN, Reply, WorkerState, hash_password, read_reply, write_request,
};

struct TestServer {
    server: Arc<Server>,
    clock: Arc<ManualClock>,
    addr: SocketAddr,
    serving: Option<JoinHandle<anyhow::Result<()>>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(configure: impl FnOnce(&mut ServerOptions)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut options = ServerOptions::development(dir.path());
        configure(&mut options);
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_001, 0).unwrap(),
        ));
        let shared: Arc<dyn Clock> = clock.clone();
        let server = Arc::new(Server::with_clock(options, shared).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = tokio::spawn(server.clone().serve(listener));
        Self {
            server,
            clock,
            addr,
            serving: Some(serving),
            _dir: dir,
        }
    }

    async fn producer(&self) -> Client {
        let (mut client, _) = Client::open(self.addr).await;
        client.hello(json!({"hostname": "h", "pid": 1, "v": 2})).await;
        client
    }

    async fn consumer(&self, wid: &str) -> Client {
        let (mut client, _) = Client::open(self.addr).await;
        client
            .hello(json!({"hostname": "h", "wid": wid, "pid": 1, "labels": [], "v": 2}))
            .await;
        client
    }

    fn run_task(&self, name: &str) -> usize {
        self.server
            .tasks()
            .run_named(name, self.clock.now())
            .unwrap()
    }

    async fn stop(mut self) {
        self.server.shutdown_handle().shutdown();
        if let Some(serving) = self.serving.take() {
            tokio::time::timeout(Duration::from_secs(5), serving)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn open(addr: SocketAddr) -> (Self, Hi) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let Reply::Simple(greeting) = client.read().await else {
            panic!("expected +HI greeting");
        };
        let hi: Hi = serde_json::from_str(greeting.strip_prefix("HI ").unwrap()).unwrap();
        (client, hi)
    }

    async fn hello(&mut self, hello: Value) {
        assert_eq!(self.send("HELLO", Some(&hello.to_string())).await, Reply::ok());
    }

    async fn send(&mut self, verb: &str, payload: Option<&str>) -> Reply {
        write_request(&mut self.writer, verb, payload).await.unwrap();
        self.read().await
    }

    async fn send_raw(&mut self, line: &[u8]) -> Reply {
        self.writer.write_all(line).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
        self.writer.flush().await.unwrap();
        self.read().await
    }

    async fn send_json(&mut self, verb: &str, payload: Value) -> Reply {
        self.send(verb, Some(&payload.to_string())).await
    }

    async fn read(&mut self) -> Reply {
        tokio::time::timeout(Duration::from_secs(5), read_reply(&mut self.reader))
            .await
            .unwrap()
            .unwrap()
    }

    async fn fetch(&mut self, queues: &str) -> Option<Job> {
        match self.send("FETCH", Some(queues)).await {
            Reply::Bulk(Some(payload)) => Some(serde_json::from_slice(&payload).unwrap()),
            Reply::Bulk(None) => None,
            other => panic!("unexpected FETCH reply {other:?}"),
        }
    }
}

#[tokio::test]
async fn handshake_verifies_password_hash() {
    let server = TestServer::start_with(|options| {
        options.password = Some("secret".to_string());
    })
    .await;

    let (mut client, hi) = Client::open(server.addr).await;
    assert_eq!(hi.v, 2);
    let salt = hi.salt.unwrap();
    let iterations = hi.iterations.unwrap();
    assert!((4000..=8096).contains(&iterations));
    let pwdhash = hash_password("secret", &salt, iterations);
    client
        .hello(json!({
            "hostname": "h", "wid": "", "pid": 1, "labels": ["x"],
            "pwdhash": pwdhash, "v": 2,
        }))
        .await;
    assert!(!client.send("INFO", None).await.is_error());

    let (mut rejected, hi) = Client::open(server.addr).await;
    assert!(hi.salt.is_some());
    let reply = rejected
        .send_json("HELLO", json!({"hostname": "h", "pid": 1, "pwdhash": "nope", "v": 2}))
        .await;
    assert_eq!(reply, Reply::err("Invalid password"));

    server.stop().await;
}

#[tokio::test]
async fn push_fetch_ack() {
    let server = TestServer::start().await;
    let mut producer = server.producer().await;
    let mut worker = server.consumer("w1").await;

    let reply = producer
        .send_json(
            "PUSH",
            json!({"jid": "aaaaaaaa", "jobtype": "J", "queue": "default", "args": []}),
        )
        .await;
    assert_eq!(reply, Reply::ok());

    let job = worker.fetch("default").await.unwrap();
    assert_eq!(job.jid, "aaaaaaaa");
    assert!(job.enqueued_at.is_some());
    assert_eq!(
        worker.send_json("ACK", json!({"jid": "aaaaaaaa"})).await,
        Reply::ok()
    );
    assert!(worker.fetch("default").await.is_none());
    assert_eq!(server.server.store().total_processed().unwrap(), 1);

    server.stop().await;
}

#[tokio::test]
async fn fetch_honors_priority() {
    let server = TestServer::start().await;
    let mut producer = server.producer().await;
    let mut worker = server.consumer("w1").await;

    for (jid, priority, arg) in [("job-0001", 1, "a"), ("job-0002", 9, "b"), ("job-0003", 5, "c")] {
        let reply = producer
            .send_json(
                "PUSH",
                json!({"jid": jid, "jobtype": "J", "queue": "q", "priority": priority, "args": [arg]}),
            )
            .await;
        assert_eq!(reply, Reply::ok());
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        let job = worker.fetch("q").await.unwrap();
        order.push(job.args.unwrap()[0].clone());
    }
    assert_eq!(order, vec![json!("b"), json!("c"), json!("a")]);

    server.stop().await;
}

#[tokio::test]
async fn exhausted_retries_land_in_dead() {
    let server = TestServer::start().await;
    let mut worker = server.consumer("w1").await;
    let reply = worker
        .send_json(
            "PUSH",
            json!({"jid": "aaaaaaaa", "jobtype": "J", "retry": 3, "args": []}),
        )
        .await;
    assert_eq!(reply, Reply::ok());

    for attempt in 0..3 {
        let job = worker.fetch("default").await.unwrap();
        assert_eq!(job.jid, "aaaaaaaa");
        let reply = worker
            .send_json(
                "FAIL",
                json!({"jid": "aaaaaaaa", "errtype": "RuntimeError", "message": "boom"}),
            )
            .await;
        assert_eq!(reply, Reply::ok());
        if attempt < 2 {
            assert_eq!(server.server.store().retries().size(), 1);
            server.clock.advance(TimeDelta::seconds(200));
            assert_eq!(server.run_task("retries"), 1);
        }
    }

    let store = server.server.store();
    assert_eq!(store.retries().size(), 0);
    let dead = store.dead().page(0, 10).unwrap();
    assert_eq!(dead.len(), 1);
    let job: Job = dead[0].decode().unwrap();
    let failure = job.failure.unwrap();
    assert_eq!(failure.retry_count, 2);
    assert_eq!(failure.errtype, "RuntimeError");

    server.stop().await;
}

#[tokio::test]
async fn expired_reservation_moves_to_retries() {
    let server = TestServer::start().await;
    let mut worker = server.consumer("w1").await;
    worker
        .send_json(
            "PUSH",
            json!({"jid": "aaaaaaaa", "jobtype": "J", "reserve_for": 60, "args": []}),
        )
        .await;
    assert!(worker.fetch("default").await.is_some());
    assert_eq!(server.server.manager().working_count(), 1);

    server.clock.advance(TimeDelta::seconds(65));
    assert_eq!(server.run_task("reservations"), 1);

    let retries = server.server.store().retries().page(0, 10).unwrap();
    assert_eq!(retries.len(), 1);
    let job: Job = retries[0].decode().unwrap();
    assert_eq!(job.failure.unwrap().errtype, "ReservationExpired");
    assert_eq!(server.server.manager().working_count(), 0);

    let reply = worker.send_json("ACK", json!({"jid": "aaaaaaaa"})).await;
    assert_eq!(reply, Reply::ok());

    server.stop().await;
}

#[tokio::test]
async fn scheduled_job_is_promoted_when_due() {
    let server = TestServer::start().await;
    let mut worker = server.consumer("w1").await;
    let at = format_ts(server.clock.now() + TimeDelta::seconds(2));
    let reply = worker
        .send_json(
            "PUSH",
            json!({"jid": "aaaaaaaa", "jobtype": "J", "at": at, "args": []}),
        )
        .await;
    assert_eq!(reply, Reply::ok());
    assert!(worker.fetch("default").await.is_none());
    assert_eq!(server.server.store().scheduled().size(), 1);

    server.clock.advance(TimeDelta::seconds(5));
    assert_eq!(server.run_task("scheduled"), 1);
    assert_eq!(worker.fetch("default").await.unwrap().jid, "aaaaaaaa");

    server.stop().await;
}

#[tokio::test]
async fn beat_reports_signalled_state() {
    let server = TestServer::start().await;
    let mut worker = server.consumer("w1").await;

    assert_eq!(worker.send_json("BEAT", json!({"wid": "w1"})).await, Reply::ok());
    server
        .server
        .workers()
        .signal("w1", WorkerState::Quiet)
        .unwrap();
    let reply = worker.send_json("BEAT", json!({"wid": "w1"})).await;
    assert_eq!(reply, Reply::bulk(br#"{"state":"quiet"}"#.to_vec()));

    let reply = worker.send_json("BEAT", json!({"wid": "unknown"})).await;
    assert!(reply.is_error());

    server.stop().await;
}

#[tokio::test]
async fn queue_commands_and_errors_keep_session_open() {
    let server = TestServer::start().await;
    let mut client = server.producer().await;

    let reply = client
        .send_json("PUSH", json!({"jid": "short", "jobtype": "J", "args": []}))
        .await;
    assert!(reply.is_error());
    assert!(client.send("BOGUS", None).await.is_error());
    assert_eq!(
        client.send("TRACK", Some("GET abc")).await,
        Reply::err("TRACK is not supported")
    );

    client
        .send_json("PUSH", json!({"jid": "aaaaaaaa", "jobtype": "J", "args": []}))
        .await;
    assert_eq!(client.send("QUEUE", Some("PAUSE *")).await, Reply::ok());
    assert!(server.server.store().get_queue("default").unwrap().is_paused());
    assert_eq!(client.send("QUEUE", Some("RESUME default")).await, Reply::ok());

    let Reply::Bulk(Some(latency)) = client.send("QUEUE", Some("LATENCY default")).await else {
        panic!("expected latency map");
    };
    let latency: Value = serde_json::from_slice(&latency).unwrap();
    assert!(latency["default"].is_number());

    let Reply::Bulk(Some(info)) = client.send("INFO", None).await else {
        panic!("expected INFO document");
    };
    let info: Value = serde_json::from_slice(&info).unwrap();
    assert_eq!(info["faktory"]["queues"]["default"], 1);
    assert_eq!(info["server"]["connections"], 1);

    assert_eq!(client.send("FLUSH", None).await, Reply::ok());
    assert_eq!(server.server.store().total_enqueued(), 0);

    server.stop().await;
}

#[tokio::test]
async fn legacy_clients_hash_the_password_once() {
    let server = TestServer::start_with(|options| {
        options.password = Some("secret".to_string());
    })
    .await;

    let (mut client, hi) = Client::open(server.addr).await;
    let pwdhash = hash_password("secret", &hi.salt.unwrap(), 1);
    client
        .hello(json!({"hostname": "h", "pid": 1, "pwdhash": pwdhash, "v": 1}))
        .await;
    assert!(!client.send("INFO", None).await.is_error());

    server.stop().await;
}

#[tokio::test]
async fn repeated_ack_leaves_working_set_alone() {
    let server = TestServer::start().await;
    let mut worker = server.consumer("w1").await;
    for jid in ["aaaaaaaa", "bbbbbbbb"] {
        let reply = worker
            .send_json("PUSH", json!({"jid": jid, "jobtype": "J", "args": []}))
            .await;
        assert_eq!(reply, Reply::ok());
        assert!(worker.fetch("default").await.is_some());
    }
    let store = server.server.store();
    assert_eq!(store.working().size(), 2);

    for _ in 0..2 {
        let reply = worker.send_json("ACK", json!({"jid": "aaaaaaaa"})).await;
        assert_eq!(reply, Reply::ok());
        assert_eq!(store.working().size(), 1);
    }
    assert_eq!(store.total_processed().unwrap(), 1);
    assert!(server.server.manager().reservation("bbbbbbbb").is_some());

    server.stop().await;
}

#[tokio::test]
async fn bad_lines_get_errors_and_session_survives() {
    let server = TestServer::start().await;
    let mut client = server.producer().await;

    assert!(client.send_raw(b"PUSH \xff\xfe{}").await.is_error());

    let mut oversized = b"PUSH ".to_vec();
    oversized.resize(MAX_LINE_LEN + 16, b'x');
    assert!(client.send_raw(&oversized).await.is_error());

    let reply = client
        .send_json("PUSH", json!({"jid": "aaaaaaaa", "jobtype": "J", "args": []}))
        .await;
    assert_eq!(reply, Reply::ok());
    assert_eq!(server.server.store().total_enqueued(), 1);

    server.stop().await;
}

#[tokio::test]
async fn silent_clients_are_dropped_after_handshake_timeout() {
    let server = TestServer::start().await;
    let (mut client, _) = Client::open(server.addr).await;

    assert_eq!(client.read().await, Reply::err("handshake timed out"));
    let closed = tokio::time::timeout(Duration::from_secs(5), read_reply(&mut client.reader))
        .await
        .unwrap();
    assert!(closed.is_err());

    server.stop().await;
}

#[tokio::test]
async fn shutdown_interrupts_pending_handshake() {
    let mut server = TestServer::start().await;
    let (mut client, _) = Client::open(server.addr).await;

    server.server.shutdown_handle().shutdown();
    assert_eq!(client.read().await, Reply::err("server is shutting down"));

    let serving = server.serving.take().unwrap();
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
