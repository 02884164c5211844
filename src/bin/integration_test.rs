use blocklock::protocol::{Reply, ReplyCodec};
use clap::{Arg, Command};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::{
    process,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::Framed;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[allow(dead_code)]
#[derive(Debug)]
struct TestResult {
    name: String,
    success: bool,
    duration_ms: u128,
    error: Option<String>,
}

/// One RESP connection, i.e. one lock client as far as the server is concerned.
struct Conn {
    framed: Framed<TcpStream, ReplyCodec>,
    verbose: bool,
}

impl Conn {
    async fn open(addr: &str, verbose: bool) -> Result<Self, String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| format!("Connect to {} failed: {}", addr, e))?;
        Ok(Self {
            framed: Framed::new(stream, ReplyCodec),
            verbose,
        })
    }

    async fn send(&mut self, parts: &[&str]) -> Result<(), String> {
        if self.verbose {
            println!("  → {}", parts.join(" "));
        }
        self.framed
            .send(Reply::command(parts))
            .await
            .map_err(|e| format!("Write failed: {}", e))
    }

    async fn read_reply(&mut self) -> Result<Reply, String> {
        match self.framed.next().await {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(format!("Read failed: {}", e)),
            None => Err("Server closed the connection".to_string()),
        }
    }

    async fn recv_within(&mut self, limit: Duration) -> Result<Reply, String> {
        let reply = timeout(limit, self.read_reply())
            .await
            .map_err(|_| format!("No reply within {}ms", limit.as_millis()))??;

        if self.verbose {
            println!("    ← {:?}", reply);
        }
        Ok(reply)
    }

    async fn recv(&mut self) -> Result<Reply, String> {
        self.recv_within(REPLY_TIMEOUT).await
    }

    async fn call(&mut self, parts: &[&str]) -> Result<Reply, String> {
        self.send(parts).await?;
        self.recv().await
    }

    /// Succeeds if nothing arrives within `window`.
    async fn expect_silence(&mut self, window: Duration) -> Result<(), String> {
        match self.recv_within(window).await {
            Ok(reply) => Err(format!("Expected to stay blocked, got {:?}", reply)),
            Err(_) => Ok(()),
        }
    }
}

fn expect(reply: Reply, wanted: Reply) -> Result<(), String> {
    if reply == wanted {
        Ok(())
    } else {
        Err(format!("Expected {:?}, got {:?}", wanted, reply))
    }
}

struct TestRunner {
    addr: String,
    verbose: bool,
    prefix: String,
    results: Vec<TestResult>,
}

impl TestRunner {
    fn new(addr: String, verbose: bool) -> Self {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or_default();
        Self {
            addr,
            verbose,
            prefix: format!("integration-test-{:x}", nonce),
            results: Vec::new(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}-{}", self.prefix, name)
    }

    async fn conn(&self) -> Result<Conn, String> {
        Conn::open(&self.addr, self.verbose).await
    }

    fn add_test_result(&mut self, name: &str, duration_ms: u128, outcome: Result<(), String>) {
        let success = outcome.is_ok();
        let status = if success { "\x1b[32m✅" } else { "\x1b[31m❌" };
        println!(" {} {:.<45} \x1b[90m({:>4}ms)\x1b[0m", status, format!("{} ", name), duration_ms);
        let error = outcome.err();
        if let Some(ref err) = error {
            println!("    \x1b[31m{}\x1b[0m", err);
        }

        self.results.push(TestResult {
            name: name.to_string(),
            success,
            duration_ms,
            error,
        });
    }

    async fn cleanup(&self) {
        println!("\n🧹 Cleaning up keys...");
        if let Ok(mut conn) = self.conn().await {
            let keys: Vec<String> = ["basic", "fifo", "expiry", "disconnect", "types", "overwrite"]
                .iter()
                .map(|name| self.key(name))
                .collect();
            let mut parts = vec!["DEL"];
            parts.extend(keys.iter().map(String::as_str));
            let _ = conn.call(&parts).await;
        }
    }

    fn print_summary(&self) {
        let total = self.results.len();
        let passed = self.results.iter().filter(|r| r.success).count();
        let failed = total - passed;

        println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed == 0 {
            println!("\x1b[32mResults: {}/{} passed\x1b[0m", passed, total);
        } else {
            println!("\x1b[31mResults: {}/{} passed, {} failed\x1b[0m", passed, total, failed);
            process::exit(1);
        }
    }
}

async fn ping(runner: &TestRunner) -> Result<(), String> {
    let mut conn = runner.conn().await?;
    expect(conn.call(&["PING"]).await?, Reply::Simple("PONG".into()))
}

async fn acquire_and_release(runner: &TestRunner) -> Result<(), String> {
    let key = runner.key("basic");
    let mut conn = runner.conn().await?;
    expect(conn.call(&["LOCK", &key, "60000"]).await?, Reply::Integer(1))?;
    expect(conn.call(&["LOCK", &key, "60000"]).await?, Reply::Integer(0))?;
    expect(conn.call(&["TYPE", &key]).await?, Reply::Simple("blocklock".into()))?;
    expect(conn.call(&["UNLOCK", &key]).await?, Reply::Integer(1))?;
    expect(conn.call(&["UNLOCK", &key]).await?, Reply::Integer(0))?;
    expect(conn.call(&["EXISTS", &key]).await?, Reply::Integer(0))
}

async fn fifo_handoff(runner: &TestRunner) -> Result<(), String> {
    let key = runner.key("fifo");
    let mut first = runner.conn().await?;
    let mut second = runner.conn().await?;
    let mut third = runner.conn().await?;

    expect(first.call(&["LOCK", &key, "60000"]).await?, Reply::Integer(1))?;
    second.send(&["LOCK", &key, "60000"]).await?;
    second.expect_silence(Duration::from_millis(100)).await?;
    third.send(&["LOCK", &key, "60000"]).await?;
    third.expect_silence(Duration::from_millis(100)).await?;

    expect(first.call(&["UNLOCK", &key]).await?, Reply::Integer(1))?;
    expect(second.recv().await?, Reply::Integer(1))?;
    third.expect_silence(Duration::from_millis(100)).await?;

    expect(second.call(&["UNLOCK", &key]).await?, Reply::Integer(1))?;
    expect(third.recv().await?, Reply::Integer(1))?;
    expect(third.call(&["UNLOCK", &key]).await?, Reply::Integer(1))
}

async fn lease_expiry(runner: &TestRunner) -> Result<(), String> {
    let key = runner.key("expiry");
    let mut holder = runner.conn().await?;
    let mut waiter = runner.conn().await?;

    expect(holder.call(&["LOCK", &key, "200"]).await?, Reply::Integer(1))?;
    let started = Instant::now();
    waiter.send(&["LOCK", &key, "60000"]).await?;
    expect(waiter.recv().await?, Reply::Integer(1))?;
    if started.elapsed() < Duration::from_millis(150) {
        return Err(format!("Lock handed over after only {}ms", started.elapsed().as_millis()));
    }

    expect(holder.call(&["UNLOCK", &key]).await?, Reply::Integer(0))?;
    expect(waiter.call(&["UNLOCK", &key]).await?, Reply::Integer(1))
}

async fn waiter_disconnect(runner: &TestRunner) -> Result<(), String> {
    let key = runner.key("disconnect");
    let mut holder = runner.conn().await?;
    let mut quitter = runner.conn().await?;
    let mut patient = runner.conn().await?;

    expect(holder.call(&["LOCK", &key, "60000"]).await?, Reply::Integer(1))?;
    quitter.send(&["LOCK", &key, "60000"]).await?;
    quitter.expect_silence(Duration::from_millis(100)).await?;
    patient.send(&["LOCK", &key, "60000"]).await?;
    patient.expect_silence(Duration::from_millis(100)).await?;
    drop(quitter);

    let deadline = Instant::now() + REPLY_TIMEOUT;
    loop {
        if let Reply::Array(fields) = holder.call(&["LOCKINFO", &key]).await? {
            if matches!(fields.get(9), Some(Reply::Array(waiting)) if waiting.len() == 1) {
                break;
            }
        }
        if Instant::now() > deadline {
            return Err("Disconnected waiter was never dropped from the queue".to_string());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    expect(holder.call(&["UNLOCK", &key]).await?, Reply::Integer(1))?;
    expect(patient.recv().await?, Reply::Integer(1))?;
    expect(patient.call(&["UNLOCK", &key]).await?, Reply::Integer(1))
}

async fn type_checks(runner: &TestRunner) -> Result<(), String> {
    let key = runner.key("types");
    let mut conn = runner.conn().await?;

    expect(conn.call(&["SET", &key, "plain"]).await?, Reply::ok())?;
    let reply = conn.call(&["UNLOCK", &key]).await?;
    match reply {
        Reply::Error(ref msg) if msg.starts_with("WRONGTYPE") => {}
        other => return Err(format!("Expected WRONGTYPE, got {:?}", other)),
    }
    expect(conn.call(&["GET", &key]).await?, Reply::bulk("plain"))?;

    match conn.call(&["LOCK", &key, "-5"]).await? {
        Reply::Error(ref msg) if msg == "ERR invalid timeout" => {}
        other => return Err(format!("Expected invalid timeout, got {:?}", other)),
    }
    expect(conn.call(&["DEL", &key]).await?, Reply::Integer(1))
}

async fn overwrite_wakes_waiters(runner: &TestRunner) -> Result<(), String> {
    let key = runner.key("overwrite");
    let mut holder = runner.conn().await?;
    let mut waiter = runner.conn().await?;

    expect(holder.call(&["LOCK", &key, "60000"]).await?, Reply::Integer(1))?;
    waiter.send(&["LOCK", &key, "60000"]).await?;
    waiter.expect_silence(Duration::from_millis(100)).await?;

    expect(holder.call(&["DEL", &key]).await?, Reply::Integer(1))?;
    expect(waiter.recv().await?, Reply::Integer(0))
}

async fn stats(runner: &TestRunner) -> Result<(), String> {
    let mut conn = runner.conn().await?;
    let Reply::Bulk(Some(body)) = conn.call(&["STATS"]).await? else {
        return Err("Expected a bulk reply".to_string());
    };
    let json: Value = serde_json::from_slice(&body).map_err(|e| format!("Bad STATS JSON: {}", e))?;
    if json.get("locks").and_then(Value::as_u64).is_none() {
        return Err(format!("Missing 'locks' in {}", json));
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = Command::new("blocklock-test")
        .about("blocklock integration tests")
        .arg(
            Arg::new("addr")
                .long("addr")
                .value_name("HOST:PORT")
                .help("Server address to test against")
                .default_value("127.0.0.1:6390"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .help("Print every command and reply")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let addr = matches
        .get_one::<String>("addr")
        .cloned()
        .unwrap_or_else(|| "127.0.0.1:6390".to_string());
    let verbose = matches.get_flag("verbose");

    println!("\x1b[1m🔒 blocklock Integration Tests\x1b[0m");
    println!("\x1b[90m   Target: {}\x1b[0m\n", addr);

    let mut runner = TestRunner::new(addr, verbose);

    macro_rules! run {
        ($name:expr, $scenario:ident) => {{
            let start = Instant::now();
            let outcome = $scenario(&runner).await;
            runner.add_test_result($name, start.elapsed().as_millis(), outcome);
        }};
    }

    run!("Ping", ping);
    run!("Acquire and Release", acquire_and_release);
    run!("FIFO Handoff", fifo_handoff);
    run!("Lease Expiry", lease_expiry);
    run!("Waiter Disconnect", waiter_disconnect);
    run!("Type Checks", type_checks);
    run!("Delete Wakes Waiters", overwrite_wakes_waiters);
    run!("Stats", stats);

    runner.cleanup().await;
    runner.print_summary();
}
