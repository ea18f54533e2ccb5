//! End-to-end proxy system
//!
//! A client submits requests to a proxy; the proxy forwards each request to
//! the lowest-id server its failure detector believes alive and relays the
//! response, answering FAIL when no server is left. Servers run under
//! per-node monitors; the proxy's failure detector queries those monitors.
//!
//! The archetype bodies below are written the way the compiler emits them:
//! a match over labels, with all cross-section state in registers.

use std::time::Duration;

use may::coroutine;
use mpcal_runtime::core::funcs;
use mpcal_runtime::mailboxes::{MailboxConfig, MailboxKind, tcp_mailboxes};
use mpcal_runtime::monitor::{Monitor, MonitorConfig};
use mpcal_runtime::{
    ArchetypeContext, ChannelReader, ChannelWriter, CloseHandle, FailureDetectorConfig, Label,
    LocalRegister, Step, Value, failure_detector, input_channel, output_channel,
};
use serial_test::serial;

const NUM_SERVERS: i64 = 2;
const CLIENT_ID: i64 = 3;
const PROXY_ID: i64 = 4;
const FAIL: i64 = -1;

fn n(v: i64) -> Value {
    Value::number(v)
}

fn inbox_addr(base: u16, id: i64) -> String {
    format!("127.0.0.1:{}", base + id as u16)
}

fn monitor_addr(base: u16, id: i64) -> String {
    format!("127.0.0.1:{}", base + 10 + id as u16)
}

fn fast_mailbox() -> MailboxConfig {
    MailboxConfig {
        inbox_capacity: 64,
        read_wait: Duration::from_millis(25),
        reply_timeout: Duration::from_millis(500),
        connection_failure_limit: 10_000,
    }
}

fn fast_monitor() -> MonitorConfig {
    MonitorConfig {
        inactivity_window: Duration::from_millis(150),
        heartbeat_interval: Duration::from_millis(30),
        reply_timeout: Duration::from_millis(300),
    }
}

fn fast_fd() -> FailureDetectorConfig {
    FailureDetectorConfig {
        pull_interval: Duration::from_millis(30),
        timeout: Duration::from_millis(150),
        reply_timeout: Duration::from_millis(200),
    }
}

/// Mailbox routing: index `id` is this node's own inbox when `id == self`,
/// a peer's otherwise.
fn routes(base: u16, self_id: i64) -> impl Fn(&Value) -> Option<(MailboxKind, String)> + Send {
    move |index| {
        let id = index.as_number().ok()?;
        if !(1..=PROXY_ID).contains(&id) {
            return None;
        }
        let kind = if id == self_id {
            MailboxKind::Local
        } else {
            MailboxKind::Remote
        };
        Some((kind, inbox_addr(base, id)))
    }
}

fn message(typ: &str, from: i64, id: Value, body: Value) -> Value {
    Value::record([
        ("typ", Value::string(typ)),
        ("from", n(from)),
        ("id", id),
        ("body", body),
    ])
}

fn spawn_server(base: u16, id: i64) -> (CloseHandle, coroutine::JoinHandle<Monitor>) {
    let monitor = Monitor::spawn(monitor_addr(base, id), fast_monitor()).unwrap();
    let mut ctx = ArchetypeContext::builder(n(id))
        .resource("net", tcp_mailboxes(routes(base, id), fast_mailbox()))
        .retry_backoff(Duration::from_millis(2), Duration::from_millis(50))
        .body(Label("serverLoop"), move |ctx, _| {
            let net = ctx.resource_handle("net")?;
            let request = ctx.read(net, &[n(id)])?;
            let reply = message(
                "resp",
                id,
                funcs::field(&request, "id")?,
                n(id), // the response body is the server's identity
            );
            ctx.write(net, &[n(PROXY_ID)], reply)?;
            Ok(Step::Goto(Label("serverLoop")))
        })
        .build()
        .unwrap();
    let close = ctx.close_handle();
    let handle = unsafe {
        coroutine::spawn(move || {
            monitor.run_archetype(&mut ctx).unwrap();
            monitor
        })
    };
    (close, handle)
}

fn spawn_proxy(base: u16) -> (CloseHandle, coroutine::JoinHandle<()>) {
    let mut ctx = ArchetypeContext::builder(n(PROXY_ID))
        .constant("NUM_SERVERS", n(NUM_SERVERS))
        .constant("FAIL", n(FAIL))
        .resource("net", tcp_mailboxes(routes(base, PROXY_ID), fast_mailbox()))
        .resource(
            "fd",
            failure_detector(move |peer| Some(monitor_addr(base, peer.as_number().ok()?)), fast_fd()),
        )
        .resource("req", LocalRegister::maker(n(0)))
        .resource("srv", LocalRegister::maker(n(0)))
        .resource("resp", LocalRegister::maker(n(0)))
        .retry_backoff(Duration::from_millis(2), Duration::from_millis(50))
        .body(Label("proxyRcv"), move |ctx, label| {
            let net = ctx.resource_handle("net")?;
            let fd = ctx.resource_handle("fd")?;
            let req = ctx.resource_handle("req")?;
            let srv = ctx.resource_handle("srv")?;
            let resp = ctx.resource_handle("resp")?;
            match label.name() {
                "proxyRcv" => {
                    let m = ctx.read(net, &[n(PROXY_ID)])?;
                    if funcs::field(&m, "typ")? == Value::string("req") {
                        ctx.write(req, &[], m)?;
                        ctx.write(srv, &[], n(1))?;
                        Ok(Step::Goto(Label("proxyTry")))
                    } else {
                        // stale response from a server already given up on
                        Ok(Step::Goto(Label("proxyRcv")))
                    }
                }
                "proxyTry" => {
                    let s = ctx.read(srv, &[])?.as_number()?;
                    if s > ctx.constant("NUM_SERVERS")?.as_number()? {
                        return Ok(Step::Goto(Label("proxyFail")));
                    }
                    if ctx.read(fd, &[n(s)])?.as_bool()? {
                        ctx.write(srv, &[], n(s + 1))?;
                        return Ok(Step::Goto(Label("proxyTry")));
                    }
                    let m = ctx.read(req, &[])?;
                    let forwarded = message(
                        "req",
                        PROXY_ID,
                        funcs::field(&m, "id")?,
                        funcs::field(&m, "body")?,
                    );
                    ctx.write(net, &[n(s)], forwarded)?;
                    Ok(Step::Goto(Label("proxyAwait")))
                }
                "proxyAwait" => {
                    let s = ctx.read(srv, &[])?.as_number()?;
                    if ctx.read(fd, &[n(s)])?.as_bool()? {
                        // the server died after taking the request
                        ctx.write(srv, &[], n(s + 1))?;
                        return Ok(Step::Goto(Label("proxyTry")));
                    }
                    let r = ctx.read(net, &[n(PROXY_ID)])?;
                    if funcs::field(&r, "typ")? == Value::string("resp") {
                        ctx.write(resp, &[], r)?;
                        Ok(Step::Goto(Label("proxyReply")))
                    } else {
                        Ok(Step::Goto(Label("proxyAwait")))
                    }
                }
                "proxyReply" => {
                    let r = ctx.read(resp, &[])?;
                    let m = ctx.read(req, &[])?;
                    let client = funcs::field(&m, "from")?;
                    let reply = message(
                        "resp",
                        PROXY_ID,
                        funcs::field(&r, "id")?,
                        funcs::field(&r, "body")?,
                    );
                    ctx.write(net, &[client], reply)?;
                    Ok(Step::Goto(Label("proxyRcv")))
                }
                "proxyFail" => {
                    let m = ctx.read(req, &[])?;
                    let client = funcs::field(&m, "from")?;
                    let fail = ctx.constant("FAIL")?.clone();
                    let reply = message("resp", PROXY_ID, funcs::field(&m, "id")?, fail);
                    ctx.write(net, &[client], reply)?;
                    Ok(Step::Goto(Label("proxyRcv")))
                }
                other => unreachable!("unknown proxy label {other}"),
            }
        })
        .build()
        .unwrap();
    let close = ctx.close_handle();
    let handle = unsafe { coroutine::spawn(move || ctx.run().unwrap()) };
    (close, handle)
}

fn spawn_client(
    base: u16,
) -> (
    ChannelWriter,
    ChannelReader,
    CloseHandle,
    coroutine::JoinHandle<()>,
) {
    let (feed, in_maker) = input_channel();
    let (responses, out_maker) = output_channel();
    let mut ctx = ArchetypeContext::builder(n(CLIENT_ID))
        .resource("net", tcp_mailboxes(routes(base, CLIENT_ID), fast_mailbox()))
        .resource("in", in_maker)
        .resource("out", out_maker)
        .retry_backoff(Duration::from_millis(2), Duration::from_millis(50))
        .body(Label("clientReq"), move |ctx, label| {
            let net = ctx.resource_handle("net")?;
            let input = ctx.resource_handle("in")?;
            let out = ctx.resource_handle("out")?;
            match label.name() {
                "clientReq" => {
                    let v = ctx.read(input, &[])?;
                    let request = message("req", CLIENT_ID, v.clone(), v);
                    ctx.write(net, &[n(PROXY_ID)], request)?;
                    Ok(Step::Goto(Label("clientRcv")))
                }
                "clientRcv" => {
                    let r = ctx.read(net, &[n(CLIENT_ID)])?;
                    ctx.write(out, &[], r)?;
                    Ok(Step::Goto(Label("clientReq")))
                }
                other => unreachable!("unknown client label {other}"),
            }
        })
        .build()
        .unwrap();
    let close = ctx.close_handle();
    let handle = unsafe { coroutine::spawn(move || ctx.run().unwrap()) };
    (feed, responses, close, handle)
}

/// Push `count` requests through and assert every response body.
fn run_round(feed: &ChannelWriter, responses: &ChannelReader, count: i64, expected_body: i64) {
    for i in 0..count {
        feed.send(n(i)).unwrap();
    }
    for i in 0..count {
        let r = responses
            .recv_timeout(Duration::from_secs(30))
            .unwrap_or_else(|| panic!("no response to request {i}"));
        assert_eq!(funcs::field(&r, "id").unwrap(), n(i));
        assert_eq!(
            funcs::field(&r, "body").unwrap(),
            n(expected_body),
            "wrong body in response {i}: {r}"
        );
    }
}

#[test]
#[serial]
fn test_proxy_all_servers_up() {
    let base = 21000;
    let (s1_close, s1) = spawn_server(base, 1);
    let (s2_close, s2) = spawn_server(base, 2);
    let (p_close, p) = spawn_proxy(base);
    let (feed, responses, c_close, c) = spawn_client(base);

    // the proxy prefers the lowest-id live server
    run_round(&feed, &responses, 10, 1);

    c_close.close();
    p_close.close();
    s1_close.close();
    s2_close.close();
    c.join().unwrap();
    p.join().unwrap();
    s1.join().unwrap().close();
    s2.join().unwrap().close();
}

#[test]
#[serial]
fn test_proxy_second_server_only() {
    let base = 21100;
    let (s2_close, s2) = spawn_server(base, 2);
    let (p_close, p) = spawn_proxy(base);
    let (feed, responses, c_close, c) = spawn_client(base);

    run_round(&feed, &responses, 10, 2);

    c_close.close();
    p_close.close();
    s2_close.close();
    c.join().unwrap();
    p.join().unwrap();
    s2.join().unwrap().close();
}

#[test]
#[serial]
fn test_proxy_no_servers() {
    let base = 21200;
    let (p_close, p) = spawn_proxy(base);
    let (feed, responses, c_close, c) = spawn_client(base);

    run_round(&feed, &responses, 10, FAIL);

    c_close.close();
    p_close.close();
    c.join().unwrap();
    p.join().unwrap();
}

#[test]
#[serial]
fn test_proxy_primary_crashes_mid_run() {
    let base = 21300;
    let (s1_close, s1) = spawn_server(base, 1);
    let (s2_close, s2) = spawn_server(base, 2);
    let (p_close, p) = spawn_proxy(base);
    let (feed, responses, c_close, c) = spawn_client(base);

    run_round(&feed, &responses, 10, 1);

    // crash the primary; its monitor stays up and reports it suspected
    s1_close.close();
    let m1 = s1.join().unwrap();
    std::thread::sleep(Duration::from_millis(300));

    run_round(&feed, &responses, 10, 2);

    c_close.close();
    p_close.close();
    s2_close.close();
    c.join().unwrap();
    p.join().unwrap();
    m1.close();
    s2.join().unwrap().close();
}
