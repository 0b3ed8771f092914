mod common;

use common::*;
use crossbeam::channel::{unbounded, Receiver, Sender};
use selftest_rpc::{
    BulkDescriptor, ClientRpc, EngineState, EventKind, EventTarget, MdBuffer, MdOp, MsgBody, Payload, PingServer,
    Portal, Region, RpcError, ServerCall, ServiceHandler, SrpcMsg, Transport, WireOrder, MSG_SIZE, MSG_VERSION,
    SERVICE_BRW, SERVICE_DEBUG, SERVICE_MAX_ID, SERVICE_PING,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Holds every call until the test lets go.
struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

impl ServiceHandler for Gate {
    fn handle(&self, call: &mut ServerCall) -> selftest_rpc::Result<()> {
        let _ = self.entered.send(());
        let _ = self.release.recv();
        call.reply(0, Payload::Empty);
        Ok(())
    }
}

fn gate() -> (Gate, Receiver<()>, Sender<()>) {
    let (entered_tx, entered_rx) = unbounded();
    let (release_tx, release_rx) = unbounded();
    (Gate { entered: entered_tx, release: release_rx }, entered_rx, release_tx)
}

struct Echo;

impl ServiceHandler for Echo {
    fn handle(&self, call: &mut ServerCall) -> selftest_rpc::Result<()> {
        let payload = call.request_payload().clone();
        call.reply(0, payload);
        Ok(())
    }
}

#[test]
fn concurrency_limit_blocks_extra_requests() {
    let pair = Pair::new();
    let (handler, entered, release) = gate();
    let sv = pair.server.register_service(SERVICE_BRW, "brw_test", 4, handler).unwrap();
    pair.server.add_buffers(&sv, 6).unwrap();

    let done = Completions::new();
    for _ in 0..6 {
        post(&pair.client, done.attach(ClientRpc::builder(pair.server_id(), SERVICE_BRW)));
    }
    wait_until(|| sv.active_rpcs() == 4 && sv.blocked_requests() == 2);
    assert_eq!(sv.free_slots(), 0);
    for _ in 0..4 {
        entered.recv_timeout(Duration::from_secs(10)).unwrap();
    }
    done.assert_idle(Duration::from_millis(20));

    drop(release);
    for _ in 0..6 {
        done.next().remote_result().unwrap();
    }
    wait_until(|| sv.active_rpcs() == 0 && sv.blocked_requests() == 0 && sv.free_slots() == 4);
    pair.teardown(&[sv]);
}

#[test]
fn control_service_holds_requests_in_lazy_portal() {
    let pair = Pair::new();
    let (handler, entered, release) = gate();
    let sv = pair.server.register_service(SERVICE_DEBUG, "debug", 4, handler).unwrap();
    pair.server.add_buffers(&sv, 4).unwrap();

    let done = Completions::new();
    for _ in 0..6 {
        post(&pair.client, done.attach(ClientRpc::builder(pair.server_id(), SERVICE_DEBUG)));
    }
    wait_until(|| sv.active_rpcs() == 4 && sv.posted_buffers() == 0);
    assert_eq!(sv.blocked_requests(), 0);
    // control handlers run one at a time
    entered.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(entered.recv_timeout(Duration::from_millis(20)).is_err());

    drop(release);
    for _ in 0..6 {
        done.next().remote_result().unwrap();
    }
    wait_until(|| sv.active_rpcs() == 0 && sv.posted_buffers() == 4);
    wait_until(|| pair.server.get_counters().rpcs_rcvd == 6);
    pair.teardown(&[sv]);
}

#[test]
fn finish_waits_for_active_rpcs() {
    let pair = Pair::new();
    let (handler, entered, release) = gate();
    let sv = pair.server.register_service(SERVICE_BRW, "brw_test", 1, handler).unwrap();
    pair.server.add_buffers(&sv, 2).unwrap();

    let done = Completions::new();
    post(&pair.client, done.attach(ClientRpc::builder(pair.server_id(), SERVICE_BRW)));
    entered.recv_timeout(Duration::from_secs(10)).unwrap();

    pair.server.shutdown_service(&sv);
    assert!(sv.is_shutting_down());
    assert!(!pair.server.finish_service(&sv));
    assert!(matches!(pair.server.add_buffers(&sv, 1), Err(RpcError::Shutdown)));

    drop(release);
    done.next();
    wait_until(|| pair.server.finish_service(&sv));
    // the call was still active when the service went down
    assert_eq!(pair.server.get_counters().rpcs_dropped, 1);
    pair.server.remove_service(&sv).unwrap();
    assert_eq!(pair.server.remove_service(&sv), Err(RpcError::NoSuchService(SERVICE_BRW)));
    pair.teardown(&[]);
}

/// Serves one page to the caller and reports what became of the call.
struct Reader {
    handled: Sender<()>,
    bulk_done: Arc<AtomicBool>,
    finished: Sender<selftest_rpc::Result<()>>,
}

impl ServiceHandler for Reader {
    fn handle(&self, call: &mut ServerCall) -> selftest_rpc::Result<()> {
        let bulk = BulkDescriptor::alloc(1, false)?;
        bulk.fill_pattern(7);
        call.set_bulk(bulk);
        let _ = self.handled.send(());
        Ok(())
    }

    fn bulk_ready(&self, _call: &ServerCall, status: selftest_rpc::Result<()>) -> selftest_rpc::Result<()> {
        self.bulk_done.store(true, Ordering::SeqCst);
        status
    }

    fn rpc_done(&self, _call: &ServerCall, status: &selftest_rpc::Result<()>) {
        let _ = self.finished.send(status.clone());
    }
}

#[test]
fn shutdown_unlinks_pending_bulk() {
    let pair = Pair::new();
    let (handled_tx, handled) = unbounded();
    let (finished_tx, finished) = unbounded();
    let bulk_done = Arc::new(AtomicBool::new(false));
    let reader = Reader { handled: handled_tx, bulk_done: bulk_done.clone(), finished: finished_tx };
    let sv = pair.server.register_service(SERVICE_BRW, "brw_test", 1, reader).unwrap();
    pair.server.add_buffers(&sv, 1).unwrap();

    // no sink is ever posted, so the server's bulk put waits in the lazy portal
    let (raw, _events) = raw_node(&pair.net, 4);
    raw.set_lazy_portal(Portal::Rdma, true);
    let mut msg = SrpcMsg::request(SERVICE_BRW, Payload::Empty);
    msg.body = MsgBody::Request { reply_id: 0x77, bulk_id: 0x78, payload: Payload::Empty };
    let request = Region::new(MSG_SIZE).unwrap();
    request.with_mut(|bytes| msg.encode(WireOrder::Native, bytes)).unwrap();
    let (request_md, server) = (MdBuffer::single(request), pair.server_id());
    raw.post_active(Portal::Request, SERVICE_BRW as u64, request_md, MdOp::Put, server, EventTarget::opaque(1))
        .unwrap();

    handled.recv_timeout(Duration::from_secs(10)).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(sv.active_rpcs(), 1);
    assert!(!bulk_done.load(Ordering::SeqCst));
    assert!(finished.try_recv().is_err());

    pair.server.shutdown_service(&sv);
    assert_eq!(finished.recv_timeout(Duration::from_secs(10)).unwrap(), Err(RpcError::Shutdown));
    wait_until(|| pair.server.finish_service(&sv));
    assert!(!bulk_done.load(Ordering::SeqCst));
    let counters = pair.server.get_counters();
    assert_eq!((counters.rpcs_dropped, counters.bulk_put), (1, 0));
    pair.server.remove_service(&sv).unwrap();
    drop(raw);
    pair.teardown(&[]);
}

#[test]
fn removed_buffers_are_not_reposted() {
    let pair = Pair::new();
    let sv = pair.server.register_service(SERVICE_DEBUG, "debug", 1, Echo).unwrap();
    pair.server.add_buffers(&sv, 4).unwrap();
    pair.server.remove_buffers(&sv, 2);

    let done = Completions::new();
    for i in 0..3u8 {
        let mut raw = [0u8; 32];
        raw[0] = i + 1;
        post(
            &pair.client,
            done.attach(ClientRpc::builder(pair.server_id(), SERVICE_DEBUG).payload(Payload::Raw(raw))),
        );
        let rpc = done.next();
        rpc.remote_result().unwrap();
        let echoed = rpc.reply().map(|reply| reply.payload().clone());
        assert_eq!(echoed, Some(Payload::Raw(raw)));
        wait_until(|| sv.active_rpcs() == 0);
    }
    wait_until(|| sv.posted_buffers() == 2);
    pair.teardown(&[sv]);
}

#[test]
fn registration_rules() {
    let pair = Pair::new();
    let sv = pair.server.register_service(SERVICE_PING, "ping_test", 1, PingServer).unwrap();
    assert_eq!(sv.id(), SERVICE_PING);
    assert_eq!(sv.name(), "ping_test");
    assert!(Arc::ptr_eq(&pair.server.service(SERVICE_PING).unwrap(), &sv));

    let again = pair.server.register_service(SERVICE_PING, "ping_again", 1, PingServer);
    assert_eq!(again.err(), Some(RpcError::AlreadyRegistered(SERVICE_PING)));
    assert!(matches!(
        pair.server.register_service(SERVICE_MAX_ID + 1, "bogus", 1, PingServer),
        Err(RpcError::InvalidArgument(_))
    ));
    assert!(matches!(
        pair.server.register_service(SERVICE_BRW, "no_slots", 0, PingServer),
        Err(RpcError::InvalidArgument(_))
    ));

    assert!(matches!(pair.server.shutdown(), Err(RpcError::InvalidState(_))));
    assert_eq!(pair.server.state(), EngineState::Running);
    pair.teardown(&[sv]);
}

#[test]
fn version_mismatch_is_answered_with_eproto() {
    let pair = Pair::new();
    let sv = pair.server.register_service(SERVICE_PING, "ping_test", 1, PingServer).unwrap();
    pair.server.add_buffers(&sv, 1).unwrap();
    let (raw, events) = raw_node(&pair.net, 4);

    let reply = Region::new(MSG_SIZE).unwrap();
    raw.post_passive(Portal::Rdma, 0x77, MdBuffer::single(reply.clone()), MdOp::Put, None, EventTarget::opaque(1))
        .unwrap();
    let mut msg = SrpcMsg::request(SERVICE_PING, Payload::Empty);
    msg.version = MSG_VERSION + 1;
    msg.body = MsgBody::Request { reply_id: 0x77, bulk_id: 0, payload: Payload::Empty };
    let request = Region::new(MSG_SIZE).unwrap();
    request.with_mut(|bytes| msg.encode(WireOrder::Native, bytes)).unwrap();
    raw.post_active(
        Portal::Request,
        SERVICE_PING as u64,
        MdBuffer::single(request),
        MdOp::Put,
        pair.server_id(),
        EventTarget::opaque(2),
    )
    .unwrap();

    let ev = next_event(&events, EventKind::Put);
    assert_eq!(ev.target.tag(), Some(1));
    let decoded = reply.with(SrpcMsg::decode).unwrap();
    match decoded.body {
        MsgBody::Reply { status, .. } => assert_eq!(status, libc::EPROTO as u32),
        body => panic!("unexpected reply body {:?}", body),
    }
    drop(raw);
    pair.teardown(&[sv]);
}

#[test]
fn malformed_request_is_dropped_and_buffer_reposted() {
    let pair = Pair::new();
    let sv = pair.server.register_service(SERVICE_PING, "ping_test", 1, PingServer).unwrap();
    pair.server.add_buffers(&sv, 1).unwrap();
    let (raw, _events) = raw_node(&pair.net, 4);

    raw.post_active(
        Portal::Request,
        SERVICE_PING as u64,
        MdBuffer::single(Region::from_vec(vec![0xab; 10])),
        MdOp::Put,
        pair.server_id(),
        EventTarget::opaque(0),
    )
    .unwrap();
    wait_until(|| pair.server.get_counters().errors == 1);
    wait_until(|| sv.posted_buffers() == 1);
    assert_eq!(pair.server.get_counters().rpcs_rcvd, 0);
    assert_eq!(sv.active_rpcs(), 0);
    drop(raw);
    pair.teardown(&[sv]);
}
