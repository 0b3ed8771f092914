mod common;

use common::*;
use rand::Rng;
use selftest_rpc::{
    BulkDescriptor, ClientRpc, Payload, RpcError, ServerCall, ServiceHandler, PAGE_SIZE, SERVICE_BRW,
};

const WRITE: u8 = 1;
const READ: u8 = 2;

fn brw_payload(op: u8, npages: u32, seed: u64) -> Payload {
    let mut raw = [0u8; 32];
    raw[0] = op;
    raw[4..8].copy_from_slice(&npages.to_le_bytes());
    raw[8..16].copy_from_slice(&seed.to_le_bytes());
    Payload::Raw(raw)
}

fn parse(call: &ServerCall) -> Option<(u8, usize, u64)> {
    let Payload::Raw(raw) = call.request_payload() else {
        return None;
    };
    let npages = u32::from_le_bytes(raw[4..8].try_into().ok()?) as usize;
    let seed = u64::from_le_bytes(raw[8..16].try_into().ok()?);
    Some((raw[0], npages, seed))
}

/// Minimal bulk read/write service: writes are checked against the pattern,
/// reads are served from it.
struct Brw;

impl ServiceHandler for Brw {
    fn handle(&self, call: &mut ServerCall) -> selftest_rpc::Result<()> {
        let Some((op, npages, seed)) = parse(call) else {
            call.reply(libc::EINVAL as u32, Payload::Empty);
            return Ok(());
        };
        match op {
            WRITE => call.set_bulk(BulkDescriptor::alloc(npages, true)?),
            READ => {
                let bulk = BulkDescriptor::alloc(npages, false)?;
                bulk.fill_pattern(seed);
                call.set_bulk(bulk);
            }
            _ => call.reply(libc::EINVAL as u32, Payload::Empty),
        }
        Ok(())
    }

    fn bulk_ready(&self, call: &ServerCall, status: selftest_rpc::Result<()>) -> selftest_rpc::Result<()> {
        status?;
        match (parse(call), call.bulk()) {
            (Some((WRITE, _, seed)), Some(bulk)) if !bulk.check_pattern(seed) => {
                Err(RpcError::Protocol("bulk data corrupted".into()))
            }
            _ => Ok(()),
        }
    }
}

#[test]
fn bulk_write_moves_pages_to_server() {
    let pair = Pair::new();
    let sv = pair.server.register_service(SERVICE_BRW, "brw_test", 2, Brw).unwrap();
    pair.server.add_buffers(&sv, 2).unwrap();

    let npages = 8;
    let seed: u64 = rand::thread_rng().gen();
    let bulk = BulkDescriptor::alloc(npages, false).unwrap();
    bulk.fill_pattern(seed);

    let done = Completions::new();
    let builder = ClientRpc::builder(pair.server_id(), SERVICE_BRW)
        .payload(brw_payload(WRITE, npages as u32, seed))
        .bulk(bulk);
    post(&pair.client, done.attach(builder));

    let rpc = done.next();
    rpc.remote_result().unwrap();
    wait_until(|| pair.server.get_counters().bulk_get == (npages * PAGE_SIZE) as u64);
    assert_eq!(pair.server.get_counters().rpcs_dropped, 0);
    pair.teardown(&[sv]);
}

#[test]
fn bulk_read_fills_client_sink() {
    let pair = Pair::new();
    let sv = pair.server.register_service(SERVICE_BRW, "brw_test", 2, Brw).unwrap();
    pair.server.add_buffers(&sv, 2).unwrap();

    let npages = 3;
    let seed: u64 = rand::thread_rng().gen();
    let done = Completions::new();
    let builder = ClientRpc::builder(pair.server_id(), SERVICE_BRW)
        .payload(brw_payload(READ, npages as u32, seed))
        .bulk(BulkDescriptor::alloc(npages, true).unwrap());
    post(&pair.client, done.attach(builder));

    let rpc = done.next();
    rpc.remote_result().unwrap();
    assert!(rpc.with_bulk(|bulk| bulk.map_or(false, |b| b.check_pattern(seed))));
    wait_until(|| pair.server.get_counters().bulk_put == (npages * PAGE_SIZE) as u64);
    pair.teardown(&[sv]);
}

#[test]
fn remote_error_skips_bulk() {
    let pair = Pair::new();
    let sv = pair.server.register_service(SERVICE_BRW, "brw_test", 1, Brw).unwrap();
    pair.server.add_buffers(&sv, 1).unwrap();

    let done = Completions::new();
    let builder = ClientRpc::builder(pair.server_id(), SERVICE_BRW)
        .payload(brw_payload(0xff, 1, 0))
        .bulk(BulkDescriptor::alloc(1, true).unwrap());
    post(&pair.client, done.attach(builder));

    let rpc = done.next();
    // the unlinked bulk buffer does not fail the rpc, the remote status does
    assert_eq!(rpc.status(), Ok(()));
    assert_eq!(rpc.reply_status(), Some(libc::EINVAL as u32));
    assert_eq!(rpc.remote_result(), Err(RpcError::Remote(libc::EINVAL as u32)));
    let counters = pair.server.get_counters();
    assert_eq!((counters.bulk_get, counters.bulk_put), (0, 0));
    pair.teardown(&[sv]);
}

#[test]
fn oversized_bulk_is_rejected() {
    assert!(matches!(BulkDescriptor::alloc(257, true), Err(RpcError::InvalidArgument(_))));
    assert!(matches!(BulkDescriptor::alloc(0, false), Err(RpcError::InvalidArgument(_))));
}
