use clap::Parser;
use crossbeam::channel::{unbounded, RecvTimeoutError};
use hdrhistogram::Histogram;
use selftest_rpc::{
    ClientRpc, LoopbackNetwork, ProcessId, RpcConfig, RpcContext, Service, SERVICE_PING,
};
use selftest_rpc::ping::{PingClient, PingServer};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Ping servers to spread the load over.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    nodes: u64,

    #[arg(long, default_value_t = 10)]
    duration_seconds: u64,

    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u32).range(1..))]
    queue_depth: u32,

    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    #[arg(long, default_value_t = 4)]
    workers: usize,

    #[arg(long, default_value_t = 16)]
    peer_credits: usize,
}

fn print_result(io_per_sec: f64, latency_min: u64, latency_percentile_25: u64,
                latency_percentile_50: u64, latency_percentile_75: u64, latency_percentile_90: u64,
                latency_percentile_99: u64, latency_max: u64) {
    println!("\"io_per_sec\", \"latency_min\", \"latency_percentile_25\", \"latency_percentile_50\", \"latency_percentile_75\", \"latency_percentile_90\", \"latency_percentile_99\", \"latency_max\"");
    println!("\"{}\", \"{}\", \"{}\", \"{}\", \"{}\", \"{}\", \"{}\", \"{}\"",
             io_per_sec, latency_min, latency_percentile_25, latency_percentile_50,
             latency_percentile_75, latency_percentile_90, latency_percentile_99, latency_max);
}

fn stop_service(ctx: &RpcContext, service: &Arc<Service>) {
    ctx.shutdown_service(service);
    while !ctx.finish_service(service) {
        thread::sleep(Duration::from_millis(1));
    }
    ctx.remove_service(service).expect("service vanished from registry");
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let config = RpcConfig::default()
        .with_workers(args.workers)
        .with_peer_credits(args.peer_credits);
    let net = LoopbackNetwork::new();

    let mut servers = Vec::new();
    for nid in 1..=args.nodes {
        let lo = net.attach(nid).expect("failed to attach server node");
        let ctx = RpcContext::startup(config.clone(), lo).expect("failed to start server engine");
        let service = ctx
            .register_service(SERVICE_PING, "ping_test", args.queue_depth as usize, PingServer)
            .expect("failed to register ping service");
        ctx.add_buffers(&service, args.queue_depth as usize * 2)
            .expect("failed to post request buffers");
        servers.push((ctx, service));
    }

    let lo = net.attach(0).expect("failed to attach client node");
    let client = RpcContext::startup(config, lo).expect("failed to start client engine");
    let ping = Arc::new(PingClient::new());
    let (done_tx, done_rx) = unbounded::<(Instant, Arc<ClientRpc>)>();

    let mut hist: Histogram<u64> = Histogram::new_with_bounds(1u64, 300_000_000_000u64, 3).unwrap();
    let duration = Duration::from_secs(args.duration_seconds);
    let timeout = Duration::from_millis(args.timeout_ms);
    let start = Instant::now();
    let mut inflight = 0u32;
    let mut total_io = 0u64;
    let mut failed = 0u64;
    let mut step = 0u64;

    loop {
        let running = start.elapsed() < duration;
        while running && inflight < args.queue_depth {
            let dest = ProcessId::new(1 + step % args.nodes, 0);
            let tx = done_tx.clone();
            let issued = Instant::now();
            let rpc = ping
                .prep_rpc(dest)
                .timeout(timeout)
                .on_done(move |rpc| {
                    let _ = tx.send((issued, rpc.clone()));
                })
                .build(&client)
                .expect("failed to create ping rpc");
            client.post_rpc(&rpc).expect("failed to post ping rpc");
            inflight += 1;
            step += 1;
        }
        if !running && inflight == 0 {
            break;
        }

        match done_rx.recv_timeout(Duration::from_secs(1)) {
            Ok((issued, rpc)) => {
                inflight -= 1;
                match ping.done_rpc(&rpc) {
                    Ok(_) => {
                        hist.record(issued.elapsed().as_nanos() as u64).unwrap();
                        total_io += 1;
                    }
                    Err(_) => failed += 1,
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    let elapsed = start.elapsed();

    print_result(
        total_io as f64 / elapsed.as_secs_f64(),
        hist.min(),
        hist.value_at_percentile(25.0),
        hist.value_at_percentile(50.0),
        hist.value_at_percentile(75.0),
        hist.value_at_percentile(90.0),
        hist.value_at_percentile(99.0),
        hist.max(),
    );
    println!("failed pings: {}, ping errors: {}", failed, ping.errors());
    println!("client: {:?}", client.get_counters());

    client.shutdown().expect("client engine shutdown");
    for (ctx, service) in servers {
        println!("server {}: {:?}", ctx.self_id(), ctx.get_counters());
        stop_service(&ctx, &service);
        ctx.shutdown().expect("server engine shutdown");
    }
}
