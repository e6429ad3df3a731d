use std::hint::black_box;
use std::net::TcpListener;
use std::thread;

use basalt_appproc::MessageQueue;
use basalt_msg::{Message, MessageType, SegmentKey};
use basalt_net::{ConnectionRegistry, Endpoint, Role};
use basalt_perf::*;
use basalt_shm::SharedMemoryAccess;

const BATCHES: usize = 2_000;
const BATCH_SIZE: usize = 256;
const ROUND_TRIPS: usize = 20_000;

fn codec_section(results: &mut Vec<BenchResult>) {
    section_header("Frame codec");
    print_table_header();
    for len in [0usize, 64, 4096] {
        let msg = make_test_message(len);
        let frame = msg.to_frame().expect("test frame fits");

        let size = format_bytes(len as u64);

        let r = measure_batched(&format!("encode {size}"), BATCHES, BATCH_SIZE, || {
            black_box(msg.to_frame().ok());
        });
        print_result_row(&r);
        results.push(r);

        let r = measure_batched(&format!("decode {size}"), BATCHES, BATCH_SIZE, || {
            black_box(Message::from_frame(black_box(&frame)).ok());
        });
        print_result_row(&r);
        results.push(r);
    }
}

fn queue_section(results: &mut Vec<BenchResult>) {
    section_header("Deferred message queue");
    print_table_header();
    let mut queue = MessageQueue::new();
    let msg = Message::empty(MessageType::Info);
    let r = measure_batched("push+pop", BATCHES, BATCH_SIZE, || {
        queue.push(msg.clone());
        black_box(queue.pop());
    });
    print_result_row(&r);
    results.push(r);
}

fn segment_section(results: &mut Vec<BenchResult>) {
    section_header("Shared segment access");
    print_table_header();
    let dir = BenchShmDir::new("report_seg").expect("failed to create shm dir");
    let mut shm = SharedMemoryAccess::new(dir.path());

    let r = measure_each("attach (create 1 MB)", 64, || {
        let key = SegmentKey(shm.mapping_count() as i32 + 1);
        black_box(shm.attach(key, 1 << 20).ok());
    });
    print_result_row(&r);
    results.push(r);

    let seg = shm.primary().expect("segment attached above");
    let block = vec![0x5Au8; 4096];
    let r = measure_batched("write_at 4 KB", BATCHES, BATCH_SIZE, || {
        black_box(seg.write_at(0, &block).ok());
    });
    print_result_row(&r);
    results.push(r);
}

/// Request/reply over loopback TCP against an echo thread.
fn round_trip_section(results: &mut Vec<BenchResult>) {
    section_header("Loopback request/reply");
    print_table_header();

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let port = listener.local_addr().expect("bound address").port();
    let echo = thread::spawn(move || {
        let (mut s, _) = listener.accept().expect("accept");
        s.set_nodelay(true).ok();
        while let Ok(msg) = Message::read_from(&mut s) {
            if msg.kind == MessageType::Quit {
                break;
            }
            if Message::empty(MessageType::Finished).write_to(&mut s).is_err() {
                break;
            }
        }
    });

    let mut registry = ConnectionRegistry::new();
    let endpoint = Endpoint::resolve("127.0.0.1").expect("loopback resolves");
    let id = registry
        .add(Role::Datamanager, endpoint, port, None)
        .expect("connect to echo thread");

    for len in [0usize, 4096] {
        let request = make_test_message(len);
        let r = measure_each(
            &format!("round trip {}", format_bytes(len as u64)),
            ROUND_TRIPS,
            || {
                registry.send(id, &request).expect("send");
                black_box(registry.receive(id).expect("receive"));
            },
        );
        print_result_row(&r);
        results.push(r);
    }

    let _ = registry.send(id, &Message::empty(MessageType::Quit));
    let _ = echo.join();
}

fn main() {
    let json_path = std::env::args().skip_while(|a| a != "--json").nth(1);

    let mut results = Vec::new();
    codec_section(&mut results);
    queue_section(&mut results);
    segment_section(&mut results);
    round_trip_section(&mut results);

    let usage = capture_rusage();
    section_header("Process");
    println!("  max rss          {}", format_bytes(usage.max_rss_bytes.max(0) as u64));
    println!("  faults           {} minor, {} major", usage.minor_faults, usage.major_faults);
    println!(
        "  context switches {} voluntary, {} involuntary",
        usage.vol_ctx_switches, usage.invol_ctx_switches
    );

    if let Some(path) = json_path {
        let report = serde_json::json!({
            "results": results,
            "rusage": usage,
        });
        match serde_json::to_string_pretty(&report) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&path, text) {
                    eprintln!("failed to write {path}: {e}");
                    std::process::exit(1);
                }
                println!("\n  report written to {path}");
            }
            Err(e) => {
                eprintln!("failed to serialise report: {e}");
                std::process::exit(1);
            }
        }
    }
}
