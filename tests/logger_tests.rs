use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use stagelog::{stagelog, LogLevel};

// One process-wide logger; every test that redirects its output or touches
// the severity threshold has to run alone.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn temp_log(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(name);
    let _ = fs::remove_file(&path);
    path
}

/// Splits the written file into lines, checking the terminator on the way.
fn read_lines(path: &PathBuf) -> Vec<String> {
    let data = fs::read_to_string(path).expect("log file readable");
    let mut lines: Vec<&str> = data.split("\r\n").collect();
    assert_eq!(lines.pop(), Some(""), "file must end with the terminator");
    lines.iter().map(|l| l.to_string()).collect()
}

fn body_of(line: &str) -> &str {
    let start = line.find("]: ").expect("prefix separator") + 3;
    &line[start..]
}

fn producer_id_of(line: &str) -> u32 {
    // ...[<SEVERITY>][<producer_id>]: ...
    let end = line.find("]: ").unwrap();
    let start = line[..end].rfind('[').unwrap() + 1;
    line[start..end].parse().unwrap()
}

#[test]
fn single_thread_end_to_end() {
    let _guard = TEST_LOCK.lock().unwrap();
    let path = temp_log("stagelog_e2e.log");
    stagelog::set_output_file(&path).unwrap();

    stagelog!(LogLevel::Info, "starting run %d", 7);
    stagelog!(LogLevel::Info, "worker %s ready, queue depth %u", "alpha", 42u32);
    stagelog!(LogLevel::Info, "done in %.3f seconds", 1.5);
    stagelog::sync();

    let lines = read_lines(&path);
    assert_eq!(lines.len(), 3);

    assert_eq!(body_of(&lines[0]), "starting run 7");
    assert_eq!(body_of(&lines[1]), "worker alpha ready, queue depth 42");
    assert_eq!(body_of(&lines[2]), "done in 1.500 seconds");

    for line in &lines {
        assert!(line.contains("logger_tests.rs:"), "file prefix in {:?}", line);
        assert!(line.contains("[INFO]["), "severity tag in {:?}", line);
        // Timestamp shape: date, time, three millisecond digits.
        assert_eq!(line.as_bytes()[4], b'-');
        assert_eq!(line.as_bytes()[10], b' ');
        assert_eq!(line.as_bytes()[19], b'.');
    }

    let _ = fs::remove_file(&path);
}

#[test]
fn per_producer_commit_order_survives() {
    let _guard = TEST_LOCK.lock().unwrap();
    let path = temp_log("stagelog_order.log");
    stagelog::set_output_file(&path).unwrap();

    const THREADS: u64 = 4;
    const RECORDS: u64 = 500;

    let handles: Vec<_> = (0..THREADS)
        .map(|tag| {
            thread::spawn(move || {
                for seq in 0..RECORDS {
                    stagelog!(LogLevel::Info, "tag=%llu seq=%llu", tag, seq);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    stagelog::sync();

    let lines = read_lines(&path);
    assert_eq!(lines.len(), (THREADS * RECORDS) as usize);

    // Each thread's records must appear in its commit order, and all
    // records of one tag must carry one producer id.
    let mut next_seq = vec![0u64; THREADS as usize];
    let mut tag_producer: Vec<Option<u32>> = vec![None; THREADS as usize];
    for line in &lines {
        let body = body_of(line);
        let tag: usize = body
            .strip_prefix("tag=")
            .and_then(|r| r.split(' ').next())
            .and_then(|t| t.parse().ok())
            .expect("tag field");
        let seq: u64 = body.rsplit('=').next().unwrap().parse().unwrap();
        assert_eq!(seq, next_seq[tag], "out-of-order record for tag {}", tag);
        next_seq[tag] += 1;

        let producer = producer_id_of(line);
        match tag_producer[tag] {
            None => tag_producer[tag] = Some(producer),
            Some(p) => assert_eq!(p, producer, "tag {} moved producers", tag),
        }
    }
    assert!(next_seq.iter().all(|&n| n == RECORDS));

    let _ = fs::remove_file(&path);
}

#[test]
fn severity_threshold_filters() {
    let _guard = TEST_LOCK.lock().unwrap();
    let path = temp_log("stagelog_severity.log");
    stagelog::set_output_file(&path).unwrap();

    let before = stagelog::get_severity_threshold();
    stagelog::set_severity_threshold(LogLevel::Warning);

    stagelog!(LogLevel::Debug, "too chatty %d", 1);
    stagelog!(LogLevel::Info, "still too chatty %d", 2);
    stagelog!(LogLevel::Warning, "worth keeping %d", 3);
    stagelog!(LogLevel::Error, "definitely keeping %d", 4);
    stagelog::sync();

    stagelog::set_severity_threshold(before);

    let lines = read_lines(&path);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("[WARNING]["));
    assert_eq!(body_of(&lines[0]), "worth keeping 3");
    assert!(lines[1].contains("[ERROR]["));
    assert_eq!(body_of(&lines[1]), "definitely keeping 4");

    let _ = fs::remove_file(&path);
}

#[test]
fn exited_thread_buffer_is_reaped() {
    let _guard = TEST_LOCK.lock().unwrap();
    let path = temp_log("stagelog_reap.log");
    stagelog::set_output_file(&path).unwrap();

    let baseline = stagelog::live_buffer_count();

    thread::spawn(|| {
        stagelog!(LogLevel::Info, "short-lived thread, record %d of %d", 1, 1);
    })
    .join()
    .unwrap();
    stagelog::sync();

    // The record must have survived the thread.
    let lines = read_lines(&path);
    assert!(lines
        .iter()
        .any(|l| body_of(l) == "short-lived thread, record 1 of 1"));

    // The consumer destroys the buffer once it is marked and drained.
    let deadline = Instant::now() + Duration::from_secs(5);
    while stagelog::live_buffer_count() > baseline {
        assert!(Instant::now() < deadline, "buffer was never reaped");
        thread::sleep(Duration::from_millis(1));
    }

    let _ = fs::remove_file(&path);
}

#[test]
fn mixed_specifier_bodies() {
    let _guard = TEST_LOCK.lock().unwrap();
    let path = temp_log("stagelog_mixed.log");
    stagelog::set_output_file(&path).unwrap();

    stagelog!(LogLevel::Info, "val=%.*s|", 3, "abcdef");
    stagelog!(LogLevel::Info, "a=%d b=%*.*lf", 7, 8, 2, 3.14159);
    stagelog!(LogLevel::Info, "hex=%#x oct=%#o pct=100%%", 255u32, 8u32);
    stagelog!(LogLevel::Info, "addr=%p chr=%c", 0xdead_beefusize as *const u8, 'Z');
    stagelog::sync();

    let lines = read_lines(&path);
    let bodies: Vec<&str> = lines.iter().map(|l| body_of(l)).collect();
    assert_eq!(
        bodies,
        vec![
            "val=abc|",
            "a=7 b=    3.14",
            "hex=0xff oct=010 pct=100%",
            "addr=0xdeadbeef chr=Z",
        ]
    );

    let _ = fs::remove_file(&path);
}

// Throughput comparison against a conventional logging stack. Run alone:
// `cargo test --test logger_tests -- --ignored --test-threads=1`.
#[test]
#[ignore]
fn compare_with_log4rs() {
    use log::info;
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let _guard = TEST_LOCK.lock().unwrap();
    const ITERATIONS: usize = 200_000;

    let stage_path = temp_log("stagelog_perf.log");
    stagelog::set_output_file(&stage_path).unwrap();

    let start = Instant::now();
    for i in 0..ITERATIONS {
        stagelog!(LogLevel::Info, "perf iteration=%zu payload=%s", i, "x86_64-backend-queue");
    }
    let produce_time = start.elapsed();
    stagelog::sync();
    let drain_time = start.elapsed();

    let trad_path = temp_log("stagelog_perf_log4rs.log");
    let appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d} - {m}{n}")))
        .build(&trad_path)
        .unwrap();
    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(appender)))
        .build(Root::builder().appender("file").build(log::LevelFilter::Info))
        .unwrap();
    log4rs::init_config(config).unwrap();

    let start = Instant::now();
    for i in 0..ITERATIONS {
        info!("perf iteration={} payload={}", i, "x86_64-backend-queue");
    }
    let traditional = start.elapsed();

    println!("\nThroughput over {} records:", ITERATIONS);
    println!("  stagelog producer side: {:?}", produce_time);
    println!("  stagelog fully drained: {:?}", drain_time);
    println!("  log4rs:                 {:?}", traditional);

    let _ = fs::remove_file(&stage_path);
    let _ = fs::remove_file(&trad_path);
}
