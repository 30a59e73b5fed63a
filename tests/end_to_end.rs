//! End-to-end tests against a stub classifier.
//!
//! The stub is a small shell script that signals readiness on stderr like
//! kraken2 does after loading its database, then emits one `U\t<id>\t0`
//! line per FASTQ record on stdin, unbuffered. Everything else runs the
//! real code path: TCP uplink, session broker, sentinel demuxing, TCP
//! results push.

use k2mux::config::ServerConfig;
use k2mux::protocol::{self, Reply, Request};
use k2mux::{Client, Server, ServerHandle};
use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const STUB_CLASSIFIER: &str = r#"#!/bin/sh
echo "database loading: done" >&2
exec awk 'NR % 4 == 1 { id = substr($1, 2); print "U\t" id "\t0"; fflush(); }'
"#;

fn temp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("k2mux_test_{nanos}_{name}"))
}

#[cfg(unix)]
fn write_stub_classifier() -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = temp_path("classifier.sh");
    fs::write(&path, STUB_CLASSIFIER).expect("write stub classifier");
    let mut perms = fs::metadata(&path).expect("stat stub").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod stub");
    path
}

fn write_fastq(name: &str, read_ids: &[&str]) -> PathBuf {
    let path = temp_path(name);
    let mut contents = String::new();
    for id in read_ids {
        contents.push_str(&format!("@{id}\n{}\n+\n{}\n", "A".repeat(60), "I".repeat(60)));
    }
    fs::write(&path, contents).expect("write fastq");
    path
}

fn expected_output(read_ids: &[&str]) -> String {
    read_ids
        .iter()
        .map(|id| format!("U\t{id}\t0\n"))
        .collect()
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("probe free port");
    listener.local_addr().expect("probe local addr").port()
}

fn start_server(stub: &PathBuf, results_port: u16) -> ServerHandle {
    let config = ServerConfig {
        database: PathBuf::from("unused-db"),
        address: "127.0.0.1".to_string(),
        port: 0,
        results_port,
        k2_binary: "kraken2".to_string(),
        classifier_cmd: Some(stub.display().to_string()),
        threads: 1,
        batch_size: 1,
        filler_records: 4,
        ready_marker: "done".to_string(),
        startup_timeout_secs: 30,
        drain_timeout_secs: 30,
        report: None,
        classified_out: None,
        unclassified_out: None,
    };
    Server::new(config).start().expect("start server")
}

fn run_client(
    uplink_addr: &str,
    results_port: u16,
    sample_id: &str,
    fastq: &PathBuf,
) -> Result<String, String> {
    let client = Client::new(
        uplink_addr,
        format!("127.0.0.1:{results_port}"),
        sample_id,
    )
    // Small chunks force records to split across submits.
    .chunk_bytes(64)
    .acquire_timeout(Duration::from_secs(60));

    let stream = client
        .process_fastq(fastq)
        .map_err(|err| format!("{err:#}"))?;
    let mut combined = String::new();
    for fragment in stream {
        combined.push_str(&fragment.map_err(|err| format!("{err:#}"))?);
    }
    Ok(combined)
}

#[test]
fn single_session_streams_expected_results() {
    let stub = write_stub_classifier();
    let results_port = free_port();
    let handle = start_server(&stub, results_port);
    let uplink = handle.uplink_addr().to_string();

    let read_ids = ["r1", "r2", "r3"];
    let fastq = write_fastq("single.fq", &read_ids);
    let output = run_client(&uplink, results_port, "id1", &fastq).expect("session");
    assert_eq!(output, expected_output(&read_ids));
    assert!(!output.contains("K2MUX"));

    handle.terminate().expect("server shutdown");
}

#[test]
fn rerunning_the_same_file_yields_identical_output() {
    let stub = write_stub_classifier();
    let results_port = free_port();
    let handle = start_server(&stub, results_port);
    let uplink = handle.uplink_addr().to_string();

    let read_ids = ["s1", "s2"];
    let fastq = write_fastq("rerun.fq", &read_ids);
    let first = run_client(&uplink, results_port, "id1", &fastq).expect("first session");
    // The second session must sync past the first session's flush padding.
    let second = run_client(&uplink, results_port, "id1", &fastq).expect("second session");
    assert_eq!(first, second);
    assert_eq!(first, expected_output(&read_ids));

    handle.terminate().expect("server shutdown");
}

#[test]
fn concurrent_clients_serialize_and_stay_isolated() {
    let stub = write_stub_classifier();
    let results_port = free_port();
    let handle = start_server(&stub, results_port);
    let uplink = handle.uplink_addr().to_string();

    let ids_a = ["a1", "a2", "a3"];
    let ids_b = ["b1", "b2"];
    let fastq_a = write_fastq("conc_a.fq", &ids_a);
    let fastq_b = write_fastq("conc_b.fq", &ids_b);

    let thread_a = {
        let uplink = uplink.clone();
        thread::spawn(move || run_client(&uplink, results_port, "sample_a", &fastq_a))
    };
    let thread_b = {
        let uplink = uplink.clone();
        thread::spawn(move || run_client(&uplink, results_port, "sample_b", &fastq_b))
    };

    let output_a = thread_a.join().expect("client a thread").expect("session a");
    let output_b = thread_b.join().expect("client b thread").expect("session b");

    assert_eq!(output_a, expected_output(&ids_a));
    assert_eq!(output_b, expected_output(&ids_b));

    handle.terminate().expect("server shutdown");
}

#[test]
fn second_acquire_is_refused_while_session_active() {
    let stub = write_stub_classifier();
    let results_port = free_port();
    let handle = start_server(&stub, results_port);
    let uplink = handle.uplink_addr().to_string();

    let first = protocol::request(
        &uplink,
        &Request::Acquire {
            sample_id: "holder".to_string(),
        },
    )
    .expect("first acquire");
    assert!(matches!(first, Reply::Granted { .. }));

    let second = protocol::request(
        &uplink,
        &Request::Acquire {
            sample_id: "waiter".to_string(),
        },
    )
    .expect("second acquire");
    assert!(matches!(second, Reply::Busy));

    handle.terminate().expect("server shutdown");
}

#[test]
fn stale_or_unknown_token_is_rejected() {
    let stub = write_stub_classifier();
    let results_port = free_port();
    let handle = start_server(&stub, results_port);
    let uplink = handle.uplink_addr().to_string();

    let submit = protocol::request(
        &uplink,
        &Request::Submit {
            token: "bogus".to_string(),
            data: "@x\nT\n+\n!\n".to_string(),
        },
    )
    .expect("submit exchange");
    assert!(matches!(submit, Reply::Rejected { .. }));

    let finish = protocol::request(
        &uplink,
        &Request::Finish {
            token: "bogus".to_string(),
        },
    )
    .expect("finish exchange");
    assert!(matches!(finish, Reply::Rejected { .. }));

    // A granted session makes a mismatched token stale, not just unknown.
    let granted = protocol::request(
        &uplink,
        &Request::Acquire {
            sample_id: "holder".to_string(),
        },
    )
    .expect("acquire");
    assert!(matches!(granted, Reply::Granted { .. }));
    let stale = protocol::request(
        &uplink,
        &Request::Submit {
            token: "still-bogus".to_string(),
            data: "@x\nT\n+\n!\n".to_string(),
        },
    )
    .expect("stale submit exchange");
    assert!(matches!(stale, Reply::Rejected { .. }));

    handle.terminate().expect("server shutdown");
}

#[test]
fn malformed_command_is_rejected_not_fatal() {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;

    let stub = write_stub_classifier();
    let results_port = free_port();
    let handle = start_server(&stub, results_port);
    let uplink = handle.uplink_addr().to_string();

    let mut stream = TcpStream::connect(&uplink).expect("connect uplink");
    stream
        .write_all(b"{\"cmd\":\"reboot\"}\n")
        .expect("send bogus command");
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
    let mut line = String::new();
    reader.read_line(&mut line).expect("read reply");
    assert!(line.contains("rejected"), "unexpected reply: {line}");

    // The server is still serving afterwards.
    let reply = protocol::request(
        &uplink,
        &Request::Acquire {
            sample_id: "after".to_string(),
        },
    )
    .expect("acquire after bad command");
    assert!(matches!(reply, Reply::Granted { .. }));

    handle.terminate().expect("server shutdown");
}
