//! Integration test for `HttpDdnsUpdater` against a real (if tiny) in-process TCP server
//! standing in for `up.pagekite.net`, checking the request line carries the PageKite DDNS
//! API's actual query parameter names (`hostname=`/`myip=`), not placeholders.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;

use pagekite_ddns::HttpDdnsUpdater;
use pagekite_tunnel::ddns::{DdnsOutcome, DdnsUpdate, DdnsUpdater};

#[test]
fn update_sends_hostname_and_myip_query_params() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).unwrap();
        let request = String::from_utf8_lossy(&buf[..n]).into_owned();
        stream.write_all(b"HTTP/1.0 200 OK\r\n\r\ngood: example.com\r\n").unwrap();
        request
    });

    let url = format!("http://{}/", addr);
    let mut updater = HttpDdnsUpdater::new(url, "kite-secret");
    let request = DdnsUpdate { kite_name: "example.com".to_owned(), ip: "203.0.113.9".to_owned() };
    let outcome = updater.update(&request).unwrap();
    assert!(matches!(outcome, DdnsOutcome::Updated));

    let request_line = server.join().unwrap();
    assert!(request_line.contains("hostname=example.com"), "{}", request_line);
    assert!(request_line.contains("myip=203.0.113.9"), "{}", request_line);
    assert!(!request_line.contains("kite=example.com"));
}
