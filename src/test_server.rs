//! A tiny HTTP/1.1 server for tests: answers one canned response per connection
//! and hands every raw request back through a channel.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

/// A canned response
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    pub fn json(status: u16, body: &str) -> Self {
        Self { status, body: body.to_string() }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

// Reads one request, including its body (content-length or chunked)
fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut data = vec![];
    let mut buffer = [0u8; 4096];
    let mut header_end = None;
    loop {
        if header_end.is_none() {
            header_end = find(&data, b"\r\n\r\n").map(|i| i + 4);
        }
        if let Some(end) = header_end {
            let head = String::from_utf8_lossy(&data[..end]).to_lowercase();
            let content_length = head.lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok());
            let complete = match content_length {
                Some(length) => data.len() >= end + length,
                None if head.contains("transfer-encoding: chunked") => find(&data[end..], b"0\r\n\r\n").is_some(),
                None => true,
            };
            if complete {
                return data;
            }
        }
        let read = stream.read(&mut buffer).unwrap();
        if read == 0 {
            return data;
        }
        data.extend_from_slice(&buffer[..read]);
    }
}

/// Serves `replies` in order, one per connection, calling `inspect` once a request was read and before answering it. \
/// Returns the base url (`http://127.0.0.1:<port>`) and the raw requests.
pub fn serve_inspecting(replies: Vec<Reply>, mut inspect: impl FnMut() + Send + 'static) -> (String, Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let (sender, receiver) = channel();
    std::thread::spawn(move || {
        for reply in replies {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            inspect();
            let _ = sender.send(String::from_utf8_lossy(&request).to_string());
            let response = format!(
                "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                reply.status,
                reply.body.len(),
                reply.body
            );
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
        }
    });
    (base_url, receiver)
}

pub fn serve(replies: Vec<Reply>) -> (String, Receiver<String>) {
    serve_inspecting(replies, || {})
}

/// A plain http client, the production one only speaks https
pub fn http_client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}
