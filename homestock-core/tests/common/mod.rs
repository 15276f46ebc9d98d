#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use homestock_core::{DownloadStore, Fetcher, RateLimiter};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

#[derive(Clone)]
enum Route {
    Fixed(Vec<u8>),
    /// Chunked body without a length; `rest` waits for the gate.
    Chunked {
        first: Vec<u8>,
        rest: Vec<u8>,
        gate: Arc<Mutex<Receiver<()>>>,
    },
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

/// Releases the held-back part of a chunked response.
pub struct Gate(Sender<()>);

impl Gate {
    pub fn open(&self) {
        self.0.send(()).ok();
    }
}

/// Minimal HTTP/1.1 responder. Unknown paths get a 404.
pub struct TestServer {
    addr: SocketAddr,
    routes: Routes,
    hits: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Routes = Arc::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let (routes_bg, hits_bg) = (routes.clone(), hits.clone());
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                hits_bg.fetch_add(1, Ordering::SeqCst);
                let routes = routes_bg.clone();
                thread::spawn(move || respond(stream, &routes));
            }
        });

        Self { addr, routes, hits }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn serve(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.routes.lock().unwrap().insert(path.to_string(), Route::Fixed(body.into()));
    }

    /// Serves `first` at once and `rest` after the returned gate opens,
    /// with no `Content-Length`.
    pub fn serve_chunked(&self, path: &str, first: &[u8], rest: &[u8]) -> Gate {
        let (tx, rx) = mpsc::channel();
        let route = Route::Chunked {
            first: first.to_vec(),
            rest: rest.to_vec(),
            gate: Arc::new(Mutex::new(rx)),
        };
        self.routes.lock().unwrap().insert(path.to_string(), route);
        Gate(tx)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn respond(mut stream: TcpStream, routes: &Mutex<HashMap<String, Route>>) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }

    let head = String::from_utf8_lossy(&head);
    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
    let route = routes.lock().unwrap().get(&path).cloned();

    match route {
        Some(Route::Fixed(body)) => write_fixed(&mut stream, "200 OK", &body),
        Some(Route::Chunked { first, rest, gate }) => {
            let header = "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
            stream.write_all(header.as_bytes()).ok();
            write_chunk(&mut stream, &first);
            stream.flush().ok();
            gate.lock().unwrap().recv_timeout(Duration::from_secs(10)).ok();
            write_chunk(&mut stream, &rest);
            stream.write_all(b"0\r\n\r\n").ok();
            stream.flush().ok();
        }
        None => write_fixed(&mut stream, "404 Not Found", b"<html>Not Found</html>"),
    }
}

fn write_fixed(stream: &mut TcpStream, status: &str, body: &[u8]) {
    let header = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        body.len()
    );
    stream.write_all(header.as_bytes()).ok();
    stream.write_all(body).ok();
    stream.flush().ok();
}

fn write_chunk(stream: &mut TcpStream, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    stream.write_all(format!("{:x}\r\n", data.len()).as_bytes()).ok();
    stream.write_all(data).ok();
    stream.write_all(b"\r\n").ok();
}

pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

pub fn store(dir: &Path) -> DownloadStore {
    DownloadStore::open(dir.join("downloads.db")).unwrap()
}

/// A fetcher whose limiter never gets in the way. Proxies from the
/// environment are ignored so requests reach the local server.
pub fn fetcher(store: DownloadStore) -> Fetcher {
    let limiter = Arc::new(RateLimiter::new(1000, Duration::from_secs(1)));
    let client = reqwest::blocking::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    Fetcher::with_client(client, limiter, store)
}
