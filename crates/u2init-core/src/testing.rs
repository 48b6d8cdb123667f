//! Scripted stand-ins for the device, the network and the agent.

#![allow(clippy::unwrap_used, reason = "test fakes")]

use crate::adb::{AdbError, Transport};
use crate::cache::{DownloadError, Downloader};
use crate::cancel::CancelToken;
use crate::probe::{HealthCheck, ProbeError};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

enum Reply {
    Ok(String),
    Fail(i32, String),
}

/// Answers commands by prefix of their space-joined arguments; the first
/// matching rule wins, anything unmatched succeeds with empty output.
#[derive(Default)]
pub struct FakeTransport {
    rules: Vec<(Option<String>, String, Reply)>,
    log: Mutex<Vec<(Option<String>, String)>>,
}

impl FakeTransport {
    #[must_use]
    pub fn respond(mut self, prefix: &str, output: &str) -> Self {
        self.rules
            .push((None, prefix.to_string(), Reply::Ok(output.to_string())));
        self
    }

    #[must_use]
    pub fn fail(mut self, prefix: &str, code: i32, output: &str) -> Self {
        self.rules
            .push((None, prefix.to_string(), Reply::Fail(code, output.to_string())));
        self
    }

    /// Like [`FakeTransport::fail`], for commands aimed at `serial` only.
    #[must_use]
    pub fn fail_on(mut self, serial: &str, prefix: &str, code: i32, output: &str) -> Self {
        self.rules.push((
            Some(serial.to_string()),
            prefix.to_string(),
            Reply::Fail(code, output.to_string()),
        ));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn serials(&self) -> Vec<Option<String>> {
        self.log.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn calls_for(&self, serial: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s.as_deref() == Some(serial))
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

impl Transport for FakeTransport {
    fn run(
        &self,
        serial: Option<&str>,
        args: &[&str],
        cancel: &CancelToken,
    ) -> Result<String, AdbError> {
        if cancel.is_cancelled() {
            return Err(AdbError::Cancelled);
        }
        let line = args.join(" ");
        self.log
            .lock()
            .unwrap()
            .push((serial.map(str::to_string), line.clone()));
        let rule = self.rules.iter().find(|(s, p, _)| {
            (s.is_none() || s.as_deref() == serial) && line.starts_with(p.as_str())
        });
        match rule {
            Some((_, _, Reply::Ok(out))) => Ok(out.clone()),
            Some((_, _, Reply::Fail(code, out))) => Err(AdbError::NonZero {
                code: *code,
                output: out.clone(),
            }),
            None => Ok(String::new()),
        }
    }
}

/// Writes `payload` for every URL and counts transfers.
pub struct FakeDownloader {
    payload: Vec<u8>,
    status: Option<u16>,
    pub transfers: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl FakeDownloader {
    pub fn serving(payload: &[u8]) -> Self {
        Self {
            payload: payload.to_vec(),
            status: None,
            transfers: AtomicUsize::new(0),
            urls: Mutex::default(),
        }
    }

    pub fn failing(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::serving(b"")
        }
    }

    pub fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

impl Downloader for FakeDownloader {
    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64, DownloadError> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        if let Some(code) = self.status {
            return Err(DownloadError::Status(code));
        }
        dest.write_all(&self.payload)?;
        Ok(self.payload.len() as u64)
    }
}

/// Refuses the first `failures` checks, then answers with a version.
pub struct FakeHealthCheck {
    failures: usize,
    pub attempts: AtomicUsize,
}

impl FakeHealthCheck {
    pub fn failing_times(failures: usize) -> Self {
        Self {
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn never() -> Self {
        Self::failing_times(usize::MAX)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl HealthCheck for FakeHealthCheck {
    fn check(&self, _port: u16, _timeout: Duration) -> Result<String, ProbeError> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(ProbeError::Unreachable("connection refused".into()))
        } else {
            Ok("0.0.5".into())
        }
    }
}

/// Serves canned raw HTTP responses on a local port, one connection each,
/// in order. Every request (head and body) is recorded before answering.
pub struct HttpStub {
    pub port: u16,
    requests: Arc<Mutex<Vec<String>>>,
}

impl HttpStub {
    pub fn serve(responses: Vec<String>) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();
        thread::spawn(move || {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let request = read_request(&mut stream);
                log.lock().unwrap().push(request);
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });
        Self { port, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// A complete response that closes the connection after `body`.
pub fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn read_request(stream: &mut TcpStream) -> String {
    let mut reader = BufReader::new(stream);
    let mut request = String::new();
    let mut content_length = 0;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = v.trim().parse().unwrap_or(0);
        }
        let end_of_head = line == "\r\n";
        request.push_str(&line);
        if end_of_head {
            break;
        }
    }
    let mut body = vec![0; content_length];
    let _ = reader.read_exact(&mut body);
    request + &String::from_utf8_lossy(&body)
}

static RECORDS: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());

struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        RECORDS
            .lock()
            .unwrap()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

/// Route `log` records of the whole test binary into memory.
pub fn capture_logs() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(LevelFilter::Debug);
    });
}

/// Whether a record at exactly `level` containing `needle` was logged.
/// Tests run in parallel, so `needle` should be unique to the caller.
pub fn logged(level: Level, needle: &str) -> bool {
    RECORDS
        .lock()
        .unwrap()
        .iter()
        .any(|(l, msg)| *l == level && msg.contains(needle))
}
