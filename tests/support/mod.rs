//! In-process PostgreSQL server speaking the startup, authentication and
//! simple-query subset of the protocol.
//!
//! Recognized statements (a query string is split on `;`):
//! - `SELECT <n>`: one int4 column `?column?` holding `n`
//! - `SELECT pid`: one int4 column `pid` holding the backend process id
//! - `SELECT arr`: one int4[] column `arr` holding `{1,2,NULL}`
//! - `BEGIN` / `COMMIT`: toggle the transaction status
//! - `SET <name> TO <value>`: emits ParameterStatus
//! - `NOTICE`: emits a NoticeResponse
//! - `SLEEP <ms>`: answers after the delay
//! - `TERMINATE`: FATAL error, then the server hangs up
//! - anything else: ERROR 42601, remaining statements skipped
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use slim_postgres::Opts;
use slim_postgres::protocol::frontend::md5_password;

#[derive(Debug, Clone)]
pub enum Auth {
    Trust,
    Cleartext(String),
    Md5(String),
    Sasl,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub auth: Auth,
    /// Write every response one byte at a time.
    pub fragment: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth: Auth::Trust,
            fragment: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    pub accepted: AtomicUsize,
    pub authenticated: AtomicUsize,
    pub terminated: AtomicUsize,
    pub queries: AtomicUsize,
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub stats: Arc<Stats>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());
        let next_pid = Arc::new(AtomicU32::new(1000));

        let task = {
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    stats.accepted.fetch_add(1, Ordering::SeqCst);
                    let pid = next_pid.fetch_add(1, Ordering::SeqCst);
                    let session = Session {
                        socket,
                        config: config.clone(),
                        stats: Arc::clone(&stats),
                        pid,
                        in_transaction: false,
                    };
                    tokio::spawn(session.run());
                }
            })
        };

        Self { addr, stats, task }
    }

    pub fn opts(&self) -> Opts {
        Opts {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            user: "alice".into(),
            database: "app".into(),
            ..Default::default()
        }
    }

    pub fn url(&self) -> String {
        format!("postgres://alice@{}/app", self.addr)
    }

    pub fn accepted(&self) -> usize {
        self.stats.accepted.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.stats.terminated.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.stats.queries.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn auth(code: i32, extra: &[u8]) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(extra);
    frame(b'R', &payload)
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    cstr(&mut payload, name);
    cstr(&mut payload, value);
    frame(b'S', &payload)
}

fn fields_message(tag: u8, severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
        payload.push(field);
        cstr(&mut payload, value);
    }
    payload.push(0);
    frame(tag, &payload)
}

fn row_description(name: &str, type_oid: u32) -> Vec<u8> {
    let mut payload = 1u16.to_be_bytes().to_vec();
    cstr(&mut payload, name);
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&0i16.to_be_bytes());
    payload.extend_from_slice(&type_oid.to_be_bytes());
    payload.extend_from_slice(&(-1i16).to_be_bytes());
    payload.extend_from_slice(&(-1i32).to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    frame(b'T', &payload)
}

fn data_row(value: &str) -> Vec<u8> {
    let mut payload = 1u16.to_be_bytes().to_vec();
    payload.extend_from_slice(&(value.len() as i32).to_be_bytes());
    payload.extend_from_slice(value.as_bytes());
    frame(b'D', &payload)
}

fn command_complete(tag: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    cstr(&mut payload, tag);
    frame(b'C', &payload)
}

struct Session {
    socket: TcpStream,
    config: Config,
    stats: Arc<Stats>,
    pid: u32,
    in_transaction: bool,
}

impl Session {
    async fn run(mut self) {
        let _ = self.serve().await;
    }

    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if self.config.fragment {
            for byte in bytes {
                self.socket.write_all(std::slice::from_ref(byte)).await?;
                self.socket.flush().await?;
            }
            Ok(())
        } else {
            self.socket.write_all(bytes).await
        }
    }

    async fn read_startup(&mut self) -> std::io::Result<Vec<u8>> {
        let len = self.socket.read_i32().await? as usize;
        let mut body = vec![0; len - 4];
        self.socket.read_exact(&mut body).await?;
        Ok(body)
    }

    async fn read_message(&mut self) -> std::io::Result<(u8, Vec<u8>)> {
        let tag = self.socket.read_u8().await?;
        let len = self.socket.read_i32().await? as usize;
        let mut body = vec![0; len - 4];
        self.socket.read_exact(&mut body).await?;
        Ok((tag, body))
    }

    async fn read_password(&mut self) -> std::io::Result<String> {
        let (tag, body) = self.read_message().await?;
        assert_eq!(tag, b'p');
        let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        Ok(String::from_utf8_lossy(&body[..end]).into_owned())
    }

    async fn reject_password(&mut self) -> std::io::Result<()> {
        let msg = fields_message(
            b'E',
            "FATAL",
            "28P01",
            "password authentication failed for user \"alice\"",
        );
        self.send(&msg).await
    }

    async fn serve(&mut self) -> std::io::Result<()> {
        let mut body = self.read_startup().await?;
        if body.len() == 4 && i32::from_be_bytes([body[0], body[1], body[2], body[3]]) == 80877103 {
            self.send(b"N").await?;
            body = self.read_startup().await?;
        }
        let user = startup_param(&body, "user").unwrap_or_default();

        match self.config.auth.clone() {
            Auth::Trust => {}
            Auth::Cleartext(expected) => {
                self.send(&auth(3, &[])).await?;
                if self.read_password().await? != expected {
                    return self.reject_password().await;
                }
            }
            Auth::Md5(expected) => {
                let salt = [7, 3, 1, 9];
                self.send(&auth(5, &salt)).await?;
                if self.read_password().await? != md5_password(&user, &expected, &salt) {
                    return self.reject_password().await;
                }
            }
            Auth::Sasl => {
                let mut mechanisms = Vec::new();
                cstr(&mut mechanisms, "SCRAM-SHA-256");
                mechanisms.push(0);
                self.send(&auth(10, &mechanisms)).await?;
                let _ = self.read_message().await?;
                return Ok(());
            }
        }

        let mut out = auth(0, &[]);
        out.extend(parameter_status("server_version", "16.0"));
        out.extend(parameter_status("client_encoding", "UTF8"));
        let mut key = self.pid.to_be_bytes().to_vec();
        key.extend_from_slice(&42u32.to_be_bytes());
        out.extend(frame(b'K', &key));
        out.extend(self.ready());
        self.send(&out).await?;
        self.stats.authenticated.fetch_add(1, Ordering::SeqCst);

        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'X' => {
                    self.stats.terminated.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                b'Q' => {
                    self.stats.queries.fetch_add(1, Ordering::SeqCst);
                    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                    let sql = String::from_utf8_lossy(&body[..end]).into_owned();
                    if !self.query(&sql).await? {
                        return Ok(());
                    }
                }
                other => panic!("unexpected frontend message {:?}", other as char),
            }
        }
    }

    fn ready(&self) -> Vec<u8> {
        frame(b'Z', &[if self.in_transaction { b'T' } else { b'I' }])
    }

    /// Answer one query string. Returns false when the session must end.
    async fn query(&mut self, sql: &str) -> std::io::Result<bool> {
        let mut out = Vec::new();
        let statements: Vec<&str> = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if statements.is_empty() {
            out.extend(frame(b'I', &[]));
        }

        for statement in statements {
            if statement == "TERMINATE" {
                out.extend(fields_message(
                    b'E',
                    "FATAL",
                    "57P01",
                    "terminating connection due to administrator command",
                ));
                self.send(&out).await?;
                return Ok(false);
            } else if statement == "SELECT pid" {
                out.extend(row_description("pid", 23));
                out.extend(data_row(&self.pid.to_string()));
                out.extend(command_complete("SELECT 1"));
            } else if statement == "SELECT arr" {
                out.extend(row_description("arr", 1007));
                out.extend(data_row("{1,2,NULL}"));
                out.extend(command_complete("SELECT 1"));
            } else if statement == "BEGIN" {
                self.in_transaction = true;
                out.extend(command_complete("BEGIN"));
            } else if statement == "COMMIT" {
                self.in_transaction = false;
                out.extend(command_complete("COMMIT"));
            } else if statement == "NOTICE" {
                out.extend(fields_message(b'N', "NOTICE", "00000", "just so you know"));
                out.extend(command_complete("DO"));
            } else if let Some(ms) = statement
                .strip_prefix("SLEEP ")
                .and_then(|ms| ms.parse::<u64>().ok())
            {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                out.extend(command_complete("SELECT 0"));
            } else if let Some(rest) = statement.strip_prefix("SET ") {
                let (name, value) = rest.split_once(" TO ").unwrap_or((rest, ""));
                out.extend(command_complete("SET"));
                out.extend(parameter_status(name, value));
            } else if let Some(n) = statement
                .strip_prefix("SELECT ")
                .and_then(|n| n.parse::<i64>().ok())
            {
                out.extend(row_description("?column?", 23));
                out.extend(data_row(&n.to_string()));
                out.extend(command_complete("SELECT 1"));
            } else {
                out.extend(fields_message(
                    b'E',
                    "ERROR",
                    "42601",
                    &format!("syntax error at or near \"{}\"", statement),
                ));
                break;
            }
        }

        out.extend(self.ready());
        self.send(&out).await?;
        Ok(true)
    }
}

fn startup_param(body: &[u8], name: &str) -> Option<String> {
    let mut parts = body[4..]
        .split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned());
    while let Some(key) = parts.next() {
        let value = parts.next()?;
        if key == name {
            return Some(value);
        }
    }
    None
}
