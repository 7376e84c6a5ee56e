//! A simulated database host for tests.
//!
//! Understands the handful of commands the backup recipes issue and keeps a
//! fake filesystem, so a test can assert what a run left behind.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::remote::{CommandOutput, RemoteConnector, RemoteCredentials, RemoteFile, RemoteShell};
use crate::adapters::ByteStream;
use crate::errors::{RemoteError, SshResult};

#[derive(Clone)]
pub struct SimulatedHost {
    address: String,
    state: Arc<Mutex<HostState>>,
    open_sessions: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
}

struct SimFile {
    data: Bytes,
    /// Minutes since the last write.
    age: u64,
}

struct HostState {
    files: BTreeMap<String, SimFile>,
    commands: Vec<String>,
    failures: Vec<(String, i32, String)>,
    questdb_backup_dir: String,
    snapshot_dir: String,
    /// Polls before a created snapshot shows up on disk; `None` never.
    snapshot_ready_after: Option<u32>,
    pending_snapshot: Option<(String, u32)>,
    snapshots_created: u32,
}

impl SimulatedHost {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Arc::new(Mutex::new(HostState {
                files: BTreeMap::new(),
                commands: Vec::new(),
                failures: Vec::new(),
                questdb_backup_dir: "/var/lib/questdb/backup".to_string(),
                snapshot_dir: "/qdrant/snapshots".to_string(),
                snapshot_ready_after: Some(0),
                pending_snapshot: None,
                snapshots_created: 0,
            })),
            open_sessions: Arc::new(AtomicUsize::new(0)),
            connections: Arc::new(AtomicUsize::new(0)),
            refuse: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_file(self, path: &str, data: &str) -> Self {
        self.lock().write(path, Bytes::from(data.to_string()));
        self
    }

    /// Any command containing `pattern` exits with `code`.
    pub fn fail_on(self, pattern: &str, code: i32, stderr: &str) -> Self {
        self.lock()
            .failures
            .push((pattern.to_string(), code, stderr.to_string()));
        self
    }

    pub fn with_snapshot_dir(self, dir: &str) -> Self {
        self.lock().snapshot_dir = dir.to_string();
        self
    }

    pub fn with_questdb_backup_dir(self, dir: &str) -> Self {
        self.lock().questdb_backup_dir = dir.to_string();
        self
    }

    pub fn snapshot_ready_after(self, polls: Option<u32>) -> Self {
        self.lock().snapshot_ready_after = polls;
        self
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Ages every file on the host, as seen by `find -mmin`.
    pub fn advance_minutes(&self, minutes: u64) {
        for file in self.lock().files.values_mut() {
            file.age += minutes;
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn file(&self, path: &str) -> Option<Bytes> {
        self.lock().files.get(path).map(|f| f.data.clone())
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        // a panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RemoteConnector for SimulatedHost {
    async fn connect(&self, _credentials: &RemoteCredentials) -> SshResult<Box<dyn RemoteShell>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RemoteError::ConnectionError {
                address: self.address.clone(),
                error: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedShell {
            host: self.clone(),
        }))
    }
}

struct SimulatedShell {
    host: SimulatedHost,
}

impl Drop for SimulatedShell {
    fn drop(&mut self) {
        self.host.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteShell for SimulatedShell {
    fn address(&self) -> &str {
        &self.host.address
    }

    async fn exec(&self, command: &str) -> SshResult<CommandOutput> {
        Ok(self.host.lock().execute(command))
    }

    async fn download(&self, path: &str) -> SshResult<RemoteFile> {
        match self.host.file(path) {
            Some(data) => Ok(RemoteFile {
                size: data.len() as u64,
                data: ByteStream::from_bytes(data),
            }),
            None => Err(RemoteError::ConnectionError {
                address: self.host.address.clone(),
                error: io::Error::new(io::ErrorKind::NotFound, format!("scp: {path}: not found")),
            }),
        }
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl HostState {
    fn execute(&mut self, command: &str) -> CommandOutput {
        self.commands.push(command.to_string());
        if let Some((_, code, stderr)) = self
            .failures
            .iter()
            .find(|(pattern, _, _)| command.contains(pattern.as_str()))
        {
            return failed(*code, stderr);
        }

        let mut words: Vec<String> = command
            .split_whitespace()
            .map(|w| w.trim_matches(|c| c == '\'' || c == '"' || c == ';').to_string())
            .collect();
        if words.starts_with(&["bash".into(), "-o".into(), "pipefail".into(), "-c".into()]) {
            words.drain(..4);
        }
        let program = words.first().cloned().unwrap_or_default();

        if let Some(pos) = words.iter().position(|w| w == ">") {
            let Some(target) = words.get(pos + 1) else {
                return failed(2, "syntax error");
            };
            let content = format!("{} output\n", words[..pos].join(" "));
            let target = target.clone();
            self.write(&target, Bytes::from(content));
            return ok("");
        }
        if let Some(dir) = words.iter().find_map(|w| w.strip_prefix("--out=")) {
            let path = format!("{dir}/admin/system.version.bson");
            self.write(&path, Bytes::from_static(b"bson"));
            return ok("");
        }

        match program.as_str() {
            "tar" => self.tar(&words),
            "rm" => {
                for path in words[1..].iter().filter(|w| !w.starts_with('-')) {
                    self.remove_tree(path, true);
                }
                ok("")
            }
            "find" => self.find(&words),
            // directories exist implicitly
            "mkdir" => ok(""),
            "test" => match words.get(2) {
                Some(path) if self.files.contains_key(path) => ok(""),
                _ => failed(1, ""),
            },
            "curl" => self.curl(command),
            "for" => self.locate_snapshot(&words),
            _ => failed(127, &format!("{program}: command not found")),
        }
    }

    fn write(&mut self, path: &str, data: Bytes) {
        self.files
            .insert(path.to_string(), SimFile { data, age: 0 });
    }

    /// `path` itself if it is a file, else every file below it.
    fn tree(&self, path: &str) -> Vec<String> {
        let dir = format!("{}/", path.trim_end_matches('/'));
        self.files
            .keys()
            .filter(|k| *k == path || k.starts_with(&dir))
            .cloned()
            .collect()
    }

    fn remove_tree(&mut self, path: &str, including_self: bool) {
        let dir = format!("{}/", path.trim_end_matches('/'));
        self.files
            .retain(|k, _| !(k.starts_with(&dir) || (including_self && k == path)));
    }

    fn tar(&mut self, words: &[String]) -> CommandOutput {
        let Some(archive) = words
            .iter()
            .position(|w| w == "-czf")
            .and_then(|pos| words.get(pos + 1))
        else {
            return failed(2, "tar: no archive given");
        };
        let Some(cpos) = words.iter().position(|w| w == "-C") else {
            return failed(2, "tar: no directory given");
        };
        let Some(base) = words.get(cpos + 1) else {
            return failed(2, "tar: no directory given");
        };
        // the archive lists the files it holds
        let mut content = String::new();
        for entry in &words[cpos + 2..] {
            let path = if entry == "." {
                base.clone()
            } else {
                format!("{base}/{entry}")
            };
            let tree = self.tree(&path);
            if tree.is_empty() {
                return failed(2, &format!("tar: {path}: Cannot stat: No such file or directory"));
            }
            for file in tree {
                content.push_str(&file);
                content.push('\n');
            }
        }
        let archive = archive.clone();
        self.write(&archive, Bytes::from(content));
        ok("")
    }

    /// `find DIR -mindepth 1 -delete` empties DIR. With `-name PREFIX*` and
    /// `-mmin +N` it removes the matching top-level entries whose newest file
    /// is older than N minutes.
    fn find(&mut self, words: &[String]) -> CommandOutput {
        let Some(dir) = words.get(1).cloned() else {
            return failed(1, "find: missing path");
        };
        let arg = |flag: &str| {
            words
                .iter()
                .position(|w| w == flag)
                .and_then(|pos| words.get(pos + 1))
        };
        let Some(pattern) = arg("-name") else {
            self.remove_tree(&dir, false);
            return ok("");
        };
        let prefix = pattern.trim_end_matches('*').to_string();
        let older_than = match arg("-mmin").map(|m| m.trim_start_matches('+').parse::<u64>()) {
            Some(Ok(minutes)) => minutes,
            Some(Err(_)) => return failed(1, "find: invalid argument to -mmin"),
            None => 0,
        };

        let base = format!("{}/", dir.trim_end_matches('/'));
        let mut newest: BTreeMap<String, u64> = BTreeMap::new();
        for (path, file) in &self.files {
            let Some(rest) = path.strip_prefix(&base) else {
                continue;
            };
            let name = rest.split('/').next().unwrap_or(rest);
            if name.starts_with(&prefix) {
                let age = newest.entry(format!("{base}{name}")).or_insert(u64::MAX);
                *age = (*age).min(file.age);
            }
        }
        for (entry, age) in newest {
            if age > older_than {
                self.remove_tree(&entry, true);
            }
        }
        ok("")
    }

    fn curl(&mut self, command: &str) -> CommandOutput {
        if command.contains("BACKUP DATABASE") {
            let meta = format!("{}/2024-01-01/db/_meta", self.questdb_backup_dir);
            self.write(&meta, Bytes::from_static(b"meta"));
            return ok(r#"{"ddl":"OK"}"#);
        }
        if command.contains("-X POST") && command.contains("/snapshots") {
            self.snapshots_created += 1;
            let name = format!("full-snapshot-2024-01-01-00-00-{:02}.snapshot", self.snapshots_created);
            match self.snapshot_ready_after {
                Some(0) => self.materialize_snapshot(&name),
                Some(polls) => self.pending_snapshot = Some((name.clone(), polls)),
                None => self.pending_snapshot = Some((name.clone(), u32::MAX)),
            }
            return ok(&format!(
                r#"{{"result":{{"name":"{name}","creation_time":"2024-01-01T00:00:00","size":1024}},"status":"ok","time":0.5}}"#
            ));
        }
        if command.contains("-X DELETE") {
            if let Some(name) = command
                .split_whitespace()
                .last()
                .map(|url| url.trim_matches('\''))
                .and_then(|url| url.rsplit('/').next())
            {
                let dir = self.snapshot_dir.clone();
                self.files.remove(&format!("{dir}/{name}"));
                self.files.remove(&format!("{dir}/{name}.checksum"));
            }
            return ok(r#"{"result":true,"status":"ok"}"#);
        }
        failed(22, "curl: (22) The requested URL returned error: 404")
    }

    fn materialize_snapshot(&mut self, name: &str) {
        let dir = self.snapshot_dir.clone();
        self.write(&format!("{dir}/{name}"), Bytes::from_static(b"snapshot"));
        self.write(&format!("{dir}/{name}.checksum"), Bytes::from_static(b"sha256"));
    }

    fn locate_snapshot(&mut self, words: &[String]) -> CommandOutput {
        if let Some((name, remaining)) = self.pending_snapshot.take() {
            if remaining == u32::MAX {
                self.pending_snapshot = Some((name, remaining));
            } else if remaining <= 1 {
                self.materialize_snapshot(&name);
            } else {
                self.pending_snapshot = Some((name, remaining - 1));
            }
        }
        let dirs = words
            .iter()
            .skip_while(|w| *w != "in")
            .skip(1)
            .take_while(|w| *w != "do");
        let Some(name) = words.iter().find_map(|w| w.strip_prefix("$d/")) else {
            return failed(2, "syntax error");
        };
        for dir in dirs {
            if self.files.contains_key(&format!("{dir}/{name}")) {
                return ok(&format!("{dir}\n"));
            }
        }
        ok("")
    }
}
