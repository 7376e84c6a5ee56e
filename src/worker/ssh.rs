use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use ssh2::Session;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::remote::{CommandOutput, RemoteConnector, RemoteCredentials, RemoteFile, RemoteShell};
use crate::adapters::ByteStream;
use crate::errors::{RemoteError, SshResult};

const CHUNK_SIZE: usize = 256 * 1024;
/// Chunks buffered between the ssh reader and the uploader.
const CHANNEL_DEPTH: usize = 8;
/// Sleep between drain passes when neither stream has data.
const IDLE_WAIT: Duration = Duration::from_millis(20);

/// Opens authenticated ssh sessions using an in-memory private key.
///
/// libssh2 is blocking, so every call runs on tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct SshConnector {
    port: u16,
    timeout: Duration,
    command_timeout: Duration,
}

impl SshConnector {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(6 * 60 * 60),
        }
    }

    /// Bounds connect, handshake and authentication.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bounds a single remote command, dumps included.
    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    fn address(&self, host: &str) -> String {
        if host.contains(':') {
            host.to_string()
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(&self, credentials: &RemoteCredentials) -> SshResult<Box<dyn RemoteShell>> {
        let address = self.address(&credentials.host);
        let credentials = credentials.clone();
        let timeout = self.timeout;
        let command_timeout = self.command_timeout;
        let shell = tokio::task::spawn_blocking(move || {
            SshShell::open(address, &credentials, timeout, command_timeout)
        })
        .await??;
        Ok(Box::new(shell))
    }
}

pub struct SshShell {
    address: String,
    session: Session,
    command_timeout: Duration,
}

impl SshShell {
    fn open(
        address: String,
        credentials: &RemoteCredentials,
        timeout: Duration,
        command_timeout: Duration,
    ) -> SshResult<Self> {
        let connection_error = |error: io::Error| RemoteError::ConnectionError {
            address: address.clone(),
            error,
        };
        let session_error = |error: ssh2::Error| RemoteError::SessionError {
            address: address.clone(),
            error,
        };

        let socket = address
            .to_socket_addrs()
            .map_err(connection_error)?
            .next()
            .ok_or_else(|| {
                connection_error(io::Error::new(
                    io::ErrorKind::NotFound,
                    "host did not resolve",
                ))
            })?;
        let tcp = TcpStream::connect_timeout(&socket, timeout).map_err(connection_error)?;

        let mut session = Session::new().map_err(session_error)?;
        session.set_timeout(timeout.as_millis().min(u128::from(u32::MAX)) as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(session_error)?;
        session
            .userauth_pubkey_memory(&credentials.username, None, &credentials.private_key, None)
            .map_err(session_error)?;
        // the connect timeout must not cap long dumps or scp reads
        session.set_timeout(0);
        debug!("opened ssh session with {}", address);

        Ok(Self {
            address,
            session,
            command_timeout,
        })
    }
}

/// Reads both streams of a running command until each reports end of file.
///
/// The readers are expected to be non-blocking: `WouldBlock` means "nothing
/// yet". Stdout and stderr are polled in turn so a command that fills its
/// stderr window before writing stdout cannot stall the read.
pub(crate) fn drain<O: Read, E: Read>(
    stdout: &mut O,
    stderr: &mut E,
    timeout: Duration,
) -> Result<(Vec<u8>, Vec<u8>), DrainError> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut out_done = false;
    let mut err_done = false;
    let mut buf = [0u8; 8192];

    while !(out_done && err_done) {
        let mut progressed = false;
        if !out_done {
            match stdout.read(&mut buf) {
                Ok(0) => out_done = true,
                Ok(n) => {
                    out.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => progressed = true,
                Err(e) => return Err(DrainError::Io(e)),
            }
        }
        if !err_done {
            match stderr.read(&mut buf) {
                Ok(0) => err_done = true,
                Ok(n) => {
                    err.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => progressed = true,
                Err(e) => return Err(DrainError::Io(e)),
            }
        }
        if Instant::now() >= deadline {
            return Err(DrainError::TimedOut);
        }
        if !progressed && !(out_done && err_done) {
            std::thread::sleep(IDLE_WAIT);
        }
    }
    Ok((out, err))
}

#[derive(Debug)]
pub(crate) enum DrainError {
    Io(io::Error),
    TimedOut,
}

#[async_trait]
impl RemoteShell for SshShell {
    fn address(&self) -> &str {
        &self.address
    }

    async fn exec(&self, command: &str) -> SshResult<CommandOutput> {
        let session = self.session.clone();
        let address = self.address.clone();
        let command = command.to_string();
        let command_timeout = self.command_timeout;
        // may carry the qdrant api key
        debug!("[{}] exec ({} bytes)", address, command.len());
        let output = tokio::task::spawn_blocking(move || {
            let session_error = |error: ssh2::Error| RemoteError::SessionError {
                address: address.clone(),
                error,
            };
            let io_error = |error: io::Error| RemoteError::ConnectionError {
                address: address.clone(),
                error,
            };

            let mut channel = session.channel_session().map_err(session_error)?;
            channel.exec(&command).map_err(session_error)?;

            let mut out = channel.stream(0);
            let mut err = channel.stderr();
            session.set_blocking(false);
            let drained = drain(&mut out, &mut err, command_timeout);
            session.set_blocking(true);
            let (stdout, stderr) = match drained {
                Ok(streams) => streams,
                Err(DrainError::Io(error)) => return Err(io_error(error)),
                Err(DrainError::TimedOut) => {
                    let _ = channel.close();
                    return Err(RemoteError::CommandTimeout {
                        address: address.clone(),
                        after: command_timeout,
                    });
                }
            };

            channel.wait_close().map_err(session_error)?;
            let code = channel.exit_status().map_err(session_error)?;
            Ok::<_, RemoteError>(CommandOutput {
                code,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        })
        .await??;
        Ok(output)
    }

    async fn download(&self, path: &str) -> SshResult<RemoteFile> {
        let session = self.session.clone();
        let address = self.address.clone();
        let path = path.to_string();
        let (size_tx, size_rx) = oneshot::channel::<SshResult<u64>>();
        let (tx, data) = ByteStream::channel(CHANNEL_DEPTH);

        // the channel never leaves this thread
        tokio::task::spawn_blocking(move || {
            let (mut channel, stat) = match session.scp_recv(Path::new(&path)) {
                Ok(opened) => opened,
                Err(error) => {
                    let _ = size_tx.send(Err(RemoteError::SessionError { address, error }));
                    return;
                }
            };
            let size = stat.size();
            if size_tx.send(Ok(size)).is_err() {
                return;
            }

            let mut remaining = size;
            let mut buf = vec![0u8; CHUNK_SIZE];
            while remaining > 0 {
                let want = remaining.min(CHUNK_SIZE as u64) as usize;
                match channel.read(&mut buf[..want]) {
                    Ok(0) => {
                        tx.blocking_send(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("{path} ended {remaining} bytes early"),
                        )));
                        return;
                    }
                    Ok(n) => {
                        remaining -= n as u64;
                        if !tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))) {
                            debug!("[{}] reader of {} went away", address, path);
                            return;
                        }
                    }
                    Err(e) => {
                        tx.blocking_send(Err(e));
                        return;
                    }
                }
            }
            let _ = channel.send_eof();
            let _ = channel.wait_eof();
            let _ = channel.close();
            let _ = channel.wait_close();
        });

        let size = size_rx.await.map_err(|_| RemoteError::ConnectionError {
            address: self.address.clone(),
            error: io::Error::new(io::ErrorKind::Other, "scp reader stopped"),
        })??;
        Ok(RemoteFile { size, data })
    }
}
