//! Spawn node processes and detect readiness from their output.

use crate::{
    signal::{Signal, Signaler},
    Error,
};
use std::{
    net::SocketAddr,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    process::{Child, Command},
};
use tracing::{debug, info, warn};

/// Line printed once the HTTP JSON RPC server accepts requests.
pub const HTTP_READY_PREFIX: &str = "Starting HTTP JSON RPC server on port ";

/// Line printed once the node accepts P2P connections.
pub const P2P_READY_PREFIX: &str = "Listening for P2P connections on port ";

/// Credentials the RPC server is started with.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Everything needed to start one node process.
#[derive(Clone, Debug)]
pub struct Launch {
    pub binary: PathBuf,
    pub data_dir: PathBuf,
    pub genesis: PathBuf,
    pub credentials: Credentials,
    pub http_port: Option<u16>,
    pub p2p_port: Option<u16>,
    pub rpc_port: Option<u16>,
    /// Peer to connect to on startup (every node but the first).
    pub peer: Option<SocketAddr>,
}

impl Launch {
    /// Command line arguments passed to the node binary.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--data-dir".to_string(),
            self.data_dir.display().to_string(),
            "--genesis-config".to_string(),
            self.genesis.display().to_string(),
            "--min-delegate-connection-count".to_string(),
            "0".to_string(),
            "--server".to_string(),
            "--rpcuser".to_string(),
            self.credentials.user.clone(),
            "--rpcpassword".to_string(),
            self.credentials.password.clone(),
            "--upnp".to_string(),
            "false".to_string(),
            "--disable-default-peers".to_string(),
        ];
        if let Some(port) = self.http_port {
            args.extend(["--httpport".to_string(), port.to_string()]);
        }
        if let Some(port) = self.p2p_port {
            args.extend(["--p2p-port".to_string(), port.to_string()]);
        }
        if let Some(port) = self.rpc_port {
            args.extend(["--rpcport".to_string(), port.to_string()]);
        }
        if let Some(peer) = self.peer {
            args.extend(["--connect-to".to_string(), peer.to_string()]);
        }
        args
    }
}

/// Extract the port from a readiness line starting with `prefix`.
pub fn parse_port(line: &str, prefix: &str) -> Option<u16> {
    let rest = line.strip_prefix(prefix)?;
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// A running node process and its readiness signals.
pub struct Process {
    node: usize,
    child: Child,
    http: Signal,
    p2p: Signal,
}

impl Process {
    /// Spawn the node binary and start scanning its output.
    ///
    /// A spawn failure is returned immediately and affects only this node.
    pub fn spawn(node: usize, launch: &Launch) -> Result<Self, Error> {
        let args = launch.args();
        info!(node, binary = ?launch.binary, ?args, "spawning node");
        let mut child = Command::new(&launch.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn { node, source })?;

        let (http_signaler, http) = Signaler::new();
        let (p2p_signaler, p2p) = Signaler::new();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(scan_stdout(
                node,
                BufReader::new(stdout),
                http_signaler,
                p2p_signaler,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(node, BufReader::new(stderr)));
        }

        Ok(Self {
            node,
            child,
            http,
            p2p,
        })
    }

    /// Resolved with the port of the HTTP JSON RPC server.
    pub fn http_ready(&self) -> &Signal {
        &self.http
    }

    /// Resolved with the port of the P2P listener.
    pub fn p2p_ready(&self) -> &Signal {
        &self.p2p
    }

    /// OS identifier of the process (if it has not been reaped).
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait up to `grace` for the process to exit on its own.
    ///
    /// The process is never killed: if it is still running after `grace`, `None` is returned.
    pub async fn wait_exit(&mut self, grace: Duration) -> Result<Option<ExitStatus>, Error> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(node = self.node, ?status, "node exited");
                Ok(Some(status))
            }
            Err(_) => {
                warn!(node = self.node, ?grace, "node still running after grace period");
                Ok(None)
            }
        }
    }
}

/// Forward every stdout line and resolve each readiness signal on its first matching line.
///
/// Returns once the stream closes. Unresolved signalers are dropped at that point, releasing
/// anyone still waiting on them.
pub async fn scan_stdout<R: AsyncBufRead + Unpin>(
    node: usize,
    reader: R,
    http: Signaler,
    p2p: Signaler,
) {
    let mut lines = Lines::new(reader);
    loop {
        let line = match lines.next().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(node, ?err, "failed to read stdout");
                break;
            }
        };
        debug!(node, line = line.as_str(), "stdout");

        if !http.is_resolved() {
            if let Some(port) = parse_port(&line, HTTP_READY_PREFIX) {
                http.resolve(port);
                info!(node, port, "http server ready");
            }
        }
        if !p2p.is_resolved() {
            if let Some(port) = parse_port(&line, P2P_READY_PREFIX) {
                p2p.resolve(port);
                info!(node, port, "p2p listener ready");
            }
        }
    }
    debug!(node, "stdout closed");
}

/// Forward every stderr line.
pub async fn forward_stderr<R: AsyncBufRead + Unpin>(node: usize, reader: R) {
    let mut lines = Lines::new(reader);
    loop {
        match lines.next().await {
            Ok(Some(line)) => warn!(node, line = line.as_str(), "stderr"),
            Ok(None) => break,
            Err(err) => {
                warn!(node, ?err, "failed to read stderr");
                break;
            }
        }
    }
    debug!(node, "stderr closed");
}

/// Splits a byte stream into lines, replacing invalid UTF-8 instead of failing on it.
struct Lines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> Lines<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// The next line without its terminator, or `None` once the stream closes.
    async fn next(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(peer: Option<SocketAddr>) -> Launch {
        Launch {
            binary: PathBuf::from("node"),
            data_dir: PathBuf::from("tmp/1"),
            genesis: PathBuf::from("tmp/genesis.json"),
            credentials: Credentials {
                user: "user".to_string(),
                password: "pass".to_string(),
            },
            http_port: Some(9101),
            p2p_port: Some(9201),
            rpc_port: None,
            peer,
        }
    }

    #[test]
    fn test_args() {
        let peer = "127.0.0.1:9200".parse().unwrap();
        let args = launch(Some(peer)).args();
        assert_eq!(
            args,
            vec![
                "--data-dir",
                "tmp/1",
                "--genesis-config",
                "tmp/genesis.json",
                "--min-delegate-connection-count",
                "0",
                "--server",
                "--rpcuser",
                "user",
                "--rpcpassword",
                "pass",
                "--upnp",
                "false",
                "--disable-default-peers",
                "--httpport",
                "9101",
                "--p2p-port",
                "9201",
                "--connect-to",
                "127.0.0.1:9200",
            ]
        );
    }

    #[test]
    fn test_args_without_peer() {
        let args = launch(None).args();
        assert!(!args.iter().any(|arg| arg == "--connect-to"));
        assert!(!args.iter().any(|arg| arg == "--rpcport"));
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(
            parse_port("Starting HTTP JSON RPC server on port 9100", HTTP_READY_PREFIX),
            Some(9100)
        );
        assert_eq!(
            parse_port(
                "Listening for P2P connections on port 9200...",
                P2P_READY_PREFIX
            ),
            Some(9200)
        );
        assert_eq!(
            parse_port(" Starting HTTP JSON RPC server on port 9100", HTTP_READY_PREFIX),
            None
        );
        assert_eq!(
            parse_port("Starting HTTP JSON RPC server on port x", HTTP_READY_PREFIX),
            None
        );
        assert_eq!(
            parse_port("Starting HTTP JSON RPC server on port 99999", HTTP_READY_PREFIX),
            None
        );
    }

    #[tokio::test]
    async fn test_scan_stdout_first_match_wins() {
        let output: &[u8] = b"booting\n\
            Starting HTTP JSON RPC server on port 9100...\n\
            Listening for P2P connections on port 9200\n\
            Starting HTTP JSON RPC server on port 9999\n\
            Listening for P2P connections on port 9998\n";
        let (http_signaler, http) = Signaler::new();
        let (p2p_signaler, p2p) = Signaler::new();
        scan_stdout(0, output, http_signaler, p2p_signaler).await;
        assert_eq!(http.wait().await, Some(9100));
        assert_eq!(p2p.wait().await, Some(9200));
    }

    #[tokio::test]
    async fn test_scan_stdout_invalid_utf8() {
        let output: &[u8] = b"caf\xe9 log line\n\
            Starting HTTP JSON RPC server on port 9100\n\
            \xff\xfe\r\n\
            Listening for P2P connections on port 9200\r\n";
        let (http_signaler, http) = Signaler::new();
        let (p2p_signaler, p2p) = Signaler::new();
        scan_stdout(0, output, http_signaler, p2p_signaler).await;
        assert_eq!(http.wait().await, Some(9100));
        assert_eq!(p2p.wait().await, Some(9200));
    }

    #[tokio::test]
    async fn test_lines_lossy() {
        let input: &[u8] = b"one\r\nt\xffo\nlast";
        let mut lines = Lines::new(input);
        assert_eq!(lines.next().await.unwrap().as_deref(), Some("one"));
        assert_eq!(lines.next().await.unwrap().as_deref(), Some("t\u{fffd}o"));
        assert_eq!(lines.next().await.unwrap().as_deref(), Some("last"));
        assert_eq!(lines.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_forward_stderr_survives_invalid_utf8() {
        use tokio::io::AsyncWriteExt;

        let (mut writer, reader) = tokio::io::duplex(64);
        let forwarder = tokio::spawn(forward_stderr(2, BufReader::new(reader)));
        writer.write_all(b"bad \xc3\x28 bytes\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!forwarder.is_finished());

        // Still reading after the bad line
        writer.write_all(b"still here\n").await.unwrap();
        drop(writer);
        forwarder.await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_stdout_closed_before_ready() {
        let output: &[u8] = b"Starting HTTP JSON RPC server on port 9100\nbye\n";
        let (http_signaler, http) = Signaler::new();
        let (p2p_signaler, p2p) = Signaler::new();
        scan_stdout(3, output, http_signaler, p2p_signaler).await;
        assert_eq!(http.wait().await, Some(9100));
        assert_eq!(p2p.wait().await, None);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let mut launch = launch(None);
        launch.binary = PathBuf::from("/nonexistent/lockstep-node");
        match Process::spawn(4, &launch) {
            Err(Error::Spawn { node, .. }) => assert_eq!(node, 4),
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_detects_readiness() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("lockstep-supervisor-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("node.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             echo 'warming up'\n\
             echo 'oops' >&2\n\
             echo 'Listening for P2P connections on port 9201'\n\
             echo 'Starting HTTP JSON RPC server on port 9101'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut launch = launch(None);
        launch.binary = script;
        let mut process = Process::spawn(1, &launch).unwrap();
        assert_eq!(process.http_ready().wait().await, Some(9101));
        assert_eq!(process.p2p_ready().wait().await, Some(9201));
        let status = process.wait_exit(Duration::from_secs(5)).await.unwrap();
        assert!(status.unwrap().success());

        std::fs::remove_dir_all(&dir).ok();
    }
}
