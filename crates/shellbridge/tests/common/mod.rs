#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shellbridge::config::GatewayConfig;
use shellbridge::device::{AuthMethod, DeviceAuth, DeviceRecord, StaticDeviceDirectory};
use shellbridge::{
    ClientHandle, ConnectParams, ConnectionFactory, Connector, Error, FileTransfer, GatewayAdapter,
    HostResolver, PtyRequest, RemoteAttrs, RemoteConnection, RemoteEntry, RemoteTermination,
    Result, ServerEvent, ShellChannel, ShellInput, ShellOutput, ShellWriter,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

pub const DEVICE: &str = "dev-1";
pub const DEVICE_HOST: &str = "10.0.0.5";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

// -----------------------------------------------------------------------------
// Directory and resolver
// -----------------------------------------------------------------------------

pub fn password_auth() -> DeviceAuth {
    DeviceAuth {
        port: 22,
        user: "root".into(),
        method: AuthMethod::Password {
            password: "secret".into(),
        },
    }
}

pub fn directory(devices: &[(&str, &str)]) -> StaticDeviceDirectory {
    StaticDeviceDirectory::from_records(devices.iter().map(|(uuid, host)| DeviceRecord {
        uuid: (*uuid).to_string(),
        host: (*host).to_string(),
        auth: Some(password_auth()),
    }))
}

/// Resolver answering from a fixed table.
#[derive(Default)]
pub struct FakeResolver {
    pub table: HashMap<String, Vec<Ipv4Addr>>,
    pub calls: AtomicUsize,
}

impl FakeResolver {
    pub fn with(entries: &[(&str, Ipv4Addr)]) -> Self {
        let mut table: HashMap<String, Vec<Ipv4Addr>> = HashMap::new();
        for (name, addr) in entries {
            table.entry((*name).to_string()).or_default().push(*addr);
        }
        Self {
            table,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostResolver for FakeResolver {
    async fn lookup_ipv4(&self, hostname: &str) -> io::Result<Vec<Ipv4Addr>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.table
            .get(hostname)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "NXDOMAIN"))
    }
}

// -----------------------------------------------------------------------------
// Connector
// -----------------------------------------------------------------------------

/// What the fake connector does on `connect`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    RejectAuth,
    Hang,
    /// Succeeds after the given delay.
    Delay(Duration),
    Panic,
}

/// Connector handing out [`FakeConnection`]s.
pub struct FakeConnector {
    behavior: Mutex<ConnectBehavior>,
    shell_fails: Mutex<bool>,
    banner: Mutex<Option<String>>,
    sftp_root: Option<PathBuf>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    params: Mutex<Vec<ConnectParams>>,
}

impl FakeConnector {
    pub fn new(sftp_root: Option<PathBuf>) -> Self {
        Self {
            behavior: Mutex::new(ConnectBehavior::Succeed),
            shell_fails: Mutex::new(false),
            banner: Mutex::new(None),
            sftp_root,
            connections: Mutex::new(Vec::new()),
            params: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn fail_shells(&self) {
        *self.shell_fails.lock() = true;
    }

    pub fn set_banner(&self, banner: &str) {
        *self.banner.lock() = Some(banner.to_string());
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }

    pub fn last_connection(&self) -> Arc<FakeConnection> {
        self.connections
            .lock()
            .last()
            .cloned()
            .expect("no connection made")
    }

    pub fn params(&self) -> Vec<ConnectParams> {
        self.params.lock().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn RemoteConnection>> {
        self.params.lock().push(params.clone());
        let behavior = *self.behavior.lock();
        match behavior {
            ConnectBehavior::Succeed => {}
            ConnectBehavior::RejectAuth => return Err(Error::AuthenticationFailure),
            ConnectBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            ConnectBehavior::Delay(delay) => tokio::time::sleep(delay).await,
            ConnectBehavior::Panic => panic!("connector failure"),
        }
        let connection = Arc::new(FakeConnection::new(
            *self.shell_fails.lock(),
            self.banner.lock().clone(),
            self.sftp_root.clone(),
        ));
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

// -----------------------------------------------------------------------------
// Connection
// -----------------------------------------------------------------------------

/// Test side of one opened shell.
pub struct ShellEndpoint {
    pub request: PtyRequest,
    pub output: mpsc::Sender<ShellOutput>,
    input: tokio::sync::Mutex<mpsc::UnboundedReceiver<ShellInput>>,
}

impl ShellEndpoint {
    /// Returns the next input the session wrote to the shell.
    pub async fn next_input(&self) -> Option<ShellInput> {
        let mut input = self.input.lock().await;
        tokio::time::timeout(DEFAULT_TIMEOUT, input.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn send_output(&self, bytes: &[u8]) {
        self.output
            .send(ShellOutput::Data(bytes.to_vec()))
            .await
            .expect("shell output receiver gone");
    }
}

pub struct FakeConnection {
    shell_fails: bool,
    banner: Option<String>,
    sftp_root: Option<PathBuf>,
    close_count: AtomicUsize,
    sftp_opens: AtomicUsize,
    termination: watch::Sender<Option<RemoteTermination>>,
    shells: Mutex<Vec<Arc<ShellEndpoint>>>,
    transfers: Mutex<Vec<Arc<LocalFileTransfer>>>,
}

impl FakeConnection {
    pub fn new(shell_fails: bool, banner: Option<String>, sftp_root: Option<PathBuf>) -> Self {
        let (termination, _rx) = watch::channel(None);
        Self {
            shell_fails,
            banner,
            sftp_root,
            close_count: AtomicUsize::new(0),
            sftp_opens: AtomicUsize::new(0),
            termination,
            shells: Mutex::new(Vec::new()),
            transfers: Mutex::new(Vec::new()),
        }
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn sftp_opens(&self) -> usize {
        self.sftp_opens.load(Ordering::SeqCst)
    }

    pub fn shell(&self) -> Arc<ShellEndpoint> {
        self.shells.lock().last().cloned().expect("no shell opened")
    }

    pub fn transfer(&self) -> Arc<LocalFileTransfer> {
        self.transfers
            .lock()
            .last()
            .cloned()
            .expect("no sftp subsystem opened")
    }

    /// Terminates the connection from the device's side.
    pub fn terminate(&self, termination: RemoteTermination) {
        self.termination.send_replace(Some(termination));
    }
}

#[async_trait]
impl RemoteConnection for FakeConnection {
    fn banner(&self) -> Option<String> {
        self.banner.clone()
    }

    async fn open_shell(&self, pty: &PtyRequest) -> Result<ShellChannel> {
        if self.shell_fails {
            return Err(Error::ShellAllocation("pty-req request refused".into()));
        }
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(64);
        self.shells.lock().push(Arc::new(ShellEndpoint {
            request: pty.clone(),
            output: output_tx,
            input: tokio::sync::Mutex::new(input_rx),
        }));
        Ok(ShellChannel {
            writer: ShellWriter::new(input_tx),
            output: output_rx,
        })
    }

    async fn open_sftp(&self) -> Result<Arc<dyn FileTransfer>> {
        self.sftp_opens.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let root = self
            .sftp_root
            .clone()
            .ok_or_else(|| Error::SubsystemUnavailable("subsystem request refused".into()))?;
        let transfer = Arc::new(LocalFileTransfer::new(root));
        self.transfers.lock().push(Arc::clone(&transfer));
        Ok(transfer)
    }

    async fn closed(&self) -> RemoteTermination {
        let mut rx = self.termination.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone().unwrap_or(RemoteTermination::Close),
            Err(_) => RemoteTermination::Close,
        }
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.termination.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(RemoteTermination::Close);
                true
            } else {
                false
            }
        });
    }
}

// -----------------------------------------------------------------------------
// SFTP backed by a local directory
// -----------------------------------------------------------------------------

/// `FileTransfer` rooted at a local directory. Remote `/a/b` maps to `<root>/a/b`.
pub struct LocalFileTransfer {
    root: PathBuf,
    operations: AtomicUsize,
    closes: AtomicUsize,
}

impl LocalFileTransfer {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            operations: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn local(&self, remote: &str) -> PathBuf {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.root.join(remote.trim_start_matches('/'))
    }
}

fn op_err(err: io::Error) -> Error {
    Error::ProtocolOperation(err.to_string())
}

fn attrs_of(metadata: &std::fs::Metadata) -> RemoteAttrs {
    use std::os::unix::fs::MetadataExt;
    RemoteAttrs {
        size: metadata.len(),
        mode: metadata.mode(),
        uid: metadata.uid(),
        gid: metadata.gid(),
    }
}

#[async_trait]
impl FileTransfer for LocalFileTransfer {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let dir = self.local(path);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(op_err)?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(op_err)? {
            let metadata = tokio::fs::symlink_metadata(entry.path())
                .await
                .map_err(op_err)?;
            out.push(RemoteEntry {
                filename: entry.file_name().to_string_lossy().into_owned(),
                longname: None,
                attrs: attrs_of(&metadata),
            });
        }
        out.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(out)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir(self.local(path)).await.map_err(op_err)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = self.local(from);
        let to = self.root.join(to.trim_start_matches('/'));
        tokio::fs::rename(from, to).await.map_err(op_err)
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(self.local(path), std::fs::Permissions::from_mode(mode))
            .await
            .map_err(op_err)
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        tokio::fs::remove_dir(self.local(path)).await.map_err(op_err)
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(self.local(path)).await.map_err(op_err)
    }

    async fn stat(&self, path: &str) -> Result<RemoteAttrs> {
        let metadata = tokio::fs::metadata(self.local(path)).await.map_err(op_err)?;
        Ok(attrs_of(&metadata))
    }

    async fn fetch(&self, remote: &str, local: &Path) -> Result<u64> {
        let mut source = tokio::fs::File::open(self.local(remote))
            .await
            .map_err(op_err)?;
        let mut target = tokio::fs::File::create(local).await?;
        Ok(tokio::io::copy(&mut source, &mut target).await?)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// -----------------------------------------------------------------------------
// Harness
// -----------------------------------------------------------------------------

/// A gateway wired to fakes, with a tempdir acting as the device file system.
pub struct Harness {
    pub adapter: Arc<GatewayAdapter>,
    pub connector: Arc<FakeConnector>,
    pub resolver: Arc<FakeResolver>,
    pub remote_root: TempDir,
    pub staging_root: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut GatewayConfig)) -> Self {
        let remote_root = tempfile::tempdir().expect("remote root");
        let staging_root = tempfile::tempdir().expect("staging root");

        let mut config = GatewayConfig {
            staging_dir: staging_root.path().to_path_buf(),
            ..GatewayConfig::default()
        };
        adjust(&mut config);

        let connector = Arc::new(FakeConnector::new(Some(remote_root.path().to_path_buf())));
        let resolver = Arc::new(FakeResolver::with(&[(
            "db.internal",
            Ipv4Addr::new(10, 0, 0, 9),
        )]));
        let directory = Arc::new(directory(&[(DEVICE, DEVICE_HOST), ("dev-2", "db.internal")]));
        let factory = Arc::new(
            ConnectionFactory::new(directory, Arc::clone(&connector) as Arc<dyn Connector>)
                .with_resolver(Arc::clone(&resolver) as Arc<dyn HostResolver>)
                .with_connect_timeout(config.ssh.connect_timeout()),
        );
        let adapter = Arc::new(GatewayAdapter::with_factory(&config, factory));

        Self {
            adapter,
            connector,
            resolver,
            remote_root,
            staging_root,
        }
    }

    pub fn remote_path(&self, relative: &str) -> PathBuf {
        self.remote_root.path().join(relative)
    }
}

// -----------------------------------------------------------------------------
// Client helpers
// -----------------------------------------------------------------------------

pub fn client() -> (ClientHandle, mpsc::Receiver<ServerEvent>) {
    ClientHandle::channel(None, 4096)
}

/// Returns every event queued so far.
pub fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Receives until `matches` accepts an event, returning everything seen.
pub async fn recv_until(
    rx: &mut mpsc::Receiver<ServerEvent>,
    matches: impl Fn(&ServerEvent) -> bool,
) -> Vec<ServerEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => {
                let done = matches(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            Ok(None) => panic!("client queue closed; seen: {seen:?}"),
            Err(_) => panic!("timed out waiting for event; seen: {seen:?}"),
        }
    }
}

/// Polls `condition` until it holds or the default timeout passes.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
