//! In-process test harness: scripted command runner, in-memory hypervisor
//! and a transport that routes peer requests straight into another
//! node's request handler.

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tempfile::TempDir;

use mcvirt_core::command::{command_line, CommandOutput, CommandRunner};
use mcvirt_core::tls::CA_CERT_FILE;
use mcvirt_core::transport::{PeerAddr, Transport};
use mcvirt_proto::auth::UserKind;
use mcvirt_proto::hard_drive::{
    drbd_base_volume_name, drbd_resource_name, local_volume_name, DiskDriver, DrbdDiskConfig,
    HardDriveConfig, HardDriveType,
};
use mcvirt_proto::node::PeerRecord;
use mcvirt_proto::storage::{NodeStorageConfig, StorageBackendConfig, StorageType};
use mcvirt_proto::{Envelope, McvError, McvResult, Request, Response};

use crate::auth;
use crate::context::CallContext;
use crate::daemon::{NodeState, Settings, Timings, VersionPolicy};
use crate::drbd::put_hard_drive;
use crate::libvirt::Hypervisor;
use crate::transaction::Function;

pub const TEST_VG: &str = "vg_test";
pub const TEST_BACKEND: &str = "sb-test";
const TEST_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

// ─── FakeRunner ─────────────────────────────────────────────────────────────

/// Command runner answering from a script of command-line prefixes.
/// Later scripts win over earlier ones; anything unscripted succeeds with
/// empty output.
pub struct FakeRunner {
    scripts: Mutex<Vec<(String, CommandOutput)>>,
    log: Mutex<Vec<String>>,
}

fn default_scripts() -> Vec<(String, CommandOutput)> {
    [
        ("drbdadm cstate", "Connected\n"),
        ("drbdadm role", "Primary/Secondary\n"),
        ("drbdadm dstate", "UpToDate/UpToDate\n"),
        ("blockdev --getsize64", "1073741824\n"),
        ("blockdev --getss", "512\n"),
        ("vgs --noheadings --units b", "  1099511627776\n"),
        ("df --output=avail", "Avail\n1099511627776\n"),
        ("lvs --noheadings -o lv_attr", "  -wi-a-----\n"),
        ("stat -c %s", "1073741824\n"),
        ("ss -Htln", ""),
        (
            "openssl req -new",
            "-----BEGIN CERTIFICATE REQUEST-----\nMIIB\n-----END CERTIFICATE REQUEST-----\n",
        ),
        ("openssl x509 -req", TEST_PEM),
    ]
    .into_iter()
    .map(|(prefix, stdout)| (prefix.to_string(), CommandOutput::ok(stdout)))
    .collect()
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(default_scripts()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.scripts.lock().unwrap().push((prefix.to_string(), output));
    }

    /// Every command line run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.count(needle) > 0
    }

    pub fn count(&self, needle: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[&str]) -> McvResult<CommandOutput> {
        let line = command_line(program, args);
        self.log.lock().unwrap().push(line.clone());
        let scripts = self.scripts.lock().unwrap();
        Ok(scripts
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

// ─── FakeHypervisor ─────────────────────────────────────────────────────────

/// Domains and networks kept in memory.
#[derive(Default)]
pub struct FakeHypervisor {
    /// Defined domains and whether they run.
    domains: Mutex<HashMap<String, bool>>,
    networks: Mutex<BTreeMap<String, String>>,
    migration_failure: Mutex<Option<String>>,
}

impl FakeHypervisor {
    /// Make every following live migration fail with `message`.
    pub fn fail_migration(&self, message: &str) {
        *self.migration_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.networks.lock().unwrap().contains_key(name)
    }

    fn not_defined(name: &str) -> McvError {
        McvError::LibvirtError(format!("domain {} is not defined", name))
    }

    fn set_running(&self, name: &str, running: bool) -> McvResult<()> {
        match self.domains.lock().unwrap().get_mut(name) {
            Some(state) => {
                *state = running;
                Ok(())
            }
            None => Err(Self::not_defined(name)),
        }
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn define(&self, name: &str, _xml: &str) -> McvResult<()> {
        self.domains.lock().unwrap().entry(name.to_string()).or_insert(false);
        Ok(())
    }

    async fn undefine(&self, name: &str) -> McvResult<()> {
        self.domains.lock().unwrap().remove(name);
        Ok(())
    }

    async fn is_defined(&self, name: &str) -> McvResult<bool> {
        Ok(self.domains.lock().unwrap().contains_key(name))
    }

    async fn is_running(&self, name: &str) -> McvResult<bool> {
        Ok(self.domains.lock().unwrap().get(name).copied().unwrap_or(false))
    }

    async fn start(&self, name: &str) -> McvResult<()> {
        if self.is_running(name).await? {
            return Err(McvError::LibvirtError(format!("domain {} is already active", name)));
        }
        self.set_running(name, true)
    }

    async fn destroy(&self, name: &str) -> McvResult<()> {
        self.set_running(name, false)
    }

    async fn shutdown(&self, name: &str) -> McvResult<()> {
        self.set_running(name, false)
    }

    async fn reset(&self, name: &str) -> McvResult<()> {
        if self.is_defined(name).await? {
            Ok(())
        } else {
            Err(Self::not_defined(name))
        }
    }

    async fn migrate(&self, name: &str, _dest: &str) -> McvResult<()> {
        if let Some(message) = self.migration_failure.lock().unwrap().clone() {
            return Err(McvError::LibvirtError(message));
        }
        match self.domains.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(Self::not_defined(name)),
        }
    }

    async fn define_network(&self, name: &str, interface: &str) -> McvResult<()> {
        self.networks.lock().unwrap().insert(name.to_string(), interface.to_string());
        Ok(())
    }

    async fn undefine_network(&self, name: &str) -> McvResult<()> {
        self.networks.lock().unwrap().remove(name);
        Ok(())
    }
}

// ─── InProcessTransport ─────────────────────────────────────────────────────

/// Routes peer requests to the request handler of a node in the same test.
#[derive(Default)]
pub struct InProcessTransport {
    nodes: Mutex<HashMap<String, Weak<NodeState>>>,
}

impl InProcessTransport {
    fn register(&self, node: &Arc<NodeState>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node.hostname.clone(), Arc::downgrade(node));
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn send_request(&self, peer: &PeerAddr, envelope: Envelope, req: Request) -> McvResult<Response> {
        let target = self
            .nodes
            .lock()
            .unwrap()
            .get(&peer.hostname)
            .and_then(Weak::upgrade)
            .ok_or_else(|| McvError::CouldNotConnect(peer.to_string()))?;
        Ok(crate::request::handle_request(&target, envelope, req).await)
    }

    async fn shutdown(&self) -> McvResult<()> {
        Ok(())
    }
}

// ─── Nodes and clusters ─────────────────────────────────────────────────────

pub struct TestNode {
    state: Arc<NodeState>,
    pub runner: Arc<FakeRunner>,
    hypervisor: Arc<FakeHypervisor>,
    _dir: TempDir,
}

impl TestNode {
    pub fn hypervisor_fake(&self) -> &FakeHypervisor {
        &self.hypervisor
    }
}

impl Deref for TestNode {
    type Target = NodeState;

    fn deref(&self) -> &NodeState {
        &self.state
    }
}

pub struct TestCluster {
    nodes: Vec<TestNode>,
}

impl TestCluster {
    pub fn node(&self, name: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.hostname == name)
            .unwrap_or_else(|| panic!("no test node {}", name))
    }
}

async fn build_node(name: &str, ip: &str, transport: Arc<InProcessTransport>) -> TestNode {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");
    let drbd_config_dir = dir.path().join("drbd.d");
    std::fs::create_dir_all(data_dir.join("ssl")).unwrap();
    std::fs::create_dir_all(&drbd_config_dir).unwrap();
    std::fs::write(data_dir.join("ssl").join(CA_CERT_FILE), TEST_PEM).unwrap();

    let settings = Settings {
        data_dir,
        drbd_config_dir,
        port: 8070,
        version: "10.0.0".into(),
        version_policy: VersionPolicy::Exact,
        timings: Timings::instant(),
    };
    let runner = Arc::new(FakeRunner::new());
    let hypervisor = Arc::new(FakeHypervisor::default());
    let state = NodeState::new(
        name.to_string(),
        settings,
        runner.clone(),
        hypervisor.clone(),
        transport.clone(),
    )
    .await
    .unwrap();
    let state = Arc::new(state);
    transport.register(&state);

    auth::ensure_admin(&state, Some("admin-pw")).await.unwrap();
    state
        .config
        .global
        .update("test", "cluster ip", |cfg| {
            cfg.cluster.cluster_ip = Some(ip.to_string());
            Ok(())
        })
        .await
        .unwrap();

    TestNode {
        state,
        runner,
        hypervisor,
        _dir: dir,
    }
}

/// Nodes sharing a transport with cluster IPs 10.0.0.1.. but no membership.
pub async fn unjoined(names: &[&str]) -> TestCluster {
    let transport = Arc::new(InProcessTransport::default());
    let mut nodes = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        nodes.push(build_node(name, &format!("10.0.0.{}", i + 1), transport.clone()).await);
    }
    TestCluster { nodes }
}

/// A fully meshed cluster: every node holds cluster-user credentials for
/// every other.
pub async fn cluster(names: &[&str]) -> TestCluster {
    let c = unjoined(names).await;
    for a in &c.nodes {
        for b in &c.nodes {
            if a.hostname == b.hostname {
                continue;
            }
            let (username, password) = auth::create_machine_user(b, UserKind::ClusterUser, Some(&a.hostname))
                .await
                .unwrap();
            let record = PeerRecord {
                ip_address: b.cluster_ip().await.unwrap(),
                username,
                password,
            };
            a.config
                .global
                .update("test", "join", |cfg| {
                    cfg.cluster.nodes.insert(b.hostname.clone(), record);
                    Ok(())
                })
                .await
                .unwrap();
        }
    }
    c
}

pub async fn single_node(name: &str) -> TestNode {
    let mut c = unjoined(&[name]).await;
    c.nodes.remove(0)
}

fn test_backend(members: &[&TestNode]) -> StorageBackendConfig {
    StorageBackendConfig {
        id: TEST_BACKEND.into(),
        name: "default".into(),
        storage_type: StorageType::Lvm,
        shared: false,
        location: Some(TEST_VG.into()),
        nodes: members
            .iter()
            .map(|n| (n.hostname.clone(), NodeStorageConfig::default()))
            .collect(),
    }
}

async fn install_backend(nodes: &[&TestNode]) {
    let sb = test_backend(nodes);
    for node in nodes {
        node.config
            .storage
            .put("test", "backend", &sb.id, Some(sb.clone()))
            .await
            .unwrap();
        node.config
            .global
            .update("test", "backend", |cfg| {
                cfg.storage_backends.push(sb.id.clone());
                Ok(())
            })
            .await
            .unwrap();
    }
}

/// One node with an LVM backend named "default" on [`TEST_VG`].
pub async fn single_node_with_backend(name: &str) -> TestNode {
    let node = single_node(name).await;
    install_backend(&[&node]).await;
    node
}

/// A cluster with DRBD enabled and the test backend on every node.
pub async fn drbd_cluster(names: &[&str]) -> TestCluster {
    let c = cluster(names).await;
    for node in &c.nodes {
        node.config
            .global
            .update("test", "enable drbd", |cfg| {
                cfg.drbd.enabled = true;
                cfg.drbd.secret = Some("test-secret".into());
                Ok(())
            })
            .await
            .unwrap();
    }
    let members: Vec<&TestNode> = c.nodes.iter().collect();
    install_backend(&members).await;
    c
}

/// Config of a local disk; nothing is stored.
pub fn local_hard_drive(backend: &str, vm: &str, disk_number: u32, nodes: &[&str]) -> HardDriveConfig {
    HardDriveConfig {
        id: format!("hd-{}-{}", vm, disk_number),
        disk_type: HardDriveType::Local,
        driver: DiskDriver::Virtio,
        storage_backend: backend.to_string(),
        base_volume_name: local_volume_name(vm, disk_number),
        nodes: nodes.iter().map(|n| n.to_string()).collect(),
        vm: Some(vm.to_string()),
        disk_number,
        drbd: None,
    }
}

/// Publish disk 1 of VM "vm1", replicated between n1 and n2, to every node.
pub async fn drbd_hard_drive(node: &NodeState) -> HardDriveConfig {
    let hdd = HardDriveConfig {
        id: "hd-vm1-1".into(),
        disk_type: HardDriveType::Drbd,
        driver: DiskDriver::Virtio,
        storage_backend: TEST_BACKEND.into(),
        base_volume_name: drbd_base_volume_name("vm1", 1),
        nodes: vec!["n1".into(), "n2".into()],
        vm: Some("vm1".into()),
        disk_number: 1,
        drbd: Some(DrbdDiskConfig {
            resource_name: drbd_resource_name("vm1", 1),
            minor: 1,
            port: 7789,
            sync_state: true,
        }),
    };
    Function::new(put_hard_drive(&hdd))
        .on(node.all_nodes().await)
        .run_all(node, &CallContext::internal())
        .await
        .unwrap();
    hdd
}
