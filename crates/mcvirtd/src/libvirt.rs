//! libvirt adapter.
//!
//! The daemon drives the local hypervisor only through [`Hypervisor`].
//! Production uses `virsh` via the shell-out runner; domain and network
//! definitions are rendered here with `quick-xml`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tokio::fs;
use tracing::{debug, info};

use mcvirt_core::command::CommandRunner;
use mcvirt_proto::vm::{ModificationFlag, NetworkAdapter, VmConfig};
use mcvirt_proto::{McvError, McvResult};

#[async_trait]
pub trait Hypervisor: Send + Sync + 'static {
    async fn define(&self, name: &str, xml: &str) -> McvResult<()>;
    /// Remove a domain definition; a missing domain is not an error.
    async fn undefine(&self, name: &str) -> McvResult<()>;
    async fn is_defined(&self, name: &str) -> McvResult<bool>;
    async fn is_running(&self, name: &str) -> McvResult<bool>;
    async fn start(&self, name: &str) -> McvResult<()>;
    async fn destroy(&self, name: &str) -> McvResult<()>;
    async fn shutdown(&self, name: &str) -> McvResult<()>;
    async fn reset(&self, name: &str) -> McvResult<()>;
    /// Live-migrate a running domain to `dest`, persisting it there and
    /// undefining it here.
    async fn migrate(&self, name: &str, dest: &str) -> McvResult<()>;
    async fn define_network(&self, name: &str, interface: &str) -> McvResult<()>;
    async fn undefine_network(&self, name: &str) -> McvResult<()>;
}

// ─── Domain XML ─────────────────────────────────────────────────────────────

/// One disk as presented to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDevice {
    /// `block` or `file`.
    pub device_type: &'static str,
    /// `dev` or `file`.
    pub source_param: &'static str,
    pub path: String,
    pub target: String,
    pub bus: &'static str,
}

fn xml_error(e: impl std::fmt::Display) -> McvError {
    McvError::LibvirtError(format!("XML: {}", e))
}

struct XmlBuilder {
    writer: Writer<Vec<u8>>,
}

impl XmlBuilder {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn start(name: &str, attrs: &[(&str, &str)]) -> BytesStart<'static> {
        let mut elem = BytesStart::new(name.to_string());
        for attr in attrs {
            elem.push_attribute(*attr);
        }
        elem
    }

    fn open(&mut self, name: &str, attrs: &[(&str, &str)]) -> McvResult<()> {
        self.writer
            .write_event(Event::Start(Self::start(name, attrs)))
            .map_err(xml_error)
    }

    fn close(&mut self, name: &str) -> McvResult<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name.to_string())))
            .map_err(xml_error)
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> McvResult<()> {
        self.writer
            .write_event(Event::Empty(Self::start(name, attrs)))
            .map_err(xml_error)
    }

    fn text(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) -> McvResult<()> {
        self.open(name, attrs)?;
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(xml_error)?;
        self.close(name)
    }

    fn finish(self) -> McvResult<String> {
        String::from_utf8(self.writer.into_inner()).map_err(xml_error)
    }
}

/// Render the libvirt domain of a VM.
pub fn domain_xml(
    vm: &VmConfig,
    uuid: &str,
    disks: &[DiskDevice],
    iso: Option<&str>,
) -> McvResult<String> {
    let windows = vm.modifications.contains(&ModificationFlag::Windows);
    let memory_kib = (vm.memory / 1024).to_string();
    let cores = vm.cpu_cores.to_string();

    let mut x = XmlBuilder::new();
    x.open("domain", &[("type", "kvm")])?;
    x.text("name", &[], &vm.name)?;
    x.text("uuid", &[], uuid)?;
    x.text("memory", &[("unit", "KiB")], &memory_kib)?;
    x.text("currentMemory", &[("unit", "KiB")], &memory_kib)?;
    x.text("vcpu", &[], &cores)?;

    x.open("os", &[])?;
    x.text("type", &[("arch", "x86_64")], "hvm")?;
    if iso.is_some() {
        x.empty("boot", &[("dev", "cdrom")])?;
    }
    x.empty("boot", &[("dev", "hd")])?;
    x.close("os")?;

    x.open("features", &[])?;
    x.empty("acpi", &[])?;
    x.empty("apic", &[])?;
    if windows {
        x.open("hyperv", &[])?;
        x.empty("relaxed", &[("state", "on")])?;
        x.empty("vapic", &[("state", "on")])?;
        x.empty("spinlocks", &[("state", "on"), ("retries", "8191")])?;
        x.close("hyperv")?;
    }
    x.close("features")?;
    x.empty("clock", &[("offset", if windows { "localtime" } else { "utc" })])?;

    x.open("devices", &[])?;
    for disk in disks {
        x.open("disk", &[("type", disk.device_type), ("device", "disk")])?;
        x.empty("driver", &[("name", "qemu"), ("type", "raw"), ("cache", "none")])?;
        x.empty("source", &[(disk.source_param, disk.path.as_str())])?;
        x.empty("target", &[("dev", disk.target.as_str()), ("bus", disk.bus)])?;
        x.close("disk")?;
    }
    if let Some(iso) = iso {
        x.open("disk", &[("type", "file"), ("device", "cdrom")])?;
        x.empty("driver", &[("name", "qemu"), ("type", "raw")])?;
        x.empty("source", &[("file", iso)])?;
        x.empty("target", &[("dev", "hdc"), ("bus", "ide")])?;
        x.empty("readonly", &[])?;
        x.close("disk")?;
    }
    for NetworkAdapter { mac_address, network } in &vm.network_adapters {
        x.open("interface", &[("type", "network")])?;
        x.empty("mac", &[("address", mac_address.as_str())])?;
        x.empty("source", &[("network", network.as_str())])?;
        x.empty("model", &[("type", "virtio")])?;
        x.close("interface")?;
    }
    x.empty("graphics", &[("type", "vnc"), ("autoport", "yes"), ("listen", "127.0.0.1")])?;
    x.open("video", &[])?;
    x.empty("model", &[("type", vm.graphics_driver.model())])?;
    x.close("video")?;
    x.empty("input", &[("type", "tablet"), ("bus", "usb")])?;
    x.close("devices")?;
    x.close("domain")?;
    x.finish()
}

/// Render a bridged libvirt network.
pub fn network_xml(name: &str, interface: &str) -> McvResult<String> {
    let mut x = XmlBuilder::new();
    x.open("network", &[])?;
    x.text("name", &[], name)?;
    x.empty("forward", &[("mode", "bridge")])?;
    x.empty("bridge", &[("name", interface)])?;
    x.close("network")?;
    x.finish()
}

// ─── virsh ──────────────────────────────────────────────────────────────────

/// Drives the local libvirtd through `virsh`.
pub struct VirshHypervisor {
    runner: Arc<dyn CommandRunner>,
    /// Where rendered definitions are written before `virsh define`.
    xml_dir: PathBuf,
}

impl VirshHypervisor {
    pub fn new(runner: Arc<dyn CommandRunner>, xml_dir: PathBuf) -> Self {
        Self { runner, xml_dir }
    }

    async fn virsh(&self, args: &[&str]) -> McvResult<String> {
        let output = self.runner.run("virsh", args).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(McvError::LibvirtError(format!(
                "virsh {}: {}",
                args.join(" "),
                output.stderr.trim()
            )))
        }
    }

    async fn write_definition(&self, file: &str, xml: &str) -> McvResult<PathBuf> {
        fs::create_dir_all(&self.xml_dir).await?;
        let path = self.xml_dir.join(file);
        fs::write(&path, xml).await?;
        Ok(path)
    }
}

fn is_not_found(e: &McvError) -> bool {
    matches!(e, McvError::LibvirtError(msg)
        if msg.contains("failed to get domain") || msg.contains("failed to get network")
            || msg.contains("not found"))
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn define(&self, name: &str, xml: &str) -> McvResult<()> {
        let path = self.write_definition(&format!("{}.xml", name), xml).await?;
        let path = path.to_string_lossy();
        self.virsh(&["define", &path]).await?;
        info!("defined domain {}", name);
        Ok(())
    }

    async fn undefine(&self, name: &str) -> McvResult<()> {
        match self.virsh(&["undefine", name]).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!("domain {} was not defined", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn is_defined(&self, name: &str) -> McvResult<bool> {
        match self.virsh(&["domstate", name]).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_running(&self, name: &str) -> McvResult<bool> {
        match self.virsh(&["domstate", name]).await {
            Ok(state) => Ok(state.trim() == "running"),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn start(&self, name: &str) -> McvResult<()> {
        self.virsh(&["start", name]).await.map(|_| ())
    }

    async fn destroy(&self, name: &str) -> McvResult<()> {
        self.virsh(&["destroy", name]).await.map(|_| ())
    }

    async fn shutdown(&self, name: &str) -> McvResult<()> {
        self.virsh(&["shutdown", name]).await.map(|_| ())
    }

    async fn reset(&self, name: &str) -> McvResult<()> {
        self.virsh(&["reset", name]).await.map(|_| ())
    }

    async fn migrate(&self, name: &str, dest: &str) -> McvResult<()> {
        let uri = format!("qemu+tls://{}/system", dest);
        self.virsh(&[
            "migrate",
            "--live",
            "--persistent",
            "--undefinesource",
            "--abort-on-error",
            name,
            &uri,
        ])
        .await?;
        info!("migrated domain {} to {}", name, dest);
        Ok(())
    }

    async fn define_network(&self, name: &str, interface: &str) -> McvResult<()> {
        let xml = network_xml(name, interface)?;
        let path = self.write_definition(&format!("network-{}.xml", name), &xml).await?;
        let path = path.to_string_lossy();
        self.virsh(&["net-define", &path]).await?;
        self.virsh(&["net-autostart", name]).await?;
        self.virsh(&["net-start", name]).await?;
        Ok(())
    }

    async fn undefine_network(&self, name: &str) -> McvResult<()> {
        if let Err(e) = self.virsh(&["net-destroy", name]).await {
            debug!("net-destroy {}: {}", name, e);
        }
        match self.virsh(&["net-undefine", name]).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeRunner;
    use mcvirt_core::command::CommandOutput;

    fn vm() -> VmConfig {
        let mut vm = VmConfig::new("vm-0".into(), "vm1".into(), 2, 2048 * 1024 * 1024);
        vm.network_adapters.push(NetworkAdapter {
            mac_address: "52:54:00:aa:bb:cc".into(),
            network: "Production".into(),
        });
        vm
    }

    fn drbd_disk() -> DiskDevice {
        DiskDevice {
            device_type: "block",
            source_param: "dev",
            path: "/dev/drbd1".into(),
            target: "vda".into(),
            bus: "virtio",
        }
    }

    #[test]
    fn test_domain_xml() {
        let xml = domain_xml(&vm(), "uuid-1", &[drbd_disk()], None).unwrap();
        assert!(xml.contains("<name>vm1</name>"));
        assert!(xml.contains(r#"<memory unit="KiB">2097152</memory>"#));
        assert!(xml.contains(r#"<source dev="/dev/drbd1"/>"#));
        assert!(xml.contains(r#"<target dev="vda" bus="virtio"/>"#));
        assert!(xml.contains(r#"<source network="Production"/>"#));
        assert!(!xml.contains("cdrom"));
        assert!(!xml.contains("hyperv"));
    }

    #[test]
    fn test_domain_xml_iso_boots_first() {
        let mut vm = vm();
        vm.modifications.insert(ModificationFlag::Windows);
        let xml = domain_xml(&vm, "uuid-1", &[], Some("/isos/install.iso")).unwrap();
        let cdrom = xml.find(r#"<boot dev="cdrom"/>"#).unwrap();
        let hd = xml.find(r#"<boot dev="hd"/>"#).unwrap();
        assert!(cdrom < hd);
        assert!(xml.contains("hyperv"));
        assert!(xml.contains(r#"offset="localtime""#));
    }

    #[tokio::test]
    async fn test_virsh_undefine_tolerates_missing_domain() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            "virsh undefine",
            CommandOutput::failed(1, "error: failed to get domain 'vm1'"),
        );
        let dir = tempfile::tempdir().unwrap();
        let hv = VirshHypervisor::new(runner.clone(), dir.path().to_path_buf());
        hv.undefine("vm1").await.unwrap();
        assert_eq!(runner.commands(), vec!["virsh undefine vm1"]);
    }

    #[tokio::test]
    async fn test_virsh_migrate_flags() {
        let runner = Arc::new(FakeRunner::new());
        let dir = tempfile::tempdir().unwrap();
        let hv = VirshHypervisor::new(runner.clone(), dir.path().to_path_buf());
        hv.migrate("vm1", "n2").await.unwrap();
        assert_eq!(
            runner.commands(),
            vec!["virsh migrate --live --persistent --undefinesource --abort-on-error vm1 qemu+tls://n2/system"]
        );
    }
}
