//! QEMU virtual machine substrate.
//!
//! Each VM lives in `<vm_root>/<name>/` with a qcow2 overlay on top of the
//! cached cloud image, a cloud-init NoCloud seed ISO and the QMP socket of
//! the running QEMU process. Guest port 22 is forwarded from a host port
//! chosen at provisioning time through user-mode networking. The driver
//! keeps that port bound while QEMU is not running.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{BootConfig, Driver, Endpoint, Provisioned, SubstrateState};
use crate::error::{DriverError, DriverResult};
use crate::image::ImageRef;
use crate::spec::{BackendKind, ResourceSpec};

const LOGIN_USER: &str = "rent";
const PORT_ATTEMPTS: usize = 16;

/// External binaries the driver shells out to.
#[derive(Debug, Clone)]
pub struct VmTools {
    pub qemu: String,
    pub qemu_img: String,
    pub genisoimage: String,
}

impl Default for VmTools {
    fn default() -> Self {
        Self {
            qemu: "qemu-system-x86_64".to_string(),
            qemu_img: "qemu-img".to_string(),
            genisoimage: "genisoimage".to_string(),
        }
    }
}

struct Machine {
    cpu_cores: u32,
    memory_gb: u32,
    ssh_port: u16,
    /// Holds `ssh_port` while QEMU is not listening on it.
    port_hold: Option<TcpListener>,
    started: bool,
    child: Option<Child>,
}

pub struct VmDriver {
    root: PathBuf,
    tools: VmTools,
    public_host: String,
    stop_timeout: Duration,
    machines: RwLock<HashMap<String, Machine>>,
}

impl VmDriver {
    pub fn new(root: PathBuf, tools: VmTools, public_host: String, stop_timeout: Duration) -> Self {
        Self {
            root,
            tools,
            public_host,
            stop_timeout,
            machines: RwLock::new(HashMap::new()),
        }
    }

    fn vm_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn disk(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("disk.qcow2")
    }

    fn seed_iso(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("cidata.iso")
    }

    fn qmp_socket(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("qmp.sock")
    }

    fn endpoint(&self, port: u16) -> Endpoint {
        Endpoint {
            host: self.public_host.clone(),
            port,
            user: LOGIN_USER.to_string(),
        }
    }

    /// Record `name` with a freshly reserved SSH port.
    async fn register(&self, name: &str, spec: &ResourceSpec) -> DriverResult<u16> {
        let mut machines = self.machines.write().await;
        if machines.contains_key(name) {
            return Err(DriverError::AlreadyExists(name.to_string()));
        }

        let taken: HashSet<u16> = machines.values().map(|m| m.ssh_port).collect();
        let hold = reserve_port(&taken)?;
        let ssh_port = hold.local_addr()?.port();

        machines.insert(
            name.to_string(),
            Machine {
                cpu_cores: spec.cpu_cores,
                memory_gb: spec.memory_gb,
                ssh_port,
                port_hold: Some(hold),
                started: false,
                child: None,
            },
        );
        Ok(ssh_port)
    }

    /// Bind the SSH port again once QEMU has let go of it.
    async fn hold_port(&self, name: &str) {
        let mut machines = self.machines.write().await;
        let Some(machine) = machines.get_mut(name) else {
            return;
        };
        if machine.port_hold.is_some() {
            return;
        }
        match TcpListener::bind(("0.0.0.0", machine.ssh_port)) {
            Ok(listener) => machine.port_hold = Some(listener),
            Err(e) => {
                warn!(vm = %name, port = machine.ssh_port, error = %e, "Could not hold SSH port")
            }
        }
    }

    async fn create_overlay(&self, name: &str, base: &Path, size_gb: u32) -> DriverResult<()> {
        let disk = self.disk(name);
        run(
            &self.tools.qemu_img,
            [
                OsStr::new("create"),
                OsStr::new("-f"),
                OsStr::new("qcow2"),
                OsStr::new("-F"),
                OsStr::new("qcow2"),
                OsStr::new("-b"),
                base.as_os_str(),
                disk.as_os_str(),
                OsStr::new(&format!("{}G", size_gb)),
            ],
        )
        .await?;
        debug!(vm = %name, disk = %disk.display(), "Created overlay disk");
        Ok(())
    }

    async fn create_cloudinit_iso(&self, name: &str, boot: &BootConfig) -> DriverResult<()> {
        let vm_dir = self.vm_dir(name);

        let user_data_path = vm_dir.join("user-data");
        tokio::fs::write(&user_data_path, user_data(&boot.authorized_key)).await?;

        let meta_data_path = vm_dir.join("meta-data");
        let meta_data = format!(
            "instance-id: {}\nlocal-hostname: {}\n",
            name, boot.hostname
        );
        tokio::fs::write(&meta_data_path, meta_data).await?;

        let iso_path = self.seed_iso(name);
        run(
            &self.tools.genisoimage,
            [
                OsStr::new("-output"),
                iso_path.as_os_str(),
                OsStr::new("-volid"),
                OsStr::new("cidata"),
                OsStr::new("-joliet"),
                OsStr::new("-rock"),
                user_data_path.as_os_str(),
                meta_data_path.as_os_str(),
            ],
        )
        .await?;

        info!(vm = %name, iso = %iso_path.display(), "Created cloud-init ISO");
        Ok(())
    }

    fn qemu_command(&self, name: &str, machine: &Machine) -> Command {
        let vm_dir = self.vm_dir(name);
        let mut cmd = Command::new(&self.tools.qemu);

        cmd.arg("-name").arg(name);
        cmd.args(["-machine", "q35,accel=kvm:tcg", "-cpu", "max"]);
        cmd.arg("-smp").arg(machine.cpu_cores.to_string());
        cmd.arg("-m").arg(format!("{}G", machine.memory_gb));
        cmd.arg("-drive").arg(format!(
            "file={},if=virtio,format=qcow2",
            self.disk(name).display()
        ));
        cmd.arg("-drive").arg(format!(
            "file={},if=virtio,media=cdrom,readonly=on",
            self.seed_iso(name).display()
        ));
        cmd.arg("-netdev").arg(format!(
            "user,id=net0,hostfwd=tcp::{}-:22",
            machine.ssh_port
        ));
        cmd.args(["-device", "virtio-net-pci,netdev=net0"]);
        cmd.arg("-qmp").arg(format!(
            "unix:{},server=on,wait=off",
            self.qmp_socket(name).display()
        ));
        cmd.args(["-display", "none"]);
        cmd.arg("-serial")
            .arg(format!("file:{}", vm_dir.join("serial.log").display()));
        cmd.kill_on_drop(true);
        cmd
    }

    async fn is_running(&self, name: &str) -> bool {
        let mut machines = self.machines.write().await;
        let Some(machine) = machines.get_mut(name) else {
            return false;
        };
        match machine.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                info!(vm = %name, status = ?status, "QEMU process exited");
                machine.child = None;
                false
            }
            Some(Err(e)) => {
                error!(vm = %name, error = %e, "Failed to check process status");
                false
            }
            None => false,
        }
    }

    async fn send_powerdown(&self, socket: &Path) -> anyhow::Result<()> {
        let stream = UnixStream::connect(socket)
            .await
            .context("Failed to connect to QMP socket")?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        // Greeting
        lines.next_line().await?;

        for command in ["qmp_capabilities", "system_powerdown"] {
            let mut request = json!({ "execute": command }).to_string();
            request.push('\n');
            write.write_all(request.as_bytes()).await?;

            let reply = lines
                .next_line()
                .await?
                .ok_or_else(|| anyhow!("QMP connection closed"))?;
            let reply: serde_json::Value = serde_json::from_str(&reply)?;
            if let Some(err) = reply.get("error") {
                return Err(anyhow!("QMP {} failed: {}", command, err));
            }
        }
        Ok(())
    }

    async fn kill(&self, name: &str) {
        let child = {
            let mut machines = self.machines.write().await;
            machines.get_mut(name).and_then(|m| m.child.take())
        };
        if let Some(mut child) = child {
            info!(vm = %name, "Killing QEMU process");
            if let Err(e) = child.kill().await {
                warn!(vm = %name, error = %e, "Failed to kill QEMU process");
            }
        }
    }
}

/// Run a helper binary to completion, capturing stderr on failure.
async fn run<I, S>(bin: &str, args: I) -> DriverResult<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(DriverError::Command {
            command: bin.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn user_data(authorized_key: &str) -> String {
    format!(
        "#cloud-config\n\
         users:\n  \
         - name: {user}\n    \
         sudo: ALL=(ALL) NOPASSWD:ALL\n    \
         shell: /bin/bash\n    \
         ssh_authorized_keys:\n      \
         - {key}\n\
         ssh_pwauth: false\n",
        user = LOGIN_USER,
        key = authorized_key.trim()
    )
}

/// Bind a free host port for the guest's sshd forward, skipping ports
/// already promised to other machines.
fn reserve_port(taken: &HashSet<u16>) -> std::io::Result<TcpListener> {
    for _ in 0..PORT_ATTEMPTS {
        let listener = TcpListener::bind(("0.0.0.0", 0))?;
        if !taken.contains(&listener.local_addr()?.port()) {
            return Ok(listener);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        "no free host port for SSH forwarding",
    ))
}

/// Hand the SSH port over to QEMU. Without a held listener the port is
/// probed first, so a port taken in the meantime fails the start cleanly.
fn release_port(hold: Option<TcpListener>, port: u16) -> DriverResult<()> {
    match hold {
        Some(listener) => drop(listener),
        None => drop(TcpListener::bind(("0.0.0.0", port)).map_err(|e| {
            DriverError::Other(format!("SSH port {} is no longer available: {}", port, e))
        })?),
    }
    Ok(())
}

fn is_process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[async_trait]
impl Driver for VmDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Vm
    }

    async fn provision(
        &self,
        name: &str,
        spec: &ResourceSpec,
        image: &ImageRef,
        boot: &BootConfig,
    ) -> DriverResult<Provisioned> {
        let base = image
            .path()
            .ok_or_else(|| DriverError::Other("virtual machine needs a disk image".into()))?;

        let vm_dir = self.vm_dir(name);
        if self.machines.read().await.contains_key(name)
            || tokio::fs::try_exists(&vm_dir).await.unwrap_or(false)
        {
            return Err(DriverError::AlreadyExists(name.to_string()));
        }

        tokio::fs::create_dir_all(&vm_dir).await?;

        let prepared = async {
            self.create_overlay(name, base, spec.storage_gb).await?;
            self.create_cloudinit_iso(name, boot).await?;
            self.register(name, spec).await
        }
        .await;

        let ssh_port = match prepared {
            Ok(port) => port,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&vm_dir).await;
                return Err(e);
            }
        };

        info!(vm = %name, ssh_port = ssh_port, "VM provisioned");
        Ok(Provisioned {
            substrate_id: name.to_string(),
            endpoint: Some(self.endpoint(ssh_port)),
        })
    }

    async fn start(&self, substrate_id: &str) -> DriverResult<Endpoint> {
        if self.is_running(substrate_id).await {
            let machines = self.machines.read().await;
            if let Some(m) = machines.get(substrate_id) {
                return Ok(self.endpoint(m.ssh_port));
            }
        }

        let vm_dir = self.vm_dir(substrate_id);
        let stderr_path = vm_dir.join("qemu.stderr");

        let (mut cmd, ssh_port) = {
            let mut machines = self.machines.write().await;
            let machine = machines
                .get_mut(substrate_id)
                .ok_or_else(|| DriverError::NotFound(substrate_id.to_string()))?;

            let mut cmd = self.qemu_command(substrate_id, machine);
            cmd.stdout(std::fs::File::create(vm_dir.join("qemu.stdout"))?);
            cmd.stderr(std::fs::File::create(&stderr_path)?);
            cmd.stdin(Stdio::null());

            release_port(machine.port_hold.take(), machine.ssh_port)?;
            (cmd, machine.ssh_port)
        };

        info!(vm = %substrate_id, cmd = ?cmd.as_std(), "Spawning QEMU");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.hold_port(substrate_id).await;
                return Err(e.into());
            }
        };
        let pid = child.id().unwrap_or_default();
        info!(vm = %substrate_id, pid = pid, "QEMU started");

        // Wait briefly to check for immediate failure
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(Some(status)) = child.try_wait() {
            let stderr = tokio::fs::read_to_string(&stderr_path)
                .await
                .unwrap_or_default();
            error!(
                vm = %substrate_id,
                status = ?status,
                stderr = %stderr,
                "QEMU exited immediately"
            );
            self.hold_port(substrate_id).await;
            return Err(DriverError::Command {
                command: self.tools.qemu.clone(),
                stderr,
            });
        }

        let mut machines = self.machines.write().await;
        let machine = machines
            .get_mut(substrate_id)
            .ok_or_else(|| DriverError::NotFound(substrate_id.to_string()))?;
        machine.child = Some(child);
        machine.started = true;

        Ok(self.endpoint(ssh_port))
    }

    async fn stop(&self, substrate_id: &str) -> DriverResult<()> {
        if !self.machines.read().await.contains_key(substrate_id) {
            return Err(DriverError::NotFound(substrate_id.to_string()));
        }
        if !self.is_running(substrate_id).await {
            return Ok(());
        }

        info!(vm = %substrate_id, "Sending powerdown request");
        if let Err(e) = self.send_powerdown(&self.qmp_socket(substrate_id)).await {
            warn!(vm = %substrate_id, error = %e, "Powerdown request failed, sending SIGTERM");
            let pid = self
                .machines
                .read()
                .await
                .get(substrate_id)
                .and_then(|m| m.child.as_ref())
                .and_then(|c| c.id());
            if let Some(pid) = pid.filter(|p| is_process_alive(*p)) {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
        }

        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        loop {
            if !self.is_running(substrate_id).await {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(vm = %substrate_id, "Timeout waiting for graceful shutdown, killing");
                self.kill(substrate_id).await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.hold_port(substrate_id).await;
        info!(vm = %substrate_id, "VM stopped");
        Ok(())
    }

    async fn delete(&self, substrate_id: &str) -> DriverResult<()> {
        self.kill(substrate_id).await;
        self.machines.write().await.remove(substrate_id);

        let vm_dir = self.vm_dir(substrate_id);
        if tokio::fs::try_exists(&vm_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&vm_dir).await?;
        }
        info!(vm = %substrate_id, "VM deleted");
        Ok(())
    }

    async fn inspect(&self, substrate_id: &str) -> DriverResult<SubstrateState> {
        if self.is_running(substrate_id).await {
            return Ok(SubstrateState::Running);
        }
        let on_disk = tokio::fs::try_exists(self.vm_dir(substrate_id))
            .await
            .unwrap_or(false);
        let machines = self.machines.read().await;
        Ok(match machines.get(substrate_id) {
            Some(m) if on_disk && m.started => SubstrateState::Stopped,
            Some(_) if on_disk => SubstrateState::Created,
            _ => SubstrateState::Missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_data_authorizes_key() {
        let data = user_data("ssh-ed25519 AAAAC3Nz rentd\n");
        assert!(data.starts_with("#cloud-config\n"));
        assert!(data.contains("  - name: rent\n"));
        assert!(data.contains("      - ssh-ed25519 AAAAC3Nz rentd\n"));
        assert!(data.contains("ssh_pwauth: false"));
    }

    fn driver(root: &Path) -> VmDriver {
        VmDriver::new(
            root.to_path_buf(),
            VmTools::default(),
            "127.0.0.1".to_string(),
            Duration::from_secs(1),
        )
    }

    fn spec() -> ResourceSpec {
        ResourceSpec {
            backend: BackendKind::Vm,
            cpu_cores: 1,
            memory_gb: 1,
            storage_gb: 10,
            os_template: crate::spec::OsTemplate::Ubuntu,
            location: String::new(),
            lease_minutes: 1,
        }
    }

    #[test]
    fn test_reserve_port_skips_taken() {
        let first = reserve_port(&HashSet::new()).unwrap();
        let port = first.local_addr().unwrap().port();
        assert_ne!(port, 0);
        drop(first);

        let second = reserve_port(&HashSet::from([port])).unwrap();
        assert_ne!(second.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_registered_machines_hold_distinct_ports() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver(tmp.path());

        let a = driver.register("vm-a", &spec()).await.unwrap();
        let b = driver.register("vm-b", &spec()).await.unwrap();
        assert_ne!(a, b);

        // Nobody else can take the ports before QEMU starts.
        assert!(TcpListener::bind(("0.0.0.0", a)).is_err());
        assert!(TcpListener::bind(("0.0.0.0", b)).is_err());

        assert!(matches!(
            driver.register("vm-a", &spec()).await,
            Err(DriverError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_port_is_held_again_after_release() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver(tmp.path());
        let port = driver.register("vm-a", &spec()).await.unwrap();

        let hold = driver
            .machines
            .write()
            .await
            .get_mut("vm-a")
            .unwrap()
            .port_hold
            .take();
        release_port(hold, port).unwrap();
        assert!(TcpListener::bind(("0.0.0.0", port)).is_ok());

        driver.hold_port("vm-a").await;
        assert!(TcpListener::bind(("0.0.0.0", port)).is_err());
    }

    #[test]
    fn test_release_fails_when_port_was_taken() {
        let squatter = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = squatter.local_addr().unwrap().port();
        assert!(matches!(
            release_port(None, port),
            Err(DriverError::Other(_))
        ));

        drop(squatter);
        assert!(release_port(None, port).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_vm_is_missing_and_deletable() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver(tmp.path());

        assert_eq!(
            driver.inspect("vm-nope").await.unwrap(),
            SubstrateState::Missing
        );
        assert!(driver.delete("vm-nope").await.is_ok());
        assert!(matches!(
            driver.start("vm-nope").await,
            Err(DriverError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_provision_requires_disk_image() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver(tmp.path());
        let boot = BootConfig {
            authorized_key: "ssh-ed25519 AAAA".to_string(),
            hostname: "vm-x".to_string(),
        };

        let result = driver
            .provision("vm-x", &spec(), &ImageRef::Registry("ubuntu".into()), &boot)
            .await;
        assert!(matches!(result, Err(DriverError::Other(_))));
        assert!(!tmp.path().join("vm-x").exists());
    }
}
