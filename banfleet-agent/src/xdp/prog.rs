//! Loads the pre-built XDP object, pins its maps, and attaches the
//! program to every usable interface in generic (SKB) mode.

use std::path::{Path, PathBuf};

use aya::maps::lpm_trie::LpmTrie;
use aya::programs::{Xdp, XdpFlags};
use aya::EbpfLoader;
use tracing::{info, warn};

use crate::error::{AgentError, AgentResult};
use crate::xdp::maps::BanMaps;
use crate::xdp::{BANLIST_MAP, IPCACHE_MAP, PROGRAM_NAME};

const IFF_UP: u64 = 0x1;

/// The loaded program and its attachments. Dropping it detaches.
pub struct XdpProgram {
    ebpf: aya::Ebpf,
    pin_dir: PathBuf,
    attached_interfaces: Vec<String>,
}

impl XdpProgram {
    /// Load the object file, pin the two banlist maps under `pin_dir`,
    /// attach to all non-loopback up interfaces, and hand the maps out
    /// for the rule writer.
    pub fn load(object_path: &Path, pin_dir: &Path) -> AgentResult<(Self, BanMaps)> {
        std::fs::create_dir_all(pin_dir)?;
        set_dir_mode(pin_dir)?;

        let mut ebpf = EbpfLoader::new()
            .map_pin_path(pin_dir)
            .load_file(object_path)
            .map_err(|e| AgentError::Xdp(format!("load {}: {e}", object_path.display())))?;

        let program: &mut Xdp = ebpf
            .program_mut(PROGRAM_NAME)
            .ok_or_else(|| AgentError::Xdp(format!("object has no {PROGRAM_NAME} program")))?
            .try_into()
            .map_err(|e| AgentError::Xdp(format!("{PROGRAM_NAME} is not an XDP program: {e}")))?;
        program
            .load()
            .map_err(|e| AgentError::Xdp(format!("load {PROGRAM_NAME}: {e}")))?;

        let mut attached_interfaces = Vec::new();
        for interface in usable_interfaces()? {
            match program.attach(&interface, XdpFlags::SKB_MODE) {
                Ok(_) => {
                    info!(interface = %interface, "xdp attached");
                    attached_interfaces.push(interface);
                }
                Err(e) => warn!(interface = %interface, error = %e, "xdp attach failed"),
            }
        }
        if attached_interfaces.is_empty() {
            return Err(AgentError::Xdp("could not attach to any interface".to_string()));
        }

        let ipcache = ebpf
            .take_map(IPCACHE_MAP)
            .ok_or_else(|| AgentError::Xdp(format!("object has no {IPCACHE_MAP} map")))?;
        let banlist = ebpf
            .take_map(BANLIST_MAP)
            .ok_or_else(|| AgentError::Xdp(format!("object has no {BANLIST_MAP} map")))?;

        let maps = BanMaps::new(
            LpmTrie::try_from(ipcache)
                .map_err(|e| AgentError::Xdp(format!("{IPCACHE_MAP} is not an LPM trie: {e}")))?,
            LpmTrie::try_from(banlist)
                .map_err(|e| AgentError::Xdp(format!("{BANLIST_MAP} is not an LPM trie: {e}")))?,
        );

        Ok((
            Self { ebpf, pin_dir: pin_dir.to_path_buf(), attached_interfaces },
            maps,
        ))
    }

    pub fn attached_interfaces(&self) -> &[String] {
        &self.attached_interfaces
    }

    /// Detach and drop the pinned map entries.
    pub fn close(self) -> AgentResult<()> {
        let pin_dir = self.pin_dir.clone();
        drop(self.ebpf);
        for name in [IPCACHE_MAP, BANLIST_MAP] {
            let path = pin_dir.join(name);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(AgentError::Xdp(format!("unpin {}: {e}", path.display())));
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> AgentResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> AgentResult<()> {
    Ok(())
}

/// Non-loopback interfaces that are administratively up, from sysfs.
fn usable_interfaces() -> AgentResult<Vec<String>> {
    let mut interfaces = Vec::new();
    for entry in std::fs::read_dir("/sys/class/net")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" {
            continue;
        }
        if interface_is_up(&name) {
            interfaces.push(name);
        }
    }
    Ok(interfaces)
}

fn interface_is_up(name: &str) -> bool {
    let Ok(raw) = std::fs::read_to_string(format!("/sys/class/net/{name}/flags")) else {
        return false;
    };
    let Ok(flags) = u64::from_str_radix(raw.trim().trim_start_matches("0x"), 16) else {
        return false;
    };
    flags & IFF_UP != 0
}
