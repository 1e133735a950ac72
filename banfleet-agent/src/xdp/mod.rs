//! In-kernel XDP plumbing: the two LPM-trie maps and the pre-built
//! program that consults them.

pub mod maps;
pub mod prog;

pub use maps::{BanMaps, IpRule};
pub use prog::XdpProgram;

pub const PIN_DIR: &str = "/sys/fs/bpf/xdp_banner";
pub const IPCACHE_MAP: &str = "identity_ipcache";
pub const BANLIST_MAP: &str = "xdp_banner_banlist";
pub const PROGRAM_NAME: &str = "xdp_banner";
