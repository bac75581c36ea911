//! eBPF program loading and attachment
//!
//! Loads the classifier object, populates the allow-list tables, and
//! attaches the socket filter to an AF_PACKET socket bound to the monitored
//! interface. The socket and the loaded program live as long as this struct;
//! dropping it detaches the filter and destroys the maps.

use std::ffi::CString;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{Array, HashMap as BpfHashMap, MapData, PerCpuArray};
use aya::programs::SocketFilter;
use aya::Ebpf;
use log::info;

use connectivity_common::{
    StatsKey, StatsValue, TupleData, TupleKey, MAP_ALLOWED_CIDRS, MAP_ALLOWED_PORTS,
    MAP_CONNECTIONS, MAP_HISTOGRAM, MAP_MISC_COUNTERS, MAP_STATS, MAP_TICKER,
};

use crate::config::Cidr;
use crate::error::{ExporterError, Result};

/// Name of the socket filter program inside the eBPF object.
const PROGRAM_NAME: &str = "connectivity";

/// Loader and owner of the classifier program.
pub struct ProbeLoader {
    ebpf: Ebpf,
    /// The AF_PACKET socket the filter is attached to. Never read; it exists
    /// to keep the attachment alive.
    _socket: Option<OwnedFd>,
}

impl ProbeLoader {
    /// Load the classifier from a file or from embedded bytecode.
    pub fn load(object: Option<PathBuf>) -> Result<Self> {
        let ebpf = match object {
            Some(path) => {
                info!("loading classifier object from {}", path.display());
                let data = std::fs::read(&path).map_err(|e| {
                    ExporterError::Load(format!("reading {}: {e}", path.display()))
                })?;
                Ebpf::load(&data).map_err(|e| ExporterError::Load(e.to_string()))?
            }
            None => {
                #[cfg(feature = "embedded")]
                {
                    info!("loading embedded classifier object");
                    let data = include_bytes!(concat!(
                        env!("CARGO_MANIFEST_DIR"),
                        "/../connectivity-ebpf/target/bpfel-unknown-none/release/connectivity-ebpf"
                    ));
                    Ebpf::load(data).map_err(|e| ExporterError::Load(e.to_string()))?
                }
                #[cfg(not(feature = "embedded"))]
                {
                    return Err(ExporterError::Load(
                        "no classifier object provided; pass --ebpf-object or build with the \
                         'embedded' feature"
                            .to_owned(),
                    ));
                }
            }
        };
        Ok(Self {
            ebpf,
            _socket: None,
        })
    }

    /// Populate the destination allow-lists consulted by the classifier.
    pub fn populate_filters(&mut self, cidrs: &[Cidr], ports: &[u16]) -> Result<()> {
        let map = self.map_mut(MAP_ALLOWED_CIDRS)?;
        let mut trie: LpmTrie<_, u32, u8> = LpmTrie::try_from(map).map_err(|e| {
            ExporterError::MapInit {
                map: MAP_ALLOWED_CIDRS,
                reason: e.to_string(),
            }
        })?;
        for cidr in cidrs {
            let key = Key::new(u32::from(cidr.prefix_len), u32::from(cidr.addr).to_be());
            trie.insert(&key, 1, 0).map_err(|e| ExporterError::MapInit {
                map: MAP_ALLOWED_CIDRS,
                reason: e.to_string(),
            })?;
        }

        let map = self.map_mut(MAP_ALLOWED_PORTS)?;
        let mut port_map: BpfHashMap<_, u16, u8> =
            BpfHashMap::try_from(map).map_err(|e| ExporterError::MapInit {
                map: MAP_ALLOWED_PORTS,
                reason: e.to_string(),
            })?;
        for port in ports {
            port_map
                .insert(port, 1, 0)
                .map_err(|e| ExporterError::MapInit {
                    map: MAP_ALLOWED_PORTS,
                    reason: e.to_string(),
                })?;
        }

        info!(
            "allow-lists loaded: {} CIDRs, {} ports",
            cidrs.len(),
            ports.len()
        );
        Ok(())
    }

    /// Attach the socket filter to an AF_PACKET socket bound to `iface`.
    pub fn attach(&mut self, iface: &str) -> Result<()> {
        let socket = open_packet_socket(iface).map_err(|e| ExporterError::Attach {
            iface: iface.to_owned(),
            reason: e.to_string(),
        })?;

        let program: &mut SocketFilter = self
            .ebpf
            .program_mut(PROGRAM_NAME)
            .ok_or_else(|| ExporterError::Attach {
                iface: iface.to_owned(),
                reason: format!("program '{PROGRAM_NAME}' not found in object"),
            })?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| ExporterError::Attach {
                iface: iface.to_owned(),
                reason: e.to_string(),
            })?;
        program.load().map_err(|e| ExporterError::Attach {
            iface: iface.to_owned(),
            reason: e.to_string(),
        })?;
        program
            .attach(&socket)
            .map_err(|e| ExporterError::Attach {
                iface: iface.to_owned(),
                reason: e.to_string(),
            })?;

        info!("classifier attached to {iface}");
        self._socket = Some(socket);
        Ok(())
    }

    pub fn connection_map(&mut self) -> Result<BpfHashMap<MapData, TupleKey, TupleData>> {
        let map = self.take_map(MAP_CONNECTIONS)?;
        BpfHashMap::try_from(map).map_err(|e| ExporterError::MapInit {
            map: MAP_CONNECTIONS,
            reason: e.to_string(),
        })
    }

    pub fn stats_map(&mut self) -> Result<BpfHashMap<MapData, StatsKey, StatsValue>> {
        let map = self.take_map(MAP_STATS)?;
        BpfHashMap::try_from(map).map_err(|e| ExporterError::MapInit {
            map: MAP_STATS,
            reason: e.to_string(),
        })
    }

    pub fn ticker_map(&mut self) -> Result<Array<MapData, u64>> {
        let map = self.take_map(MAP_TICKER)?;
        Array::try_from(map).map_err(|e| ExporterError::MapInit {
            map: MAP_TICKER,
            reason: e.to_string(),
        })
    }

    pub fn histogram_map(&mut self) -> Result<PerCpuArray<MapData, u64>> {
        let map = self.take_map(MAP_HISTOGRAM)?;
        PerCpuArray::try_from(map).map_err(|e| ExporterError::MapInit {
            map: MAP_HISTOGRAM,
            reason: e.to_string(),
        })
    }

    pub fn misc_counters_map(&mut self) -> Result<PerCpuArray<MapData, u64>> {
        let map = self.take_map(MAP_MISC_COUNTERS)?;
        PerCpuArray::try_from(map).map_err(|e| ExporterError::MapInit {
            map: MAP_MISC_COUNTERS,
            reason: e.to_string(),
        })
    }

    fn map_mut(&mut self, name: &'static str) -> Result<&mut aya::maps::Map> {
        self.ebpf.map_mut(name).ok_or_else(|| ExporterError::MapInit {
            map: name,
            reason: "map not found in object".to_owned(),
        })
    }

    fn take_map(&mut self, name: &'static str) -> Result<aya::maps::Map> {
        self.ebpf.take_map(name).ok_or_else(|| ExporterError::MapInit {
            map: name,
            reason: "map not found in object".to_owned(),
        })
    }
}

/// Open a raw AF_PACKET socket bound to the interface. The socket filter
/// attached to it sees every ingress and egress frame on the interface.
fn open_packet_socket(iface: &str) -> std::io::Result<OwnedFd> {
    let name = CString::new(iface)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "interface name"))?;
    let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if ifindex == 0 {
        return Err(std::io::Error::last_os_error());
    }

    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            (libc::ETH_P_ALL as u16).to_be() as i32,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by socket(2) and is owned by no one else.
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    addr.sll_ifindex = ifindex as i32;
    let rc = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(socket)
}
