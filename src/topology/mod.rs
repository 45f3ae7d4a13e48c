//! Topology discovery: decode CPUID leaf 0x1F (fallback 0x0B) domain shifts,
//! enumerate OS threads, and derive the thread/core/tile/module/die/socket
//! tree plus the APIC-id to logical-id mapping described in spec.md §4.4.

use std::collections::HashMap;

use crate::bits::{cpuid, extract_bits, is_genuine_intel, AffinityGuard};
use crate::config::Config;
use crate::error::{PcmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreType {
    Atom,
    Core,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyEntry {
    pub os_id: i32,
    pub thread_id: u32,
    pub core_id: u32,
    pub tile_id: u32,
    pub module_id: u32,
    pub die_id: u32,
    pub die_group_id: u32,
    pub socket_id: u32,
    pub native_cpu_model: u32,
    pub core_type: CoreType,
}

/// One CPUID-leaf-0x1F/0x0B subleaf: a topology domain and the bit position
/// at which the next-higher domain's id begins in the APIC id.
#[derive(Debug, Clone, Copy)]
struct DomainShift {
    domain: TopologyDomain,
    shift: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyDomain {
    LogicalProcessor,
    Core,
    Module,
    Tile,
    Die,
    DieGroup,
    SocketPackage,
}

const LEAF_1F: u32 = 0x1F;
const LEAF_0B: u32 = 0x0B;

/// Read leaf 0x1F's (or, if unsupported, leaf 0x0B's) domain subleaves for
/// the calling thread. Each subleaf reports a domain type in `ecx[15:8]` and
/// the bit-width of that domain (its x2APIC id shift) in `eax[4:0]`.
fn read_domain_shifts() -> Vec<DomainShift> {
    let leaf = if cpuid(0, 0).eax >= LEAF_1F { LEAF_1F } else { LEAF_0B };
    let mut shifts = Vec::new();
    for subleaf in 0u32.. {
        let r = cpuid(leaf, subleaf);
        let domain_type = extract_bits(r.ecx as u64, 8, 15) as u32;
        if domain_type == 0 {
            break;
        }
        let shift = extract_bits(r.eax as u64, 0, 4) as u32;
        let domain = match domain_type {
            1 => TopologyDomain::LogicalProcessor,
            2 => TopologyDomain::Core,
            3 => TopologyDomain::Module,
            4 => TopologyDomain::Tile,
            5 => TopologyDomain::Die,
            6 => TopologyDomain::DieGroup,
            _ => TopologyDomain::SocketPackage,
        };
        shifts.push(DomainShift { domain, shift });
        if subleaf > 16 {
            break;
        }
    }
    if shifts.is_empty() {
        // No 0x1F/0x0B support: treat the whole id as a flat core id.
        shifts.push(DomainShift { domain: TopologyDomain::Core, shift: 0 });
    }
    shifts
}

fn read_apic_id() -> u32 {
    // x2APIC id (leaf 0x0B/0x1F, ecx=0) is authoritative when present.
    let r = cpuid(0x0B, 0);
    if r.edx != 0 {
        return r.edx;
    }
    // Legacy xAPIC id fallback: CPUID.1:EBX[31:24].
    extract_bits(cpuid(1, 0).ebx as u64, 24, 31) as u32
}

fn classify_hybrid(native_cpu_model: &mut u32) -> CoreType {
    let leaf_7 = cpuid(7, 0);
    let hybrid = extract_bits(leaf_7.edx as u64, 15, 15) == 1;
    if !hybrid {
        return CoreType::Core;
    }
    let r = cpuid(0x1A, 0);
    let core_type_byte = extract_bits(r.eax as u64, 24, 31);
    *native_cpu_model = extract_bits(r.eax as u64, 0, 23) as u32;
    if core_type_byte == 0x20 {
        CoreType::Atom
    } else {
        CoreType::Core
    }
}

fn decode_apic_id(apic_id: u32, shifts: &[DomainShift]) -> HashMap<TopologyDomain, u32> {
    let mut ids = HashMap::new();
    let mut prev_shift = 0u32;
    for window in shifts.windows(2) {
        let (lo, hi) = (window[0], window[1]);
        ids.insert(lo.domain, extract_bits(apic_id as u64, prev_shift, hi.shift.saturating_sub(1).max(prev_shift)) as u32);
        prev_shift = hi.shift;
    }
    if let Some(last) = shifts.last() {
        ids.insert(last.domain, extract_bits(apic_id as u64, prev_shift, 31) as u32);
    }
    ids
}

/// Enumerate `/sys/devices/system/cpu/cpu*/online` (and `cpu0`, always
/// online) to get the OS's set of logical processor ids and which are
/// online.
fn enumerate_os_threads() -> Vec<(i32, bool)> {
    let mut threads = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/devices/system/cpu") else {
        return threads;
    };
    let mut ids: Vec<i32> = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.strip_prefix("cpu")?.parse::<i32>().ok()
        })
        .collect();
    ids.sort_unstable();
    for id in ids {
        let online_path = format!("/sys/devices/system/cpu/cpu{id}/online");
        let online = std::fs::read_to_string(&online_path).map(|s| s.trim() == "1").unwrap_or(id == 0);
        threads.push((id, online));
    }
    threads
}

pub struct Topology {
    pub entries: Vec<TopologyEntry>,
    pub num_sockets: usize,
    pub num_phys_cores_per_socket: usize,
    pub threads_per_core: usize,
    pub offline_os_ids: Vec<i32>,
}

impl Topology {
    pub fn discover(config: &Config) -> Result<Self> {
        if !is_genuine_intel() {
            return Err(PcmError::Unsupported("not a GenuineIntel part".into()));
        }

        let hypervisor = extract_bits(cpuid(1, 0).ecx as u64, 31, 31) == 1;
        let arch_perfmon = cpuid(0x0A, 0).eax & 0xFF != 0;
        if hypervisor && !arch_perfmon && !config.ignore_arch_perfmon {
            return Err(PcmError::Unsupported(
                "hypervisor without architectural perfmon; set PCM_IGNORE_ARCH_PERFMON=1 to continue".into(),
            ));
        }

        let mut entries = Vec::new();
        let mut offline_os_ids = Vec::new();

        for (os_id, online) in enumerate_os_threads() {
            if !online {
                offline_os_ids.push(os_id);
                continue;
            }
            let _pin = AffinityGuard::pin_to(os_id)?;
            let shifts = read_domain_shifts();
            let apic_id = read_apic_id();
            let ids = decode_apic_id(apic_id, &shifts);
            let mut native_cpu_model = 0;
            let core_type = classify_hybrid(&mut native_cpu_model);

            entries.push(TopologyEntry {
                os_id,
                thread_id: *ids.get(&TopologyDomain::LogicalProcessor).unwrap_or(&0),
                core_id: *ids.get(&TopologyDomain::Core).unwrap_or(&0),
                tile_id: *ids.get(&TopologyDomain::Tile).unwrap_or(&0),
                module_id: *ids.get(&TopologyDomain::Module).unwrap_or(&0),
                die_id: *ids.get(&TopologyDomain::Die).unwrap_or(&0),
                die_group_id: *ids.get(&TopologyDomain::DieGroup).unwrap_or(&0),
                socket_id: *ids.get(&TopologyDomain::SocketPackage).unwrap_or(&0),
                native_cpu_model,
                core_type,
            });
        }

        renumber_sockets(&mut entries);

        let num_sockets = entries.iter().map(|e| e.socket_id).collect::<std::collections::HashSet<_>>().len().max(1);
        let threads_per_core = {
            let mut by_core: HashMap<(u32, u32), usize> = HashMap::new();
            for e in &entries {
                *by_core.entry((e.socket_id, e.core_id)).or_default() += 1;
            }
            by_core.values().copied().max().unwrap_or(1)
        };
        let num_phys_cores_per_socket = {
            let mut by_socket: HashMap<u32, std::collections::HashSet<u32>> = HashMap::new();
            for e in &entries {
                by_socket.entry(e.socket_id).or_default().insert(e.core_id);
            }
            by_socket.values().map(|s| s.len()).max().unwrap_or(0)
        };

        Ok(Topology { entries, num_sockets, num_phys_cores_per_socket, threads_per_core, offline_os_ids })
    }

    pub fn online_on_socket(&self, socket: u32) -> impl Iterator<Item = &TopologyEntry> {
        self.entries.iter().filter(move |e| e.socket_id == socket)
    }
}

/// Renumber socket ids to be dense `0..S-1`, preserving first-seen order of
/// the APIC-id-derived raw socket ids (spec.md §4.4 step 6).
fn renumber_sockets(entries: &mut [TopologyEntry]) {
    let mut map = HashMap::new();
    let mut next = 0u32;
    for e in entries.iter_mut() {
        let dense = *map.entry(e.socket_id).or_insert_with(|| {
            let id = next;
            next += 1;
            id
        });
        e.socket_id = dense;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario 1 from spec.md §8: synthetic 0x1F-style shifts decoding four
    /// APIC ids into two sockets, one core each, two threads each.
    #[test]
    fn topology_decode_from_synthetic_shifts() {
        let shifts = [
            DomainShift { domain: TopologyDomain::LogicalProcessor, shift: 1 },
            DomainShift { domain: TopologyDomain::Core, shift: 4 },
            DomainShift { domain: TopologyDomain::Die, shift: 6 },
            DomainShift { domain: TopologyDomain::SocketPackage, shift: 8 },
        ];
        let apic_ids = [0x00u32, 0x01, 0x100, 0x101];
        let mut sockets = Vec::new();
        let mut cores = Vec::new();
        let mut threads = Vec::new();
        for apic_id in apic_ids {
            let ids = decode_apic_id(apic_id, &shifts);
            sockets.push(*ids.get(&TopologyDomain::SocketPackage).unwrap());
            cores.push(*ids.get(&TopologyDomain::Core).unwrap());
            threads.push(*ids.get(&TopologyDomain::LogicalProcessor).unwrap());
        }
        assert_eq!(sockets, vec![0, 0, 1, 1]);
        assert_eq!(cores, vec![0, 0, 0, 0]);
        assert_eq!(threads, vec![0, 1, 0, 1]);
    }

    #[test]
    fn socket_renumbering_is_dense_and_order_preserving() {
        let mut entries = vec![
            TopologyEntry {
                os_id: 0, thread_id: 0, core_id: 0, tile_id: 0, module_id: 0,
                die_id: 0, die_group_id: 0, socket_id: 4, native_cpu_model: 0, core_type: CoreType::Core,
            },
            TopologyEntry {
                os_id: 1, thread_id: 0, core_id: 0, tile_id: 0, module_id: 0,
                die_id: 0, die_group_id: 0, socket_id: 9, native_cpu_model: 0, core_type: CoreType::Core,
            },
            TopologyEntry {
                os_id: 2, thread_id: 0, core_id: 0, tile_id: 0, module_id: 0,
                die_id: 0, die_group_id: 0, socket_id: 4, native_cpu_model: 0, core_type: CoreType::Core,
            },
        ];
        renumber_sockets(&mut entries);
        assert_eq!(entries.iter().map(|e| e.socket_id).collect::<Vec<_>>(), vec![0, 1, 0]);
    }
}
