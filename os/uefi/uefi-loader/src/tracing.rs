//! # Trace output

use boot_addresses::PhysicalAddress;
use boot_handoff::KernelHandoff;
use boot_qemu::qemu_trace;

pub fn trace_handoff(handoff: &KernelHandoff, system_table: PhysicalAddress) {
    let map = &handoff.memory_map;
    qemu_trace!("Handoff in UEFI Loader:\n");
    qemu_trace!("  PML4 = {:018x}", handoff.root.as_u64());
    qemu_trace!(", systab = {:018x}", system_table.as_u64());
    qemu_trace!(", RTS = {:?}", handoff.rts);
    qemu_trace!("\n");
    qemu_trace!(" MMAP ptr = {:018x}", map.map_ptr() as usize);
    qemu_trace!(", MMAP entries = {}", map.len());
    qemu_trace!(", MMAP desc size = {}", map.stride());
    qemu_trace!(", MMAP desc version = {}", map.version());
    qemu_trace!("\n");
    for range in handoff.ranges() {
        qemu_trace!(
            "   {:018x} +{:#x} {:?}\n",
            range.base,
            range.length,
            range.kind
        );
    }
}
