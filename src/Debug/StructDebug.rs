use std::fmt;
use std::io;

use crate::Core::alloc::MemZone;
use crate::Core::registry::Registry;
use crate::Rcu::QsbrStatus;
use crate::Ring::{RingKind, RingStatus, SyncMode};
use crate::Stack::StackStatus;

/// Debug function for MemZone
///
/// Shows the zone name, base address and geometry, never the contents.
pub fn debug_memzone(zone: &MemZone, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MemZone")
        .field("name", &zone.name())
        .field("addr", &format_args!("{:p}", zone.as_ptr()))
        .field("len", &zone.len())
        .field("align", &zone.align())
        .field("socket_id", &zone.socket_id())
        .field("attached", &zone.is_attached())
        .field("handle", &zone.raw_handle())
        .finish()
}

/// Debug function for Registry
///
/// Lists the allocator and the registered names; objects are not dumped.
pub fn debug_registry(registry: &Registry, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Registry")
        .field("allocator", &registry.allocator())
        .field("rings", &registry.ring_names())
        .field("stacks", &registry.stack_names())
        .finish()
}

/// Debug function for rings of either kind, from a status snapshot.
pub fn debug_ring(status: &RingStatus, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let ty = match status.kind {
        RingKind::Standard => "Ring",
        RingKind::LockFree => "LfRing",
    };
    f.debug_struct(ty)
        .field("name", &status.name)
        .field("addr", &format_args!("0x{:x}", status.addr))
        .field("producer", &status.producer)
        .field("consumer", &status.consumer)
        .field("size", &status.size)
        .field("capacity", &status.capacity)
        .field("used", &status.used)
        .finish_non_exhaustive()
}

pub fn debug_qsbr(status: &QsbrStatus, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Qsbr")
        .field("addr", &format_args!("0x{:x}", status.addr))
        .field("max_threads", &status.max_threads)
        .field("num_threads", &status.num_threads)
        .field("token", &status.token)
        .finish_non_exhaustive()
}

pub fn debug_stack(status: &StackStatus, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Stack")
        .field("name", &status.name)
        .field("addr", &format_args!("0x{:x}", status.addr))
        .field("capacity", &status.capacity)
        .field("used", &status.used)
        .finish_non_exhaustive()
}

fn flags(status: &RingStatus) -> u32 {
    let mut flags = 0;
    if status.producer == SyncMode::Single {
        flags |= 0x1;
    }
    if status.consumer == SyncMode::Single {
        flags |= 0x2;
    }
    if status.exact_size {
        flags |= 0x4;
    }
    if status.kind == RingKind::LockFree {
        flags |= 0x20;
    }
    flags
}

/// Textual dump of a ring's cursors and fill level.
pub fn dump_ring<W: io::Write + ?Sized>(w: &mut W, status: &RingStatus) -> io::Result<()> {
    writeln!(w, "ring <{}>@0x{:x}", status.name, status.addr)?;
    writeln!(w, "  flags={:x}", flags(status))?;
    writeln!(w, "  size={}", status.size)?;
    writeln!(w, "  capacity={}", status.capacity)?;
    writeln!(w, "  ct={}", status.cons_tail)?;
    writeln!(w, "  ch={}", status.cons_head)?;
    writeln!(w, "  pt={}", status.prod_tail)?;
    writeln!(w, "  ph={}", status.prod_head)?;
    writeln!(w, "  used={}", status.used)?;
    writeln!(w, "  avail={}", status.avail)
}

/// Textual dump of a QSBR variable: sizes, registration bitmap, token and the
/// counter of every registered reader.
pub fn dump_qsbr<W: io::Write + ?Sized>(w: &mut W, status: &QsbrStatus) -> io::Result<()> {
    writeln!(w)?;
    writeln!(w, "Quiescent State Variable @0x{:x}", status.addr)?;
    writeln!(w, "  QS variable memory size = {}", status.memsize)?;
    writeln!(w, "  Given # max threads = {}", status.max_threads)?;
    writeln!(w, "  Current # threads = {}", status.num_threads)?;
    write!(w, "  Registered thread ID mask = 0x")?;
    for word in &status.registered {
        write!(w, "{word:x}")?;
    }
    writeln!(w)?;
    writeln!(w, "  Token = {}", status.token)?;
    writeln!(w, "Quiescent State Counts for readers:")?;
    for (id, count) in &status.counters {
        writeln!(w, "thread ID = {id}, count = {count}")?;
    }
    Ok(())
}

pub fn dump_stack<W: io::Write + ?Sized>(w: &mut W, status: &StackStatus) -> io::Result<()> {
    writeln!(w, "stack <{}>@0x{:x}", status.name, status.addr)?;
    writeln!(w, "  capacity={}", status.capacity)?;
    writeln!(w, "  used={}", status.used)?;
    writeln!(w, "  avail={}", status.avail)?;
    writeln!(w, "  locked={}", status.locked)
}
