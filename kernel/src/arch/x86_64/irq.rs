//! Hardware IRQ dispatch.
//!
//! Maps IRQ number → a fixed-capacity list of registered handlers. An IRQ
//! line is unmasked at the PIC on first registration and masked again when
//! its last handler unregisters.
//!
//! Registration runs in a short interrupts-disabled critical section;
//! interrupt context reads the slots with acquire semantics and tolerates a
//! handler disappearing mid-iteration.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::pic;

pub const IRQ_COUNT: usize = 16;
/// Handler slots per IRQ line.
pub const HANDLERS_PER_IRQ: usize = 8;

/// A registered handler: called from interrupt context with the IRQ number
/// and the opaque context it was registered with.
pub type IrqHandler = fn(irq: u8, ctx: *mut ());

struct HandlerSlot {
    handler: AtomicUsize,
    context: AtomicUsize,
    active: AtomicBool,
}

impl HandlerSlot {
    const fn new() -> Self {
        HandlerSlot {
            handler: AtomicUsize::new(0),
            context: AtomicUsize::new(0),
            active: AtomicBool::new(false),
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: HandlerSlot = HandlerSlot::new();
#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_LINE: [HandlerSlot; HANDLERS_PER_IRQ] = [EMPTY_SLOT; HANDLERS_PER_IRQ];

static HANDLERS: [[HandlerSlot; HANDLERS_PER_IRQ]; IRQ_COUNT] = [EMPTY_LINE; IRQ_COUNT];

static IRQ_COUNTS: [AtomicU64; IRQ_COUNT] = [const { AtomicU64::new(0) }; IRQ_COUNT];
static SPURIOUS_COUNTS: [AtomicU64; IRQ_COUNT] = [const { AtomicU64::new(0) }; IRQ_COUNT];
static TOTAL_INTERRUPTS: AtomicU64 = AtomicU64::new(0);

/// Per-IRQ observability snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct IrqStats {
    pub count: u64,
    pub spurious: u64,
}

/// Register a handler for an IRQ line.
///
/// Returns false when the line already has `HANDLERS_PER_IRQ` handlers.
/// The first registration unmasks the line at the PIC.
pub fn register(irq: u8, handler: IrqHandler, context: *mut ()) -> bool {
    let irq = irq as usize;
    if irq >= IRQ_COUNT {
        return false;
    }

    let flags = crate::arch::x86_64::save_flags_and_cli();
    let was_empty = !any_active(irq);

    let mut installed = false;
    for slot in HANDLERS[irq].iter() {
        if !slot.active.load(Ordering::Relaxed) {
            slot.handler.store(handler as usize, Ordering::Relaxed);
            slot.context.store(context as usize, Ordering::Relaxed);
            slot.active.store(true, Ordering::Release);
            installed = true;
            break;
        }
    }

    if installed && was_empty {
        pic::unmask_irq(irq as u8);
    }
    crate::arch::x86_64::restore_flags(flags);

    if !installed {
        log::warn!("IRQ {}: no free handler slot", irq);
    }
    installed
}

/// Unregister a previously registered handler.
///
/// When the last handler of a line goes away, the line is masked again.
pub fn unregister(irq: u8, handler: IrqHandler, context: *mut ()) -> bool {
    let irq = irq as usize;
    if irq >= IRQ_COUNT {
        return false;
    }

    let flags = crate::arch::x86_64::save_flags_and_cli();
    let mut removed = false;
    for slot in HANDLERS[irq].iter() {
        if slot.active.load(Ordering::Relaxed)
            && slot.handler.load(Ordering::Relaxed) == handler as usize
            && slot.context.load(Ordering::Relaxed) == context as usize
        {
            slot.active.store(false, Ordering::Release);
            removed = true;
            break;
        }
    }

    if removed && !any_active(irq) {
        pic::mask_irq(irq as u8);
    }
    crate::arch::x86_64::restore_flags(flags);
    removed
}

fn any_active(irq: usize) -> bool {
    HANDLERS[irq]
        .iter()
        .any(|slot| slot.active.load(Ordering::Acquire))
}

/// Run all active handlers for an IRQ. Returns whether any handler ran.
fn dispatch(irq: u8) -> bool {
    let mut handled = false;
    for slot in HANDLERS[irq as usize].iter() {
        if !slot.active.load(Ordering::Acquire) {
            continue;
        }
        let raw = slot.handler.load(Ordering::Relaxed);
        if raw == 0 {
            continue;
        }
        let ctx = slot.context.load(Ordering::Relaxed) as *mut ();
        // SAFETY: raw was stored from a valid IrqHandler fn pointer before
        // active was released.
        let handler: IrqHandler = unsafe { core::mem::transmute(raw) };
        handler(irq, ctx);
        handled = true;
    }
    handled
}

/// Common IRQ entry called from the interrupt stubs.
///
/// Dispatches to the registered handlers, detects spurious IRQ 7/15 (no
/// handler claimed the interrupt and the ISR bit is clear — no EOI to the
/// originating PIC), and acknowledges the PIC otherwise.
pub fn handle_interrupt(irq: u8) {
    TOTAL_INTERRUPTS.fetch_add(1, Ordering::Relaxed);
    IRQ_COUNTS[irq as usize].fetch_add(1, Ordering::Relaxed);

    let handled = dispatch(irq);

    if !handled && (irq == 7 || irq == 15) && pic::is_spurious(irq) {
        SPURIOUS_COUNTS[irq as usize].fetch_add(1, Ordering::Relaxed);
        pic::send_eoi_spurious(irq);
        return;
    }

    pic::send_eoi(irq);
}

/// Statistics for one IRQ line.
pub fn stats(irq: u8) -> IrqStats {
    let irq = irq as usize;
    if irq >= IRQ_COUNT {
        return IrqStats::default();
    }
    IrqStats {
        count: IRQ_COUNTS[irq].load(Ordering::Relaxed),
        spurious: SPURIOUS_COUNTS[irq].load(Ordering::Relaxed),
    }
}

/// Total interrupts dispatched since boot.
pub fn total_interrupts() -> u64 {
    TOTAL_INTERRUPTS.load(Ordering::Relaxed)
}
