//! PIT (Programmable Interval Timer) driver.
//!
//! Programs channel 0 in mode 3 (square wave) as the periodic system tick
//! on IRQ 0, maintains the tick counter, and runs the periodic callback
//! wheel that drivers use for timeouts and the GDT uses for its integrity
//! check. Also provides `deadline_poll`, the single polling primitive used
//! by the storage drivers.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use x86_64::instructions::port::Port;

use super::irq;

const PIT_CHANNEL0_PORT: u16 = 0x40;
const PIT_COMMAND_PORT: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, mode 3 (square wave), binary.
const PIT_COMMAND_BYTE: u8 = 0x36;
const PIT_BASE_FREQUENCY: u32 = 1_193_182; // Hz

/// System tick rate. 1 kHz keeps sleep_ms at millisecond granularity.
pub const TIMER_HZ: u32 = 1000;

/// Periodic callback slots.
const CALLBACK_SLOTS: usize = 16;

/// Assumed TSC rate for `busy_wait_us`; calibration is out of scope for the
/// core, 2 GHz is a safe order-of-magnitude for emulators and hardware.
const ASSUMED_TSC_HZ: u64 = 2_000_000_000;

static TICKS: AtomicU64 = AtomicU64::new(0);
static CONFIGURED_HZ: AtomicU64 = AtomicU64::new(TIMER_HZ as u64);

struct CallbackSlot {
    callback: AtomicUsize,
    context: AtomicUsize,
    interval_ticks: AtomicU64,
    next_tick: AtomicU64,
    active: AtomicBool,
}

impl CallbackSlot {
    const fn new() -> Self {
        CallbackSlot {
            callback: AtomicUsize::new(0),
            context: AtomicUsize::new(0),
            interval_ticks: AtomicU64::new(0),
            next_tick: AtomicU64::new(0),
            active: AtomicBool::new(false),
        }
    }
}

/// Timer callback: runs in IRQ context.
pub type TimerCallback = fn(ctx: *mut ());

static CALLBACKS: [CallbackSlot; CALLBACK_SLOTS] =
    [const { CallbackSlot::new() }; CALLBACK_SLOTS];

/// Single-word lock for callback-table mutation. The tick handler skips the
/// wheel when it cannot take the flag.
static CALLBACK_LOCK: AtomicBool = AtomicBool::new(false);

/// Result of a deadline-bounded poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    Completed,
    TimedOut,
}

/// Compute the PIT divisor for a target frequency (rounded).
fn pit_divisor(frequency_hz: u32) -> u16 {
    let divisor = (PIT_BASE_FREQUENCY + frequency_hz / 2) / frequency_hz;
    divisor.clamp(1, 65535) as u16
}

/// Ticks for an interval in milliseconds, minimum one tick.
fn interval_to_ticks(interval_ms: u64, hz: u64) -> u64 {
    (interval_ms * hz / 1000).max(1)
}

/// Program channel 0 and register the tick handler on IRQ 0.
pub fn init(frequency_hz: u32) {
    let divisor = pit_divisor(frequency_hz);
    CONFIGURED_HZ.store(frequency_hz as u64, Ordering::Relaxed);

    let mut cmd_port = Port::new(PIT_COMMAND_PORT);
    let mut ch0_port = Port::new(PIT_CHANNEL0_PORT);
    // SAFETY: standard PIT programming sequence; io_wait between command
    // and data per the 8253 protocol.
    unsafe {
        cmd_port.write(PIT_COMMAND_BYTE);
        super::io::io_wait();
        ch0_port.write((divisor & 0xFF) as u8);
        ch0_port.write((divisor >> 8) as u8);
    }

    irq::register(0, tick_handler, core::ptr::null_mut());

    log::info!(
        "PIT: channel 0 mode 3 at {} Hz (divisor {})",
        PIT_BASE_FREQUENCY / divisor as u32,
        divisor
    );
}

/// IRQ 0 tick handler.
fn tick_handler(_irq: u8, _ctx: *mut ()) {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    run_callbacks(now);
}

fn run_callbacks(now: u64) {
    // Skip this tick if registration holds the flag; the wheel catches up
    // on the next tick because due-times are absolute.
    if CALLBACK_LOCK
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    for slot in CALLBACKS.iter() {
        if !slot.active.load(Ordering::Acquire) {
            continue;
        }
        if slot.next_tick.load(Ordering::Relaxed) > now {
            continue;
        }
        let raw = slot.callback.load(Ordering::Relaxed);
        if raw == 0 {
            continue;
        }
        let ctx = slot.context.load(Ordering::Relaxed) as *mut ();
        // SAFETY: raw was stored from a valid TimerCallback before active
        // was released.
        let callback: TimerCallback = unsafe { core::mem::transmute(raw) };
        callback(ctx);

        let interval = slot.interval_ticks.load(Ordering::Relaxed).max(1);
        slot.next_tick.store(now + interval, Ordering::Relaxed);
    }

    CALLBACK_LOCK.store(false, Ordering::Release);
}

fn with_callback_lock<R>(f: impl FnOnce() -> R) -> R {
    while CALLBACK_LOCK
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        core::hint::spin_loop();
    }
    let result = f();
    CALLBACK_LOCK.store(false, Ordering::Release);
    result
}

/// Register a periodic callback. Returns false when all slots are taken.
pub fn register_callback(callback: TimerCallback, context: *mut (), interval_ms: u64) -> bool {
    let hz = CONFIGURED_HZ.load(Ordering::Relaxed);
    let interval = interval_to_ticks(interval_ms, hz);
    let due = TICKS.load(Ordering::Relaxed) + interval;

    with_callback_lock(|| {
        for slot in CALLBACKS.iter() {
            if slot.active.load(Ordering::Relaxed) {
                continue;
            }
            slot.callback.store(callback as usize, Ordering::Relaxed);
            slot.context.store(context as usize, Ordering::Relaxed);
            slot.interval_ticks.store(interval, Ordering::Relaxed);
            slot.next_tick.store(due, Ordering::Relaxed);
            slot.active.store(true, Ordering::Release);
            return true;
        }
        log::warn!("PIT: no free timer callback slot");
        false
    })
}

/// Unregister a periodic callback.
pub fn unregister_callback(callback: TimerCallback, context: *mut ()) -> bool {
    with_callback_lock(|| {
        for slot in CALLBACKS.iter() {
            if slot.active.load(Ordering::Relaxed)
                && slot.callback.load(Ordering::Relaxed) == callback as usize
                && slot.context.load(Ordering::Relaxed) == context as usize
            {
                slot.active.store(false, Ordering::Release);
                return true;
            }
        }
        false
    })
}

/// Monotonic tick counter since PIT init.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since PIT init.
pub fn uptime_ms() -> u64 {
    let hz = CONFIGURED_HZ.load(Ordering::Relaxed);
    ticks() * 1000 / hz
}

/// Sleep at least `ms` milliseconds, halting between ticks.
pub fn sleep_ms(ms: u64) {
    let hz = CONFIGURED_HZ.load(Ordering::Relaxed);
    let target = TICKS.load(Ordering::Relaxed) + interval_to_ticks(ms, hz);
    while TICKS.load(Ordering::Relaxed) < target {
        crate::arch::x86_64::hlt();
    }
}

/// Busy-wait approximately `us` microseconds using the TSC.
pub fn busy_wait_us(us: u64) {
    let start = crate::arch::x86_64::rdtsc();
    let target_cycles = us * (ASSUMED_TSC_HZ / 1_000_000);
    while crate::arch::x86_64::rdtsc().wrapping_sub(start) < target_cycles {
        core::hint::spin_loop();
    }
}

/// Poll `predicate` every `interval_ms` until it holds or `timeout_ms`
/// expires. The single timeout primitive for device polling paths.
pub fn deadline_poll(
    mut predicate: impl FnMut() -> bool,
    interval_ms: u64,
    timeout_ms: u64,
) -> PollResult {
    let deadline = uptime_ms() + timeout_ms;
    loop {
        if predicate() {
            return PollResult::Completed;
        }
        if uptime_ms() >= deadline {
            // One last chance: the predicate may have become true on the
            // final interval.
            if predicate() {
                return PollResult::Completed;
            }
            return PollResult::TimedOut;
        }
        sleep_ms(interval_ms.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divisor_rounding() {
        // 1193182 / 1000 = 1193.182 → 1193
        assert_eq!(pit_divisor(1000), 1193);
        // 1193182 / 100 = 11931.82 → 11932
        assert_eq!(pit_divisor(100), 11932);
    }

    #[test]
    fn test_divisor_clamped() {
        assert_eq!(pit_divisor(10), 65535);
        assert_eq!(pit_divisor(2_000_000), 1);
    }

    #[test]
    fn test_interval_minimum_one_tick() {
        assert_eq!(interval_to_ticks(0, 1000), 1);
        assert_eq!(interval_to_ticks(1, 100), 1);
        assert_eq!(interval_to_ticks(250, 1000), 250);
    }
}
