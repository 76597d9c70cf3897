//! 8259 Programmable Interrupt Controller (PIC) driver
//!
//! The PIC handles hardware interrupts (IRQs) and maps them to CPU interrupt
//! vectors. We remap IRQs to vectors 0x20-0x2F and keep a cached copy of the
//! mask bytes so masking never needs a read-modify-write on the device.

use core::sync::atomic::{AtomicU8, Ordering};

use super::io::{inb, io_wait, outb};

/// Master PIC command port
const MASTER_COMMAND: u16 = 0x20;
/// Master PIC data port
const MASTER_DATA: u16 = 0x21;
/// Slave PIC command port
const SLAVE_COMMAND: u16 = 0xA0;
/// Slave PIC data port
const SLAVE_DATA: u16 = 0xA1;

/// ICW1: Initialization + ICW4 needed
const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
/// ICW3: Slave PIC on IRQ2
const ICW3_SLAVE_PIC: u8 = 0x04;
/// ICW3: Cascade identity for slave
const ICW3_CASCADE: u8 = 0x02;
/// ICW4: 8086 mode
const ICW4_8086: u8 = 0x01;

/// End-of-interrupt command
const COMMAND_EOI: u8 = 0x20;
/// OCW3: read In-Service Register
const OCW3_READ_ISR: u8 = 0x0B;
/// OCW3: read Interrupt Request Register
const OCW3_READ_IRR: u8 = 0x0A;

/// Cascade line on the master
const CASCADE_IRQ: u8 = 2;

/// IRQ offset for master PIC (IRQ0 -> interrupt 0x20)
pub const PIC1_OFFSET: u8 = 0x20;
/// IRQ offset for slave PIC (IRQ8 -> interrupt 0x28)
pub const PIC2_OFFSET: u8 = 0x28;

/// Cached mask bytes; the device copy mirrors these.
static MASTER_MASK: AtomicU8 = AtomicU8::new(0xFF);
static SLAVE_MASK: AtomicU8 = AtomicU8::new(0xFF);

/// Initialize the PIC with the given offsets.
///
/// Remaps IRQ0-7 to `offset1` and IRQ8-15 to `offset2`. All IRQs start
/// masked; lines are unmasked by the dispatch table on first registration.
pub fn init(offset1: u8, offset2: u8) {
    unsafe {
        // Start initialization sequence
        outb(MASTER_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();
        outb(SLAVE_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();

        // Set vector offsets
        outb(MASTER_DATA, offset1);
        io_wait();
        outb(SLAVE_DATA, offset2);
        io_wait();

        // Configure cascading
        outb(MASTER_DATA, ICW3_SLAVE_PIC);
        io_wait();
        outb(SLAVE_DATA, ICW3_CASCADE);
        io_wait();

        // Set 8086 mode
        outb(MASTER_DATA, ICW4_8086);
        io_wait();
        outb(SLAVE_DATA, ICW4_8086);
        io_wait();

        // Everything masked until a handler registers
        outb(MASTER_DATA, 0xFF);
        outb(SLAVE_DATA, 0xFF);
    }
    MASTER_MASK.store(0xFF, Ordering::Relaxed);
    SLAVE_MASK.store(0xFF, Ordering::Relaxed);

    log::info!(
        "PIC remapped: master base {:#x}, slave base {:#x}, all IRQs masked",
        offset1,
        offset2
    );
}

/// Unmask a specific IRQ line. Unmasking a slave line also opens the
/// cascade (IRQ2) on the master.
pub fn unmask_irq(irq: u8) {
    if irq >= 8 {
        let mask = SLAVE_MASK.load(Ordering::Relaxed) & !(1 << (irq - 8));
        SLAVE_MASK.store(mask, Ordering::Relaxed);
        unsafe { outb(SLAVE_DATA, mask) };

        let master = MASTER_MASK.load(Ordering::Relaxed) & !(1 << CASCADE_IRQ);
        MASTER_MASK.store(master, Ordering::Relaxed);
        unsafe { outb(MASTER_DATA, master) };
    } else {
        let mask = MASTER_MASK.load(Ordering::Relaxed) & !(1 << irq);
        MASTER_MASK.store(mask, Ordering::Relaxed);
        unsafe { outb(MASTER_DATA, mask) };
    }
}

/// Mask a specific IRQ line.
pub fn mask_irq(irq: u8) {
    if irq >= 8 {
        let mask = SLAVE_MASK.load(Ordering::Relaxed) | (1 << (irq - 8));
        SLAVE_MASK.store(mask, Ordering::Relaxed);
        unsafe { outb(SLAVE_DATA, mask) };
    } else {
        let mask = MASTER_MASK.load(Ordering::Relaxed) | (1 << irq);
        MASTER_MASK.store(mask, Ordering::Relaxed);
        unsafe { outb(MASTER_DATA, mask) };
    }
}

/// Check whether an IRQ line is currently masked.
pub fn is_masked(irq: u8) -> bool {
    if irq >= 8 {
        SLAVE_MASK.load(Ordering::Relaxed) & (1 << (irq - 8)) != 0
    } else {
        MASTER_MASK.load(Ordering::Relaxed) & (1 << irq) != 0
    }
}

/// Send End-Of-Interrupt to the PIC for the given IRQ.
pub fn send_eoi(irq: u8) {
    unsafe {
        if irq >= 8 {
            outb(SLAVE_COMMAND, COMMAND_EOI);
        }
        outb(MASTER_COMMAND, COMMAND_EOI);
    }
}

/// EOI path for a spurious interrupt: the originating PIC gets no EOI.
/// A spurious IRQ 15 still requires an EOI on the master (the cascade was
/// real).
pub fn send_eoi_spurious(irq: u8) {
    if irq >= 8 {
        unsafe { outb(MASTER_COMMAND, COMMAND_EOI) };
    }
}

/// Read the combined In-Service Register (slave in the high byte).
pub fn read_isr() -> u16 {
    unsafe {
        outb(MASTER_COMMAND, OCW3_READ_ISR);
        outb(SLAVE_COMMAND, OCW3_READ_ISR);
        let master = inb(MASTER_COMMAND) as u16;
        let slave = inb(SLAVE_COMMAND) as u16;
        (slave << 8) | master
    }
}

/// Read the combined Interrupt Request Register (slave in the high byte).
pub fn read_irr() -> u16 {
    unsafe {
        outb(MASTER_COMMAND, OCW3_READ_IRR);
        outb(SLAVE_COMMAND, OCW3_READ_IRR);
        let master = inb(MASTER_COMMAND) as u16;
        let slave = inb(SLAVE_COMMAND) as u16;
        (slave << 8) | master
    }
}

/// Spurious check for IRQ 7 / IRQ 15: the interrupt is spurious when the
/// corresponding ISR bit is clear.
pub fn is_spurious(irq: u8) -> bool {
    debug_assert!(irq == 7 || irq == 15);
    read_isr() & (1 << irq) == 0
}
