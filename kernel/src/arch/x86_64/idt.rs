//! Interrupt Descriptor Table (IDT) for Helios-OS.
//!
//! Vectors 0-31 are CPU exceptions routed through a common trap handler
//! that builds an `ExceptionInfo` and calls the registered handler or
//! panics. Vector 14 (page fault) delegates to the VMM first. Vectors
//! 32-47 are the remapped PIC IRQs, routed into the dispatch table.

use core::sync::atomic::{AtomicUsize, Ordering};
use x86_64::{
    registers::control::{Cr0, Cr2, Cr3, Cr4},
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
};

use super::{irq, pic, tss};

/// Snapshot handed to exception handlers.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionInfo {
    pub vector: u8,
    pub error_code: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub cs: u16,
    pub ss: u16,
    pub rflags: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

/// A registered exception handler.
pub type ExceptionHandler = fn(&ExceptionInfo);

static EXCEPTION_HANDLERS: [AtomicUsize; 32] = [const { AtomicUsize::new(0) }; 32];

/// Static IDT storage (must be 'static for load())
static mut IDT_STORAGE: InterruptDescriptorTable = InterruptDescriptorTable::new();

/// Register a handler for an exception vector (0-31).
pub fn register_exception_handler(vector: u8, handler: ExceptionHandler) -> bool {
    if vector >= 32 {
        return false;
    }
    let flags = crate::arch::x86_64::save_flags_and_cli();
    EXCEPTION_HANDLERS[vector as usize].store(handler as usize, Ordering::Release);
    crate::arch::x86_64::restore_flags(flags);
    true
}

/// Remove the handler for an exception vector.
pub fn unregister_exception_handler(vector: u8) {
    if vector < 32 {
        EXCEPTION_HANDLERS[vector as usize].store(0, Ordering::Release);
    }
}

fn read_rbp() -> u64 {
    let rbp: u64;
    // SAFETY: reading a register has no side effects.
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack));
    }
    rbp
}

fn build_info(vector: u8, error_code: u64, frame: &InterruptStackFrame) -> ExceptionInfo {
    ExceptionInfo {
        vector,
        error_code,
        rip: frame.instruction_pointer.as_u64(),
        rsp: frame.stack_pointer.as_u64(),
        rbp: read_rbp(),
        cs: frame.code_segment.0,
        ss: frame.stack_segment.0,
        rflags: frame.cpu_flags.bits(),
        cr0: Cr0::read_raw(),
        cr2: Cr2::read_raw(),
        cr3: Cr3::read().0.start_address().as_u64(),
        cr4: Cr4::read_raw(),
    }
}

/// Common trap path for vectors 0-31.
fn handle_exception(vector: u8, error_code: u64, frame: &InterruptStackFrame) {
    let info = build_info(vector, error_code, frame);

    let raw = EXCEPTION_HANDLERS[vector as usize].load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: raw was stored from a valid ExceptionHandler fn pointer.
        let handler: ExceptionHandler = unsafe { core::mem::transmute(raw) };
        handler(&info);
        return;
    }

    log::error!("EXCEPTION: vector {} (error code {:#x})", vector, error_code);
    log::error!(
        "  RIP={:#x} RSP={:#x} RBP={:#x} CS={:#x} SS={:#x} RFLAGS={:#x}",
        info.rip,
        info.rsp,
        info.rbp,
        info.cs,
        info.ss,
        info.rflags
    );
    log::error!(
        "  CR0={:#x} CR2={:#x} CR3={:#x} CR4={:#x}",
        info.cr0,
        info.cr2,
        info.cr3,
        info.cr4
    );
    panic!("Unhandled CPU exception {}", vector);
}

macro_rules! exception_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame) {
            handle_exception($vector, 0, &stack_frame);
        }
    };
}

macro_rules! exception_handler_with_code {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame, error_code: u64) {
            handle_exception($vector, error_code, &stack_frame);
        }
    };
}

exception_handler!(divide_error_handler, 0);
exception_handler!(debug_handler, 1);
exception_handler!(nmi_handler, 2);
exception_handler!(breakpoint_handler, 3);
exception_handler!(overflow_handler, 4);
exception_handler!(bound_range_handler, 5);
exception_handler!(invalid_opcode_handler, 6);
exception_handler!(device_not_available_handler, 7);
exception_handler_with_code!(invalid_tss_handler, 10);
exception_handler_with_code!(segment_not_present_handler, 11);
exception_handler_with_code!(stack_segment_handler, 12);
exception_handler_with_code!(general_protection_handler, 13);
exception_handler!(x87_floating_point_handler, 16);
exception_handler_with_code!(alignment_check_handler, 17);
exception_handler!(simd_floating_point_handler, 19);
exception_handler!(virtualization_handler, 20);

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    panic!(
        "EXCEPTION: DOUBLE FAULT (error code: {:#x})\n{:#?}",
        error_code, stack_frame
    );
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    panic!("EXCEPTION: MACHINE CHECK\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_addr = Cr2::read_raw();
    let bits = error_code.bits();

    if crate::memory::paging::handle_page_fault(fault_addr, bits) {
        return;
    }

    crate::memory::paging::print_page_fault_diagnostic(
        fault_addr,
        bits,
        stack_frame.instruction_pointer.as_u64(),
    );

    // Unrecoverable: disable interrupts and halt.
    crate::arch::x86_64::cli();
    loop {
        crate::arch::x86_64::hlt();
    }
}

macro_rules! irq_stub {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            irq::handle_interrupt($irq);
        }
    };
}

irq_stub!(irq0_handler, 0);
irq_stub!(irq1_handler, 1);
irq_stub!(irq2_handler, 2);
irq_stub!(irq3_handler, 3);
irq_stub!(irq4_handler, 4);
irq_stub!(irq5_handler, 5);
irq_stub!(irq6_handler, 6);
irq_stub!(irq7_handler, 7);
irq_stub!(irq8_handler, 8);
irq_stub!(irq9_handler, 9);
irq_stub!(irq10_handler, 10);
irq_stub!(irq11_handler, 11);
irq_stub!(irq12_handler, 12);
irq_stub!(irq13_handler, 13);
irq_stub!(irq14_handler, 14);
irq_stub!(irq15_handler, 15);

/// Initialize the IDT with exception handlers and the 16 IRQ stubs.
pub fn init() {
    // SAFETY: Called once during single-threaded kernel init, before
    // interrupts are enabled.
    unsafe {
        let idt = &raw mut IDT_STORAGE;

        (*idt).divide_error.set_handler_fn(divide_error_handler);
        (*idt).debug.set_handler_fn(debug_handler);
        (*idt).non_maskable_interrupt.set_handler_fn(nmi_handler);
        (*idt).breakpoint.set_handler_fn(breakpoint_handler);
        (*idt).overflow.set_handler_fn(overflow_handler);
        (*idt)
            .bound_range_exceeded
            .set_handler_fn(bound_range_handler);
        (*idt).invalid_opcode.set_handler_fn(invalid_opcode_handler);
        (*idt)
            .device_not_available
            .set_handler_fn(device_not_available_handler);
        (*idt)
            .double_fault
            .set_handler_fn(double_fault_handler)
            .set_stack_index(tss::DOUBLE_FAULT_IST_INDEX);
        (*idt).invalid_tss.set_handler_fn(invalid_tss_handler);
        (*idt)
            .segment_not_present
            .set_handler_fn(segment_not_present_handler);
        (*idt)
            .stack_segment_fault
            .set_handler_fn(stack_segment_handler);
        (*idt)
            .general_protection_fault
            .set_handler_fn(general_protection_handler);
        (*idt).page_fault.set_handler_fn(page_fault_handler);
        (*idt)
            .x87_floating_point
            .set_handler_fn(x87_floating_point_handler);
        (*idt)
            .alignment_check
            .set_handler_fn(alignment_check_handler);
        (*idt).machine_check.set_handler_fn(machine_check_handler);
        (*idt)
            .simd_floating_point
            .set_handler_fn(simd_floating_point_handler);
        (*idt).virtualization.set_handler_fn(virtualization_handler);

        let idt_ref = &mut *idt;
        idt_ref[pic::PIC1_OFFSET].set_handler_fn(irq0_handler);
        idt_ref[pic::PIC1_OFFSET + 1].set_handler_fn(irq1_handler);
        idt_ref[pic::PIC1_OFFSET + 2].set_handler_fn(irq2_handler);
        idt_ref[pic::PIC1_OFFSET + 3].set_handler_fn(irq3_handler);
        idt_ref[pic::PIC1_OFFSET + 4].set_handler_fn(irq4_handler);
        idt_ref[pic::PIC1_OFFSET + 5].set_handler_fn(irq5_handler);
        idt_ref[pic::PIC1_OFFSET + 6].set_handler_fn(irq6_handler);
        idt_ref[pic::PIC1_OFFSET + 7].set_handler_fn(irq7_handler);
        idt_ref[pic::PIC2_OFFSET].set_handler_fn(irq8_handler);
        idt_ref[pic::PIC2_OFFSET + 1].set_handler_fn(irq9_handler);
        idt_ref[pic::PIC2_OFFSET + 2].set_handler_fn(irq10_handler);
        idt_ref[pic::PIC2_OFFSET + 3].set_handler_fn(irq11_handler);
        idt_ref[pic::PIC2_OFFSET + 4].set_handler_fn(irq12_handler);
        idt_ref[pic::PIC2_OFFSET + 5].set_handler_fn(irq13_handler);
        idt_ref[pic::PIC2_OFFSET + 6].set_handler_fn(irq14_handler);
        idt_ref[pic::PIC2_OFFSET + 7].set_handler_fn(irq15_handler);

        (*idt).load_unsafe();
    }

    log::debug!("IDT initialized with {} entries", 256);
}
