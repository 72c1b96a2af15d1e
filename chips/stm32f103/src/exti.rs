//! External interrupt controller (EXTI) with shared-vector
//! demultiplexing.
//!
//! Lines 0-4 each have a dedicated NVIC vector. Lines 5-9 share EXTI9_5
//! and lines 10-15 share EXTI15_10; each shared group keeps an atomic
//! enable mask so the physical vector is enabled exactly while at least
//! one of its lines is. The mask is the only EXTI state mutated from both
//! interrupt and thread context.

use core::sync::atomic::{AtomicU32, Ordering};

use kernel::utilities::cells::OptionalCell;
use kernel::utilities::registers::interfaces::{Readable, Writeable};
use kernel::utilities::registers::ReadWrite;
use kernel::utilities::StaticRef;

use crate::nvic::{self, Nvic};

/// External interrupt/event controller
#[repr(C)]
pub struct ExtiRegisters {
    /// interrupt mask register
    imr: ReadWrite<u32>,
    /// event mask register
    emr: ReadWrite<u32>,
    /// rising trigger selection register
    rtsr: ReadWrite<u32>,
    /// falling trigger selection register
    ftsr: ReadWrite<u32>,
    /// software interrupt event register
    swier: ReadWrite<u32>,
    /// pending register, write 1 to clear
    pr: ReadWrite<u32>,
}

pub const EXTI_BASE: StaticRef<ExtiRegisters> =
    unsafe { StaticRef::new(0x4001_0400 as *const ExtiRegisters) };

/// The GPIO-capable external interrupt lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineId {
    Exti0 = 0,
    Exti1 = 1,
    Exti2 = 2,
    Exti3 = 3,
    Exti4 = 4,
    Exti5 = 5,
    Exti6 = 6,
    Exti7 = 7,
    Exti8 = 8,
    Exti9 = 9,
    Exti10 = 10,
    Exti11 = 11,
    Exti12 = 12,
    Exti13 = 13,
    Exti14 = 14,
    Exti15 = 15,
}

const LINES: [LineId; 16] = [
    LineId::Exti0,
    LineId::Exti1,
    LineId::Exti2,
    LineId::Exti3,
    LineId::Exti4,
    LineId::Exti5,
    LineId::Exti6,
    LineId::Exti7,
    LineId::Exti8,
    LineId::Exti9,
    LineId::Exti10,
    LineId::Exti11,
    LineId::Exti12,
    LineId::Exti13,
    LineId::Exti14,
    LineId::Exti15,
];

// Shared-group geometry: EXTI9_5 fans out lines 5..=9, EXTI15_10 fans out
// lines 10..=15.
const EXTI9_5_FIRST: usize = 5;
const EXTI9_5_COUNT: usize = 5;
const EXTI15_10_FIRST: usize = 10;
const EXTI15_10_COUNT: usize = 6;

pub trait ExtiClient {
    fn fired(&self, line: LineId);
}

pub struct Exti<'a> {
    registers: StaticRef<ExtiRegisters>,
    nvic: &'a Nvic,
    clients: [OptionalCell<&'a dyn ExtiClient>; 16],
    exti9_5_mask: AtomicU32,
    exti15_10_mask: AtomicU32,
}

impl<'a> Exti<'a> {
    pub fn new(registers: StaticRef<ExtiRegisters>, nvic: &'a Nvic) -> Exti<'a> {
        Exti {
            registers,
            nvic,
            clients: core::array::from_fn(|_| OptionalCell::empty()),
            exti9_5_mask: AtomicU32::new(0),
            exti15_10_mask: AtomicU32::new(0),
        }
    }

    pub fn set_line_client(&self, line: LineId, client: &'a dyn ExtiClient) {
        self.clients[line as usize].set(client);
    }

    pub fn clear_line_client(&self, line: LineId) {
        self.clients[line as usize].clear();
    }

    pub fn select_rising_trigger(&self, line: LineId) {
        let regs = &*self.registers;
        regs.rtsr.set(regs.rtsr.get() | (1 << line as usize));
    }

    pub fn select_falling_trigger(&self, line: LineId) {
        let regs = &*self.registers;
        regs.ftsr.set(regs.ftsr.get() | (1 << line as usize));
    }

    pub fn is_pending(&self, line: LineId) -> bool {
        self.registers.pr.get() & (1 << line as usize) != 0
    }

    pub fn clear_pending(&self, line: LineId) {
        self.registers.pr.set(1 << line as usize);
    }

    pub fn is_line_enabled(&self, line: LineId) -> bool {
        self.registers.imr.get() & (1 << line as usize) != 0
    }

    /// Unmask `line` and make sure its vector is live.
    ///
    /// For a shared line this sets the line's bit in the group mask; the
    /// physical vector is enabled on the mask's 0 -> non-zero transition.
    pub fn enable_line(&self, line: LineId) {
        let regs = &*self.registers;
        let n = line as usize;
        regs.imr.set(regs.imr.get() | (1 << n));

        match self.shared_group(n) {
            Some((mask, first, _, irq)) => {
                let prev = mask.fetch_or(1 << (n - first), Ordering::AcqRel);
                if prev == 0 {
                    self.nvic.enable(irq);
                }
            }
            None => self.nvic.enable(nvic::EXTI0 + n as u32),
        }
    }

    /// Mask `line`; the shared vector is disabled once its whole group is
    /// masked.
    pub fn disable_line(&self, line: LineId) {
        let regs = &*self.registers;
        let n = line as usize;
        regs.imr.set(regs.imr.get() & !(1 << n));

        match self.shared_group(n) {
            Some((mask, first, _, irq)) => {
                let bit = 1 << (n - first);
                let prev = mask.fetch_and(!bit, Ordering::AcqRel);
                if prev & !bit == 0 {
                    self.nvic.disable(irq);
                }
            }
            None => self.nvic.disable(nvic::EXTI0 + n as u32),
        }
    }

    fn shared_group(&self, n: usize) -> Option<(&AtomicU32, usize, usize, u32)> {
        if (EXTI9_5_FIRST..EXTI9_5_FIRST + EXTI9_5_COUNT).contains(&n) {
            Some((&self.exti9_5_mask, EXTI9_5_FIRST, EXTI9_5_COUNT, nvic::EXTI9_5))
        } else if (EXTI15_10_FIRST..EXTI15_10_FIRST + EXTI15_10_COUNT).contains(&n) {
            Some((
                &self.exti15_10_mask,
                EXTI15_10_FIRST,
                EXTI15_10_COUNT,
                nvic::EXTI15_10,
            ))
        } else {
            None
        }
    }

    /// Body of a dedicated line 0-4 vector.
    pub fn handle_line_interrupt(&self, line: LineId) {
        self.clear_pending(line);
        self.clients[line as usize].map(|client| client.fired(line));
    }

    /// Body of the EXTI9_5 vector.
    pub fn handle_exti9_5_interrupt(&self) {
        self.dispatch(&self.exti9_5_mask, EXTI9_5_FIRST, EXTI9_5_COUNT);
    }

    /// Body of the EXTI15_10 vector.
    pub fn handle_exti15_10_interrupt(&self) {
        self.dispatch(&self.exti15_10_mask, EXTI15_10_FIRST, EXTI15_10_COUNT);
    }

    // Invokes every enabled source of the group in ascending line order.
    // The mask snapshot pairs with the AcqRel updates in
    // enable_line/disable_line: a concurrent enable is either fully
    // visible here or fully absent, never torn.
    fn dispatch(&self, mask: &AtomicU32, first: usize, count: usize) {
        let enabled = mask.load(Ordering::Acquire);
        for i in 0..count {
            if enabled & (1 << i) != 0 {
                let line = LINES[first + i];
                self.clear_pending(line);
                self.clients[first + i].map(|client| client.fired(line));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::cell::RefCell;
    use std::vec::Vec;

    struct Recorder {
        log: RefCell<Vec<LineId>>,
    }

    impl Recorder {
        fn new() -> Recorder {
            Recorder {
                log: RefCell::new(Vec::new()),
            }
        }
    }

    impl ExtiClient for Recorder {
        fn fired(&self, line: LineId) {
            self.log.borrow_mut().push(line);
        }
    }

    fn fake_exti() -> &'static Exti<'static> {
        let registers = unsafe {
            StaticRef::new(Box::leak(Box::new(core::mem::zeroed::<ExtiRegisters>())) as *const _)
        };
        let nvic_registers = unsafe {
            StaticRef::new(
                Box::leak(Box::new(core::mem::zeroed::<crate::nvic::NvicRegisters>())) as *const _,
            )
        };
        let nvic = Box::leak(Box::new(Nvic::new(nvic_registers)));
        Box::leak(Box::new(Exti::new(registers, nvic)))
    }

    #[test]
    fn shared_dispatch_hits_enabled_slots_in_ascending_order() {
        let exti = fake_exti();
        let recorder = Box::leak(Box::new(Recorder::new()));

        // Register clients on every line of the 9_5 group, in scrambled
        // order, but enable only group slots 2 and 4 (lines 7 and 9).
        for line in [LineId::Exti9, LineId::Exti5, LineId::Exti7, LineId::Exti6, LineId::Exti8] {
            exti.set_line_client(line, recorder);
        }
        exti.enable_line(LineId::Exti9);
        exti.enable_line(LineId::Exti7);

        exti.handle_exti9_5_interrupt();
        assert_eq!(*recorder.log.borrow(), [LineId::Exti7, LineId::Exti9]);
    }

    #[test]
    fn shared_vector_tracks_group_mask() {
        let exti = fake_exti();
        exti.enable_line(LineId::Exti12);
        exti.enable_line(LineId::Exti14);
        assert!(exti.is_line_enabled(LineId::Exti12));

        exti.disable_line(LineId::Exti12);
        // One line still enabled: dispatch must keep skipping line 12 but
        // still reach line 14.
        let recorder = Box::leak(Box::new(Recorder::new()));
        exti.set_line_client(LineId::Exti12, recorder);
        exti.set_line_client(LineId::Exti14, recorder);
        exti.handle_exti15_10_interrupt();
        assert_eq!(*recorder.log.borrow(), [LineId::Exti14]);
    }

    #[test]
    fn dedicated_line_dispatch() {
        let exti = fake_exti();
        let recorder = Box::leak(Box::new(Recorder::new()));
        exti.set_line_client(LineId::Exti2, recorder);
        exti.enable_line(LineId::Exti2);
        exti.handle_line_interrupt(LineId::Exti2);
        assert_eq!(*recorder.log.borrow(), [LineId::Exti2]);
    }
}
