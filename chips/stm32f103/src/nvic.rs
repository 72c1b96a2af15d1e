//! Nested vectored interrupt controller: vector numbers for this chip and
//! enable/pending/priority control.

use kernel::utilities::registers::interfaces::{Readable, Writeable};
use kernel::utilities::registers::{ReadOnly, ReadWrite};
use kernel::utilities::StaticRef;

pub const WWDG: u32 = 0;
pub const PVD: u32 = 1;
pub const TAMPER: u32 = 2;
pub const RTC: u32 = 3;
pub const FLASH: u32 = 4;
pub const RCC: u32 = 5;
pub const EXTI0: u32 = 6;
pub const EXTI1: u32 = 7;
pub const EXTI2: u32 = 8;
pub const EXTI3: u32 = 9;
pub const EXTI4: u32 = 10;
pub const DMA1_CHANNEL1: u32 = 11;
pub const DMA1_CHANNEL2: u32 = 12;
pub const DMA1_CHANNEL3: u32 = 13;
pub const DMA1_CHANNEL4: u32 = 14;
pub const DMA1_CHANNEL5: u32 = 15;
pub const DMA1_CHANNEL6: u32 = 16;
pub const DMA1_CHANNEL7: u32 = 17;
pub const ADC1_2: u32 = 18;
pub const USB_HP_CAN_TX: u32 = 19;
pub const USB_LP_CAN_RX0: u32 = 20;
pub const CAN_RX1: u32 = 21;
pub const CAN_SCE: u32 = 22;
pub const EXTI9_5: u32 = 23;
pub const TIM1_BRK: u32 = 24;
pub const TIM1_UP: u32 = 25;
pub const TIM1_TRG_COM: u32 = 26;
pub const TIM1_CC: u32 = 27;
pub const TIM2: u32 = 28;
pub const TIM3: u32 = 29;
pub const TIM4: u32 = 30;
pub const I2C1_EV: u32 = 31;
pub const I2C1_ER: u32 = 32;
pub const I2C2_EV: u32 = 33;
pub const I2C2_ER: u32 = 34;
pub const SPI1: u32 = 35;
pub const SPI2: u32 = 36;
pub const USART1: u32 = 37;
pub const USART2: u32 = 38;
pub const USART3: u32 = 39;
pub const EXTI15_10: u32 = 40;
pub const RTC_ALARM: u32 = 41;
pub const USB_WAKEUP: u32 = 42;

/// Lowest-urgency priority level the M3 implements (16 levels, 0 is most
/// urgent).
pub const MAX_PRIORITY: u32 = 15;

#[repr(C)]
pub struct NvicRegisters {
    /// interrupt set-enable
    iser: [ReadWrite<u32>; 8],
    _reserved0: [u32; 24],
    /// interrupt clear-enable
    icer: [ReadWrite<u32>; 8],
    _reserved1: [u32; 24],
    /// interrupt set-pending
    ispr: [ReadWrite<u32>; 8],
    _reserved2: [u32; 24],
    /// interrupt clear-pending
    icpr: [ReadWrite<u32>; 8],
    _reserved3: [u32; 24],
    /// interrupt active bit
    iabr: [ReadOnly<u32>; 8],
    _reserved4: [u32; 56],
    /// interrupt priority, one byte per vector
    ipr: [ReadWrite<u8>; 240],
}

pub const NVIC_BASE: StaticRef<NvicRegisters> =
    unsafe { StaticRef::new(0xE000_E100 as *const NvicRegisters) };

pub struct Nvic {
    registers: StaticRef<NvicRegisters>,
}

impl Nvic {
    pub const fn new(registers: StaticRef<NvicRegisters>) -> Nvic {
        Nvic { registers }
    }

    pub fn enable(&self, interrupt: u32) {
        self.registers.iser[(interrupt / 32) as usize].set(1 << (interrupt % 32));
    }

    pub fn disable(&self, interrupt: u32) {
        self.registers.icer[(interrupt / 32) as usize].set(1 << (interrupt % 32));
    }

    pub fn is_enabled(&self, interrupt: u32) -> bool {
        self.registers.iser[(interrupt / 32) as usize].get() & (1 << (interrupt % 32)) != 0
    }

    pub fn clear_pending(&self, interrupt: u32) {
        self.registers.icpr[(interrupt / 32) as usize].set(1 << (interrupt % 32));
    }

    pub fn is_pending(&self, interrupt: u32) -> bool {
        self.registers.ispr[(interrupt / 32) as usize].get() & (1 << (interrupt % 32)) != 0
    }

    /// Set the vector's priority, clamped to the implemented range.
    ///
    /// Only the top nibble of each priority byte is wired on this core.
    pub fn set_priority(&self, interrupt: u32, priority: u32) {
        let priority = priority.min(MAX_PRIORITY);
        self.registers.ipr[interrupt as usize].set((priority << 4) as u8);
    }

    pub fn get_priority(&self, interrupt: u32) -> u32 {
        (self.registers.ipr[interrupt as usize].get() >> 4) as u32
    }
}
