//! Chip-level peripheral container and interrupt dispatch.

use kernel::platform::chip::InterruptService;

use crate::dma;
use crate::exti;
use crate::gpio;
use crate::nvic::{self, Nvic};
use crate::rcc;
use crate::systick::SysTick;
use crate::usart;

/// Interrupt priority given to the peripherals this crate services.
const DEFAULT_IRQ_PRIORITY: u32 = 2;

pub struct Stm32f103DefaultPeripherals<'a> {
    pub exti: exti::Exti<'a>,
    pub dma_channels: [dma::Channel<'a>; 7],
    pub usart1: usart::Usart<'a>,
    pub usart2: usart::Usart<'a>,
    pub usart3: usart::Usart<'a>,
    pub gpioa: gpio::Port<'a>,
    pub gpiob: gpio::Port<'a>,
    pub gpioc: gpio::Port<'a>,
    nvic: &'a Nvic,
}

impl<'a> Stm32f103DefaultPeripherals<'a> {
    pub fn new(rcc: &'a rcc::Rcc, nvic: &'a Nvic, tick: &'a SysTick) -> Self {
        Self {
            exti: exti::Exti::new(exti::EXTI_BASE, nvic),
            dma_channels: [
                dma::Channel::new(dma::DMA1_BASE, dma::ChannelId::Channel1, rcc),
                dma::Channel::new(dma::DMA1_BASE, dma::ChannelId::Channel2, rcc),
                dma::Channel::new(dma::DMA1_BASE, dma::ChannelId::Channel3, rcc),
                dma::Channel::new(dma::DMA1_BASE, dma::ChannelId::Channel4, rcc),
                dma::Channel::new(dma::DMA1_BASE, dma::ChannelId::Channel5, rcc),
                dma::Channel::new(dma::DMA1_BASE, dma::ChannelId::Channel6, rcc),
                dma::Channel::new(dma::DMA1_BASE, dma::ChannelId::Channel7, rcc),
            ],
            usart1: usart::Usart::new_usart1(rcc, tick),
            usart2: usart::Usart::new_usart2(rcc, tick),
            usart3: usart::Usart::new_usart3(rcc, tick),
            gpioa: gpio::Port::new(gpio::PortId::A, rcc),
            gpiob: gpio::Port::new(gpio::PortId::B, rcc),
            gpioc: gpio::Port::new(gpio::PortId::C, rcc),
            nvic,
        }
    }

    /// Unmask the vectors this container services. EXTI vectors are
    /// managed per line by [`exti::Exti`].
    pub fn setup_interrupts(&self) {
        for vector in [
            nvic::DMA1_CHANNEL1,
            nvic::DMA1_CHANNEL2,
            nvic::DMA1_CHANNEL3,
            nvic::DMA1_CHANNEL4,
            nvic::DMA1_CHANNEL5,
            nvic::DMA1_CHANNEL6,
            nvic::DMA1_CHANNEL7,
            nvic::USART1,
            nvic::USART2,
            nvic::USART3,
        ] {
            self.nvic.set_priority(vector, DEFAULT_IRQ_PRIORITY);
            self.nvic.enable(vector);
        }
    }
}

impl InterruptService for Stm32f103DefaultPeripherals<'_> {
    unsafe fn service_interrupt(&self, interrupt: u32) -> bool {
        match interrupt {
            nvic::DMA1_CHANNEL1..=nvic::DMA1_CHANNEL7 => {
                self.dma_channels[(interrupt - nvic::DMA1_CHANNEL1) as usize].handle_interrupt();
            }
            nvic::USART1 => self.usart1.handle_interrupt(),
            nvic::USART2 => self.usart2.handle_interrupt(),
            nvic::USART3 => self.usart3.handle_interrupt(),
            nvic::EXTI0 => self.exti.handle_line_interrupt(exti::LineId::Exti0),
            nvic::EXTI1 => self.exti.handle_line_interrupt(exti::LineId::Exti1),
            nvic::EXTI2 => self.exti.handle_line_interrupt(exti::LineId::Exti2),
            nvic::EXTI3 => self.exti.handle_line_interrupt(exti::LineId::Exti3),
            nvic::EXTI4 => self.exti.handle_line_interrupt(exti::LineId::Exti4),
            nvic::EXTI9_5 => self.exti.handle_exti9_5_interrupt(),
            nvic::EXTI15_10 => self.exti.handle_exti15_10_interrupt(),
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::utilities::StaticRef;
    use std::boxed::Box;

    #[test]
    fn unknown_vectors_are_refused() {
        let rcc = Box::leak(Box::new(rcc::Rcc::new(unsafe {
            StaticRef::new(
                Box::leak(Box::new(core::mem::zeroed::<rcc::RccRegisters>())) as *const _,
            )
        })));
        let nvic = Box::leak(Box::new(Nvic::new(unsafe {
            StaticRef::new(
                Box::leak(Box::new(core::mem::zeroed::<crate::nvic::NvicRegisters>())) as *const _,
            )
        })));
        let tick = Box::leak(Box::new(SysTick::new(unsafe {
            StaticRef::new(Box::leak(Box::new(core::mem::zeroed::<
                crate::systick::SysTickRegisters,
            >())) as *const _)
        })));
        let peripherals = Stm32f103DefaultPeripherals::new(rcc, nvic, tick);
        // Vectors this container does not own must be reported unhandled
        // so a board can layer its own service on top.
        unsafe {
            assert!(!peripherals.service_interrupt(nvic::ADC1_2));
            assert!(!peripherals.service_interrupt(nvic::TIM2));
            assert!(!peripherals.service_interrupt(200));
        }
    }
}
