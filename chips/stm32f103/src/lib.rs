//! Peripheral implementations for the STM32F103 MCU.
//!
//! STM32F103 is a Cortex-M3 microcontroller with a channel-based DMA
//! controller, three USARTs with idle-line detection, and 16 external
//! interrupt lines multiplexed onto 7 NVIC vectors.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod chip;
pub mod dma;
pub mod exti;
pub mod gpio;
pub mod nvic;
pub mod rcc;
pub mod systick;
pub mod usart;
