//! # HAL for the VATICS Leipzig peripheral DMA controller
//!
//! This crate contains the **H**ardware **A**bstraction **L**ayer (HAL) for the peripheral DMA
//! (PDMA) controller, built on top of the [leipzig] peripheral access crate.
//!
//! The descriptor ring engine in [pdma] is host-agnostic: it only talks to the hardware through
//! the [pdma::ChannelRegisters] and [pdma::DmaMemory] capabilities and an
//! [embedded_hal::delay::DelayNs] implementation, so the same engine serves a bare-metal
//! firmware, a boot loader and an interrupt-driven executor.
#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod pdma;
pub mod time;
