//! # Peripheral access crate for the VATICS Leipzig SoC
//!
//! This crate only covers the peripheral DMA (PDMA) controller and the secure system controller
//! register which routes the shared PDMA peripheral pads.
#![no_std]

pub mod pdma;
pub mod sysc;
