//! Hardware descriptor formats for Intel 10GbE (82599-family) queues,
//! as used by the virtual function driver.

#![cfg_attr(not(test), no_std)]

extern crate bit_field;
extern crate volatile;
extern crate nic_hal;
#[macro_use] extern crate static_assertions;

pub mod descriptors;
