// SPDX-License-Identifier: MIT OR Apache-2.0

//! User-space queue management for Xilinx QDMA PCIe DMA engines.
//!
//! A QDMA engine moves data between host memory and the card through up to 2048 queues. Each
//! physical function owns 512 of them, and every queue id names a _queue pair_: one host-to-card
//! (H2C) and one card-to-host (C2H) queue. This crate drives the memory-mapped flavour of those
//! queues:
//!
//! 1. It identifies the engine's configuration BAR and programs its global registers;
//! 2. It allocates descriptor rings and programs queue contexts through the indirect context
//!    interface;
//! 3. It turns user buffers into descriptor chains and hands them to the engine;
//! 4. It watches the rings' writeback status from poller threads and returns finished requests.
//!
//! Everything that touches the operating system is left to a [`DeviceBackend`](backend::DeviceBackend)
//! supplied by the integrator: mapping BARs, locking contiguous memory for rings, and pinning
//! user buffers for transfers. A [`SimulatedDevice`](backends::simulated::SimulatedDevice) backed
//! by plain memory is available under the `test-mocks` feature.
//!
//! ## Queues and requests
//!
//! A queue goes through three states. Adding it allocates its rings and writes its software
//! contexts, starting it allows requests to be submitted, stopping it refuses new requests, and
//! removing it clears its contexts and frees its rings:
//!
//! ```text
//! AVAILABLE --add--> PROGRAMMED --start--> STARTED
//!     ^                |   ^                  |
//!     +-----remove-----+   +-------stop-------+
//! ```
//!
//! Requests are [`DmaRequestContext`](request::DmaRequestContext) values that own their buffer.
//! A submitted request comes back on the device's completion channel once the engine has
//! processed every one of its descriptors, or inside a
//! [`RejectedRequest`](error::RejectedRequest) if it could not be submitted.
//!
//! Example usage:
//!
//! ```no_run
//! use std::time::Duration;
//! use qdma_driver::backend::DeviceBackend;
//! use qdma_driver::config::{DeviceConfig, QueueConfig};
//! use qdma_driver::device::QdmaDevice;
//! use qdma_driver::dma::DmaDirection;
//! use qdma_driver::request::DmaRequestContext;
//!
//! let backend: Box<dyn DeviceBackend> = unimplemented!();
//!
//! let device = QdmaDevice::open(backend, DeviceConfig::default())?;
//!
//! device.add_queue(0, &QueueConfig::default())?;
//! device.start_queue(0)?;
//!
//! let request = DmaRequestContext::new(DmaDirection::H2c, 0, vec![0xAB; 64 * 1024], 0x0);
//! let id = device.submit_mm(request).map_err(|rejected| rejected.error)?;
//!
//! let completion = device.completions().recv_timeout(Duration::from_secs(1)).unwrap();
//! assert_eq!(completion.id, id);
//!
//! device.stop_queue(0)?;
//! device.remove_queue(0)?;
//! device.close();
//! # qdma_driver::error::Result::Ok(())
//! ```
//!
//! ## Register access
//!
//! BARs and DMA memory are both exposed as [`RegisterRegion`](regions::RegisterRegion)s. The
//! configuration BAR is described with [`register_block!`](crate::register_block) and
//! [`register_bit_field!`](crate::register_bit_field), which generate structured accessors, so
//! that a field is read as
//!
//! ```no_run
//! use qdma_driver::regions::BackedBySubregion;
//! use qdma_driver::regions::RegisterRegion;
//! use qdma_driver::registers::QdmaConfigRegisters;
//!
//! let bar: &dyn RegisterRegion = unimplemented!();
//! let registers = QdmaConfigRegisters::backed_by(bar);
//!
//! let queues: u16 = registers.channel_qdma_cap().max_queues().read()?;
//! let mm_h2c: bool = registers.channel_mdma().mm_h2c().read()?;
//! # std::io::Result::Ok(())
//! ```
//!
//! rather than by masking and shifting at hand-computed offsets.
//!
//! ## Events
//!
//! Interrupts and plug-and-play notifications are received by the integrator and handed to
//! [`QdmaDevice::dispatch_interrupt`](device::QdmaDevice::dispatch_interrupt) and
//! [`QdmaDevice::dispatch_pnp_event`](device::QdmaDevice::dispatch_pnp_event), which forward them
//! to the registered [`DeviceEventSink`](events::DeviceEventSink).
//!
//! The crate logs through the [`log`] facade and never installs a logger itself.

/* ---------------------------------------------------------------------------------------------- */

#![cfg_attr(feature = "_unsafe-op-in-unsafe-fn", deny(unsafe_op_in_unsafe_fn))]
#![cfg_attr(not(feature = "_unsafe-op-in-unsafe-fn"), allow(unused_unsafe))]

pub mod backend;
pub mod backends;
pub mod config;
pub mod context;
pub mod device;
pub mod dma;
pub mod error;
pub mod events;
#[cfg(any(test, feature = "test-mocks"))]
pub mod mocks;
pub mod poller;
pub mod queue;
pub mod queue_pair;
pub mod regions;
pub mod registers;
pub mod request;
pub mod ring;
pub mod tracker;

/* ---------------------------------------------------------------------------------------------- */
