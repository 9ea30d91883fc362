// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interrupt and plug-and-play event delivery.
//!
//! The crate does not wait on interrupts itself. Whatever receives them (the backend, an eventfd
//! loop, a kernel driver callback) hands them to
//! [`QdmaDevice::dispatch_interrupt`](crate::device::QdmaDevice::dispatch_interrupt), which passes
//! them on to the registered [`DeviceEventSink`]. Acknowledging the interrupt at the device is up
//! to the sink.

/* ---------------------------------------------------------------------------------------------- */

use std::fmt;

/* ---------------------------------------------------------------------------------------------- */

/// Interrupt mechanism an interrupt arrived through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InterruptKind {
    Intx,
    Msi,
    MsiX,
}

impl fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InterruptKind::Intx => "INTx",
            InterruptKind::Msi => "MSI",
            InterruptKind::MsiX => "MSI-X",
        })
    }
}

/// What the integrator knows about one delivered interrupt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InterruptResult {
    /// Interrupts received so far.
    pub counter: u32,
    /// Interrupts missed since the previous delivery.
    pub lost: u32,
    pub kind: InterruptKind,
    /// Message data of the last MSI or MSI-X message.
    pub last_message: u32,
    pub dma_status: u32,
    pub int_status: u32,
}

/// Device power states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DevicePowerState {
    D0,
    D1,
    D2,
    D3,
}

/// A plug-and-play or power management event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PnpAction {
    Insert,
    Remove,
    PowerChanged(DevicePowerState),
}

/// Receives events dispatched by a [`QdmaDevice`](crate::device::QdmaDevice).
///
/// Methods are called on whatever thread dispatched the event.
#[cfg_attr(any(test, feature = "test-mocks"), mockall::automock)]
pub trait DeviceEventSink: Send + Sync {
    fn on_interrupt(&self, result: &InterruptResult);

    fn on_pnp_event(&self, action: PnpAction);
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_sink_receives_events() {
        let mut sink = MockDeviceEventSink::new();
        sink.expect_on_pnp_event()
            .withf(|action| *action == PnpAction::PowerChanged(DevicePowerState::D3))
            .times(1)
            .return_const(());
        sink.expect_on_interrupt()
            .withf(|result| result.kind == InterruptKind::MsiX && result.counter == 2)
            .times(1)
            .return_const(());

        let sink: Box<dyn DeviceEventSink> = Box::new(sink);
        sink.on_pnp_event(PnpAction::PowerChanged(DevicePowerState::D3));
        sink.on_interrupt(&InterruptResult {
            counter: 2,
            lost: 0,
            kind: InterruptKind::MsiX,
            last_message: 0,
            dma_status: 0,
            int_status: 0,
        });

        assert_eq!(InterruptKind::MsiX.to_string(), "MSI-X");
    }
}

/* ---------------------------------------------------------------------------------------------- */
