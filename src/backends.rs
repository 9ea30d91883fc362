// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`DeviceBackend`](crate::backend::DeviceBackend) implementations shipped with the crate.
//!
//! Production backends are supplied by the integrator. The simulated device lets queue and
//! request handling be exercised without hardware, and is available under the `test-mocks`
//! feature.

/* ---------------------------------------------------------------------------------------------- */

#[cfg(any(test, feature = "test-mocks"))]
pub mod simulated;

/* ---------------------------------------------------------------------------------------------- */
