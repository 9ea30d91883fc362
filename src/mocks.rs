// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::io;

use mockall::mock;

use crate::regions::Permissions;
use crate::regions::RegisterRegion;
use crate::regions::Sealed as RegionSealed;

pub use crate::events::MockDeviceEventSink;

/* ---------------------------------------------------------------------------------------------- */

mock! {
    /// Since the RegisterRegion trait is sealed and cannot be implemented by users of the crate,
    /// we provide a MockRegisterRegion struct for scripting register reads and checking writes.
    #[derive(Debug)]
    pub RegisterRegion {}

    impl RegisterRegion for RegisterRegion {
        fn len(&self) -> u64;
        fn permissions(&self) -> Permissions;
        fn as_ptr(&self) -> Option<*const u8>;
        fn as_mut_ptr(&self) -> Option<*mut u8>;
        fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> io::Result<()>;
        fn read_u8(&self, offset: u64) -> io::Result<u8>;
        fn write_u8(&self, offset: u64, value: u8) -> io::Result<()>;
        fn read_le_u16(&self, offset: u64) -> io::Result<u16>;
        fn write_le_u16(&self, offset: u64, value: u16) -> io::Result<()>;
        fn read_le_u32(&self, offset: u64) -> io::Result<u32>;
        fn write_le_u32(&self, offset: u64, value: u32) -> io::Result<()>;
        fn read_le_u64(&self, offset: u64) -> io::Result<u64>;
        fn write_le_u64(&self, offset: u64, value: u64) -> io::Result<()>;
    }

    impl RegionSealed for RegisterRegion {}
}

/* ---------------------------------------------------------------------------------------------- */
