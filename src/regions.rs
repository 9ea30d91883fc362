// SPDX-License-Identifier: MIT OR Apache-2.0

//! Register and DMA memory access.
//!
//! Everything the queue layer touches, be it a QDMA BAR, a descriptor ring or a writeback status
//! slot, is reached through a [`RegisterRegion`].
//!
//! ## Base machinery
//!
//! - [`trait RegisterRegion`](RegisterRegion). Sealed.
//!   - `&'a dyn RegisterRegion` implements `AsSubregion<'a>`, for all `'a`.
//!
//! - [`struct Subregion<'a>`](Subregion).
//!   - `Subregion<'a>` implements `RegisterRegion` and `AsSubregion<'a>`, for all `'a`.
//!
//! - [`trait AsSubregion<'a>`](AsSubregion). Unlike `RegisterRegion`, this trait is not sealed.
//!   - If `T` implements `AsSubregion<'a> + Debug + Send + Sync`, then `T` implements
//!     `RegisterRegion`.
//!
//! - [`trait BackedBySubregion<'a>`](BackedBySubregion), implemented by the structured register
//!   types generated by [`register_block!`](crate::register_block) and
//!   [`register_bit_field!`](crate::register_bit_field).
//!
//! ## `RegisterRegion` implementations
//!
//! - [`struct MemoryRegion<'a>`](MemoryRegion). A region backed by a `&'a [u8]`, `&'a mut [u8]`,
//!   or raw memory such as a mapped BAR or a locked DMA buffer. Backends hand these out.

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::Debug;
use std::io::{self, ErrorKind};
use std::marker::PhantomData;
use std::mem;
use std::ops::{Bound, Range, RangeBounds};

pub mod structured;

mod bit_field_macros;
mod struct_macros;

/* ---------------------------------------------------------------------------------------------- */

/// Describes which operations may be performed on some piece of memory or other data region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Permissions {
    /// Only reading is allowed.
    Read,
    /// Only writing is allowed.
    Write,
    /// Both reading and writing are allowed.
    ReadWrite,
}

impl Permissions {
    pub fn new(can_read: bool, can_write: bool) -> Option<Permissions> {
        match (can_read, can_write) {
            (false, false) => None,
            (true, false) => Some(Permissions::Read),
            (false, true) => Some(Permissions::Write),
            (true, true) => Some(Permissions::ReadWrite),
        }
    }

    pub fn can_read(&self) -> bool {
        !matches!(self, Permissions::Write)
    }

    pub fn can_write(&self) -> bool {
        !matches!(self, Permissions::Read)
    }
}

/* ---------------------------------------------------------------------------------------------- */

pub(crate) use private::Sealed;
mod private {
    /// Private supertrait that keeps [`RegisterRegion`](super::RegisterRegion) from being
    /// implemented outside this crate. Backends expose their memory through
    /// [`MemoryRegion`](super::MemoryRegion) instead.
    pub trait Sealed {}
}

/// A BAR, a DMA buffer, or some part of one, that is safe to read and write concurrently with no
/// data races.
///
/// The region does not necessarily have RAM semantics: device registers can change at any time,
/// reads can have side effects, and DMA memory is written by hardware behind our back. All
/// accesses are volatile.
///
/// This trait is _sealed_, and thus cannot be implemented by users of the crate.
#[allow(clippy::len_without_is_empty)]
pub trait RegisterRegion: Debug + Send + Sync + Sealed {
    /// The length of the region in bytes.
    fn len(&self) -> u64;

    /// Whether the region may be read, written, or both.
    fn permissions(&self) -> Permissions;

    /// Returns a `const` pointer to the beginning of the region, if it is mapped into memory.
    fn as_ptr(&self) -> Option<*const u8>;

    /// Returns a `mut` pointer to the beginning of the region, if it is mapped into memory.
    fn as_mut_ptr(&self) -> Option<*mut u8>;

    /// Read from a contiguous range of the region into a byte buffer.
    ///
    /// There is no guarantee that the access will be atomic in any sense.
    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> io::Result<()>;

    /// Read an [`u8`] at the given byte offset.
    fn read_u8(&self, offset: u64) -> io::Result<u8>;

    /// Write an [`u8`] at the given byte offset.
    fn write_u8(&self, offset: u64, value: u8) -> io::Result<()>;

    /// Read a little-endian [`u16`] at the given byte offset.
    ///
    /// This will fail if `offset + 2 > self.len()`, or if `offset` is not 2-byte aligned.
    fn read_le_u16(&self, offset: u64) -> io::Result<u16>;

    /// Write a little-endian [`u16`] at the given byte offset.
    ///
    /// This will fail if `offset + 2 > self.len()`, or if `offset` is not 2-byte aligned.
    fn write_le_u16(&self, offset: u64, value: u16) -> io::Result<()>;

    /// Read a little-endian [`u32`] at the given byte offset.
    ///
    /// This will fail if `offset + 4 > self.len()`, or if `offset` is not 4-byte aligned.
    fn read_le_u32(&self, offset: u64) -> io::Result<u32>;

    /// Write a little-endian [`u32`] at the given byte offset.
    ///
    /// This will fail if `offset + 4 > self.len()`, or if `offset` is not 4-byte aligned.
    fn write_le_u32(&self, offset: u64, value: u32) -> io::Result<()>;

    /// Read a little-endian [`u64`] at the given byte offset.
    ///
    /// This will fail if `offset + 8 > self.len()`, or if `offset` is not 8-byte aligned.
    fn read_le_u64(&self, offset: u64) -> io::Result<u64>;

    /// Write a little-endian [`u64`] at the given byte offset.
    ///
    /// This will fail if `offset + 8 > self.len()`, or if `offset` is not 8-byte aligned.
    fn write_le_u64(&self, offset: u64, value: u64) -> io::Result<()>;
}

/* ---------------------------------------------------------------------------------------------- */

/// A contiguous part of a [`RegisterRegion`], which is itself also a `RegisterRegion`.
///
/// Accesses are redirected to the underlying region, offset by the subregion's offset, and checked
/// against the subregion's end.
///
/// Create instances of this by calling [`AsSubregion::subregion`] on anything that implements it,
/// for instance a [`&dyn RegisterRegion`](RegisterRegion).
#[derive(Clone, Copy, Debug)]
pub struct Subregion<'a> {
    region: &'a dyn RegisterRegion,
    offset: u64,
    length: u64,
}

impl<'a> Subregion<'a> {
    pub fn underlying_region(&self) -> &'a dyn RegisterRegion {
        self.region
    }

    pub fn offset_in_underlying_region(&self) -> u64 {
        self.offset
    }

    fn validate_access(&self, offset: u64, len: usize) -> io::Result<()> {
        let end = offset.checked_add(len as u64);

        match end {
            Some(end) if end <= self.length => Ok(()),
            _ => Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "Access to [{:#x}, {:#x}) falls outside region [0x0, {:#x})",
                    offset,
                    offset.saturating_add(len as u64),
                    self.length
                ),
            )),
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// For when it is possible to obtain a [`Subregion`] representation of a value cheaply.
pub trait AsSubregion<'a> {
    /// Returns a [`Subregion`] corresponding to `self`.
    fn as_subregion(&self) -> Subregion<'a>;

    /// Returns a [`Subregion`] corresponding to a range of `self`.
    fn subregion(&self, range: impl RangeBounds<u64>) -> Subregion<'a> {
        let subregion = Self::as_subregion(self);
        let range = clamp_range(range, subregion.len());

        Subregion {
            region: subregion.underlying_region(),
            offset: subregion.offset_in_underlying_region() + range.start,
            length: range.end - range.start,
        }
    }
}

/// A structured view over some region, such as a register block or a single register.
pub trait BackedBySubregion<'a> {
    fn backed_by(as_subregion: impl AsSubregion<'a>) -> Self;
}

impl<'a, 'b, T> AsSubregion<'a> for &'b T
where
    T: AsSubregion<'a>,
{
    fn as_subregion(&self) -> Subregion<'a> {
        T::as_subregion(*self)
    }
}

impl<'a> AsSubregion<'a> for &'a dyn RegisterRegion {
    fn as_subregion(&self) -> Subregion<'a> {
        Subregion {
            region: *self,
            offset: 0,
            length: RegisterRegion::len(*self),
        }
    }
}

impl<'a> AsSubregion<'a> for Subregion<'a> {
    fn as_subregion(&self) -> Subregion<'a> {
        *self
    }
}

impl<'a, T> Sealed for T where T: AsSubregion<'a> + Debug + Send + Sync {}
impl<'a, T> RegisterRegion for T
where
    T: AsSubregion<'a> + Debug + Send + Sync,
{
    fn len(&self) -> u64 {
        T::as_subregion(self).length
    }

    fn permissions(&self) -> Permissions {
        T::as_subregion(self).region.permissions()
    }

    fn as_ptr(&self) -> Option<*const u8> {
        let subregion = T::as_subregion(self);
        let ptr = subregion.region.as_ptr()?;
        Some(ptr.wrapping_add(subregion.offset as usize))
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        let subregion = T::as_subregion(self);
        let ptr = subregion.region.as_mut_ptr()?;
        Some(ptr.wrapping_add(subregion.offset as usize))
    }

    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, buffer.len())?;
        subregion
            .region
            .read_bytes(subregion.offset + offset, buffer)
    }

    fn read_u8(&self, offset: u64) -> io::Result<u8> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u8>())?;
        subregion.region.read_u8(subregion.offset + offset)
    }

    fn write_u8(&self, offset: u64, value: u8) -> io::Result<()> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u8>())?;
        subregion.region.write_u8(subregion.offset + offset, value)
    }

    fn read_le_u16(&self, offset: u64) -> io::Result<u16> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u16>())?;
        subregion.region.read_le_u16(subregion.offset + offset)
    }

    fn write_le_u16(&self, offset: u64, value: u16) -> io::Result<()> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u16>())?;
        subregion
            .region
            .write_le_u16(subregion.offset + offset, value)
    }

    fn read_le_u32(&self, offset: u64) -> io::Result<u32> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u32>())?;
        subregion.region.read_le_u32(subregion.offset + offset)
    }

    fn write_le_u32(&self, offset: u64, value: u32) -> io::Result<()> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u32>())?;
        subregion
            .region
            .write_le_u32(subregion.offset + offset, value)
    }

    fn read_le_u64(&self, offset: u64) -> io::Result<u64> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u64>())?;
        subregion.region.read_le_u64(subregion.offset + offset)
    }

    fn write_le_u64(&self, offset: u64, value: u64) -> io::Result<()> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u64>())?;
        subregion
            .region
            .write_le_u64(subregion.offset + offset, value)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A [`RegisterRegion`] over plain process memory: a mapped BAR, a locked DMA buffer, or an
/// ordinary byte slice standing in for either.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion<'a> {
    ptr: *mut u8,
    length: usize,
    permissions: Permissions,
    phantom: PhantomData<&'a ()>,
}

unsafe impl Send for MemoryRegion<'_> {}
unsafe impl Sync for MemoryRegion<'_> {}

impl MemoryRegion<'_> {
    pub fn new(data: &[u8]) -> MemoryRegion {
        MemoryRegion {
            ptr: data.as_ptr() as *mut _,
            length: data.len(),
            permissions: Permissions::Read,
            phantom: PhantomData,
        }
    }

    pub fn new_mut(data: &mut [u8]) -> MemoryRegion {
        MemoryRegion {
            ptr: data.as_mut_ptr(),
            length: data.len(),
            permissions: Permissions::ReadWrite,
            phantom: PhantomData,
        }
    }

    /// # Safety
    ///
    /// `data` must be valid for `length` bytes for as long as the returned `MemoryRegion` (or any
    /// copy of it) is used.
    pub unsafe fn new_raw<'a>(
        data: *mut u8,
        length: usize,
        permissions: Permissions,
    ) -> MemoryRegion<'a> {
        MemoryRegion {
            ptr: data,
            length,
            permissions,
            phantom: PhantomData,
        }
    }

    fn get_ptr<T>(&self, offset: u64) -> io::Result<*mut T> {
        let size = mem::size_of::<T>() as u64;

        match offset.checked_add(size) {
            Some(end) if end <= self.length as u64 => {}
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!(
                        "Access at {:#x} falls outside memory region of {:#x} bytes",
                        offset, self.length
                    ),
                ))
            }
        }

        let ptr = self.ptr.wrapping_add(offset as usize);

        if ptr as usize % mem::align_of::<T>() != 0 {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("Unaligned {}-byte access at {:#x}", size, offset),
            ));
        }

        Ok(ptr.cast::<T>())
    }

    fn check_writeable(&self) -> io::Result<()> {
        if self.permissions.can_write() {
            Ok(())
        } else {
            Err(io::Error::new(
                ErrorKind::PermissionDenied,
                "Memory region is read-only",
            ))
        }
    }
}

impl Sealed for MemoryRegion<'_> {}
impl RegisterRegion for MemoryRegion<'_> {
    fn len(&self) -> u64 {
        self.length as u64
    }

    fn permissions(&self) -> Permissions {
        self.permissions
    }

    fn as_ptr(&self) -> Option<*const u8> {
        Some(self.ptr)
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        if self.permissions.can_write() {
            Some(self.ptr)
        } else {
            None
        }
    }

    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        for (off, byte) in (offset..).zip(buffer) {
            *byte = unsafe { self.get_ptr::<u8>(off)?.read_volatile() };
        }

        Ok(())
    }

    fn read_u8(&self, offset: u64) -> io::Result<u8> {
        let v = unsafe { self.get_ptr::<u8>(offset)?.read_volatile() };
        Ok(v)
    }

    fn write_u8(&self, offset: u64, value: u8) -> io::Result<()> {
        self.check_writeable()?;
        unsafe { self.get_ptr::<u8>(offset)?.write_volatile(value) };
        Ok(())
    }

    fn read_le_u16(&self, offset: u64) -> io::Result<u16> {
        let v = unsafe { self.get_ptr::<u16>(offset)?.read_volatile() };
        Ok(u16::from_le(v))
    }

    fn write_le_u16(&self, offset: u64, value: u16) -> io::Result<()> {
        self.check_writeable()?;
        unsafe { self.get_ptr::<u16>(offset)?.write_volatile(value.to_le()) };
        Ok(())
    }

    fn read_le_u32(&self, offset: u64) -> io::Result<u32> {
        let v = unsafe { self.get_ptr::<u32>(offset)?.read_volatile() };
        Ok(u32::from_le(v))
    }

    fn write_le_u32(&self, offset: u64, value: u32) -> io::Result<()> {
        self.check_writeable()?;
        unsafe { self.get_ptr::<u32>(offset)?.write_volatile(value.to_le()) };
        Ok(())
    }

    fn read_le_u64(&self, offset: u64) -> io::Result<u64> {
        let v = unsafe { self.get_ptr::<u64>(offset)?.read_volatile() };
        Ok(u64::from_le(v))
    }

    fn write_le_u64(&self, offset: u64, value: u64) -> io::Result<()> {
        self.check_writeable()?;
        unsafe { self.get_ptr::<u64>(offset)?.write_volatile(value.to_le()) };
        Ok(())
    }
}

impl<'a> AsSubregion<'a> for &'a MemoryRegion<'_> {
    fn as_subregion(&self) -> Subregion<'a> {
        let region: &dyn RegisterRegion = *self;
        <&dyn RegisterRegion>::as_subregion(&region)
    }
}

/* ---------------------------------------------------------------------------------------------- */

fn clamp_range(range: impl RangeBounds<u64>, max_length: u64) -> Range<u64> {
    let start = match range.start_bound() {
        Bound::Included(&b) => b,
        Bound::Excluded(&b) => b + 1,
        Bound::Unbounded => 0,
    };

    let end = match range.end_bound() {
        Bound::Included(&b) => b + 1,
        Bound::Excluded(&b) => b,
        Bound::Unbounded => max_length,
    };

    Range {
        start: start.min(max_length),
        end: end.max(start).min(max_length),
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
