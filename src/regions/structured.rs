// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed views over single registers, bit fields, and the bits inside them.

/* ---------------------------------------------------------------------------------------------- */

use num_traits::{PrimInt, Unsigned};
use std::convert::TryInto;
use std::fmt::{self, Binary, Debug, LowerHex, UpperHex};
use std::io::{self, ErrorKind};
use std::marker::PhantomData;

use crate::regions::{AsSubregion, BackedBySubregion, RegisterRegion};

/* ---------------------------------------------------------------------------------------------- */

use private::Sealed;
mod private {
    pub trait Sealed {}
}

/// Trait for types that represent the value of a register or register field.
///
/// This is implemented for [`u8`], [`u16`], [`u32`], and [`u64`].
///
/// This trait is _sealed_, and thus cannot be implemented by users of the crate.
pub trait RegisterValue:
    PrimInt + Unsigned + Debug + LowerHex + UpperHex + Binary + Send + Sync + Sealed
{
    /// Delegates to the [`RegisterRegion`] accessor of matching width.
    fn read(region: &dyn RegisterRegion, offset: u64) -> io::Result<Self>;

    /// Delegates to the [`RegisterRegion`] accessor of matching width.
    fn write(self, region: &dyn RegisterRegion, offset: u64) -> io::Result<()>;
}

impl Sealed for u8 {}
impl RegisterValue for u8 {
    fn read(region: &dyn RegisterRegion, offset: u64) -> io::Result<Self> {
        region.read_u8(offset)
    }

    fn write(self, region: &dyn RegisterRegion, offset: u64) -> io::Result<()> {
        region.write_u8(offset, self)
    }
}

impl Sealed for u16 {}
impl RegisterValue for u16 {
    fn read(region: &dyn RegisterRegion, offset: u64) -> io::Result<Self> {
        region.read_le_u16(offset)
    }

    fn write(self, region: &dyn RegisterRegion, offset: u64) -> io::Result<()> {
        region.write_le_u16(offset, self)
    }
}

impl Sealed for u32 {}
impl RegisterValue for u32 {
    fn read(region: &dyn RegisterRegion, offset: u64) -> io::Result<Self> {
        region.read_le_u32(offset)
    }

    fn write(self, region: &dyn RegisterRegion, offset: u64) -> io::Result<()> {
        region.write_le_u32(offset, self)
    }
}

impl Sealed for u64 {}
impl RegisterValue for u64 {
    fn read(region: &dyn RegisterRegion, offset: u64) -> io::Result<Self> {
        region.read_le_u64(offset)
    }

    fn write(self, region: &dyn RegisterRegion, offset: u64) -> io::Result<()> {
        region.write_le_u64(offset, self)
    }
}

/// Extracts the field selected by `mask` from `value`, shifted down to bit 0.
pub fn field_get<T: RegisterValue>(mask: T, value: T) -> T {
    (value & mask) >> mask.trailing_zeros() as usize
}

/// Shifts `value` into the field selected by `mask`. Bits that don't fit are discarded.
pub fn field_set<T: RegisterValue>(mask: T, value: T) -> T {
    (value << mask.trailing_zeros() as usize) & mask
}

fn narrow<T, U>(value: T) -> io::Result<U>
where
    T: RegisterValue + TryInto<U>,
    T::Error: Debug,
{
    value.try_into().map_err(|e| {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("Field value {:#x} does not fit: {:?}", value, e),
        )
    })
}

fn print_debug_hex<T: Debug + LowerHex>(
    value: io::Result<T>,
    f: &mut fmt::Formatter,
) -> fmt::Result {
    if let Ok(v) = value {
        write!(f, "Ok({:#x})", v)
    } else {
        Debug::fmt(&value, f)
    }
}

fn print_debug_bool(value: io::Result<bool>, f: &mut fmt::Formatter) -> fmt::Result {
    if let Ok(v) = value {
        write!(f, "Ok({})", v)
    } else {
        Debug::fmt(&value, f)
    }
}

/* ---------------------------------------------------------------------------------------------- */

// READ-ONLY REGISTERS

/// A register that is read-only.
#[derive(Clone, Copy)]
pub struct RegisterRo<'a, T: RegisterValue> {
    region: &'a dyn RegisterRegion,
    offset: u64,
    phantom: PhantomData<T>,
}

impl<'a, T: RegisterValue> RegisterRo<'a, T> {
    pub fn read(&self) -> io::Result<T> {
        T::read(self.region, self.offset)
    }
}

impl<'a, T: RegisterValue> BackedBySubregion<'a> for RegisterRo<'a, T> {
    fn backed_by(as_subregion: impl AsSubregion<'a>) -> Self {
        let subregion = as_subregion.as_subregion();
        RegisterRo {
            region: subregion.underlying_region(),
            offset: subregion.offset_in_underlying_region(),
            phantom: PhantomData,
        }
    }
}

impl<T: RegisterValue> Debug for RegisterRo<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        print_debug_hex(self.read(), f)
    }
}

// READ-WRITE REGISTERS

/// A register that is read-write.
#[derive(Clone, Copy)]
pub struct RegisterRw<'a, T: RegisterValue> {
    region: &'a dyn RegisterRegion,
    offset: u64,
    phantom: PhantomData<T>,
}

impl<'a, T: RegisterValue> RegisterRw<'a, T> {
    pub fn read(&self) -> io::Result<T> {
        T::read(self.region, self.offset)
    }

    pub fn write(&self, value: T) -> io::Result<()> {
        value.write(self.region, self.offset)
    }
}

impl<'a, T: RegisterValue> BackedBySubregion<'a> for RegisterRw<'a, T> {
    fn backed_by(as_subregion: impl AsSubregion<'a>) -> Self {
        let subregion = as_subregion.as_subregion();
        RegisterRw {
            region: subregion.underlying_region(),
            offset: subregion.offset_in_underlying_region(),
            phantom: PhantomData,
        }
    }
}

impl<T: RegisterValue> Debug for RegisterRw<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        print_debug_hex(self.read(), f)
    }
}

/* ---------------------------------------------------------------------------------------------- */

// BIT FIELD TRAITS

/// A register that is a bit field and may be read.
pub trait BitFieldReadable: Debug {
    /// The type of the register's value.
    type Type: RegisterValue;

    /// Read the entire bit field at once.
    fn read(&self) -> io::Result<Self::Type>;
}

/// A register that is a bit field and may be written.
pub trait BitFieldWriteable: BitFieldReadable {
    /// Bits that must be written back as 0 when doing a read-modify-write of a single field.
    ///
    /// Registers that trigger an action when written (the indirect context command, the PIDX
    /// update registers) must instead be written whole, with a value composed using
    /// [`field_set`].
    const WRITE_MASK: Self::Type;

    /// Write the entire bit field at once.
    fn write(&self, value: Self::Type) -> io::Result<()>;
}

// READ-ONLY BIT SEQUENCES

/// A read-only sequence of bits that is part of a register.
#[derive(Clone, Copy)]
pub struct BitsRo<'a, T, U>
where
    T: RegisterValue + TryInto<U>,
    T::Error: Debug,
    U: RegisterValue,
{
    region: &'a dyn RegisterRegion,
    offset: u64,
    mask: T,
    shift: u8,
    phantom: PhantomData<U>,
}

impl<'a, T, U> BitsRo<'a, T, U>
where
    T: RegisterValue + TryInto<U>,
    T::Error: Debug,
    U: RegisterValue,
{
    pub fn backed_by(region: &'a dyn RegisterRegion, offset: u64, mask: T, shift: u8) -> Self {
        BitsRo {
            region,
            offset,
            mask,
            shift,
            phantom: PhantomData,
        }
    }

    /// Read the whole register, then mask and shift out this sequence.
    pub fn read(&self) -> io::Result<U> {
        let value = (T::read(self.region, self.offset)? & self.mask) >> self.shift.into();
        narrow(value)
    }
}

impl<T, U> Debug for BitsRo<'_, T, U>
where
    T: RegisterValue + TryInto<U>,
    T::Error: Debug,
    U: RegisterValue,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        print_debug_hex(self.read(), f)
    }
}

// READ-WRITE BIT SEQUENCES

/// A read-write sequence of bits that is part of a register.
#[derive(Clone, Copy)]
pub struct BitsRw<'a, T, U>
where
    T: RegisterValue + TryInto<U>,
    T::Error: Debug,
    U: RegisterValue + Into<T>,
{
    region: &'a dyn RegisterRegion,
    offset: u64,
    mask: T,
    shift: u8,
    write_mask: T,
    phantom: PhantomData<U>,
}

impl<'a, T, U> BitsRw<'a, T, U>
where
    T: RegisterValue + TryInto<U>,
    T::Error: Debug,
    U: RegisterValue + Into<T>,
{
    pub fn backed_by(
        region: &'a dyn RegisterRegion,
        offset: u64,
        mask: T,
        shift: u8,
        write_mask: T,
    ) -> Self {
        BitsRw {
            region,
            offset,
            mask,
            shift,
            write_mask,
            phantom: PhantomData,
        }
    }

    /// Read the whole register, then mask and shift out this sequence.
    pub fn read(&self) -> io::Result<U> {
        let value = (T::read(self.region, self.offset)? & self.mask) >> self.shift.into();
        narrow(value)
    }

    /// Read-modify-write this sequence, leaving the other bits of the register alone.
    pub fn write(&self, value: U) -> io::Result<()> {
        let shifted = value.into() << self.shift.into();

        if shifted >> self.shift.into() != value.into() || shifted & !self.mask != T::zero() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("Value {:#x} does not fit in mask {:#x}", value, self.mask),
            ));
        }

        let to_write = (T::read(self.region, self.offset)? & self.write_mask & !self.mask) | shifted;
        to_write.write(self.region, self.offset)
    }
}

impl<T, U> Debug for BitsRw<'_, T, U>
where
    T: RegisterValue + TryInto<U>,
    T::Error: Debug,
    U: RegisterValue + Into<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        print_debug_hex(self.read(), f)
    }
}

// READ-ONLY INDIVIDUAL BITS

/// A read-only single bit that is part of a register.
#[derive(Clone, Copy)]
pub struct BitRo<'a, T: RegisterValue> {
    region: &'a dyn RegisterRegion,
    offset: u64,
    mask: T,
}

impl<'a, T: RegisterValue> BitRo<'a, T> {
    pub fn backed_by(region: &'a dyn RegisterRegion, offset: u64, mask: T) -> Self {
        BitRo {
            region,
            offset,
            mask,
        }
    }

    pub fn read(&self) -> io::Result<bool> {
        Ok(T::read(self.region, self.offset)? & self.mask != T::zero())
    }
}

impl<T: RegisterValue> Debug for BitRo<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        print_debug_bool(self.read(), f)
    }
}

// READ-WRITE INDIVIDUAL BITS

/// A read-write single bit that is part of a register.
#[derive(Clone, Copy)]
pub struct BitRw<'a, T: RegisterValue> {
    region: &'a dyn RegisterRegion,
    offset: u64,
    mask: T,
    write_mask: T,
}

impl<'a, T: RegisterValue> BitRw<'a, T> {
    pub fn backed_by(region: &'a dyn RegisterRegion, offset: u64, mask: T, write_mask: T) -> Self {
        BitRw {
            region,
            offset,
            mask,
            write_mask,
        }
    }

    pub fn read(&self) -> io::Result<bool> {
        Ok(T::read(self.region, self.offset)? & self.mask != T::zero())
    }

    /// Read-modify-write this bit, leaving the other bits of the register alone.
    pub fn write(&self, value: bool) -> io::Result<()> {
        let old = T::read(self.region, self.offset)? & self.write_mask;

        let new = if value {
            old | self.mask
        } else {
            old & !self.mask
        };

        new.write(self.region, self.offset)
    }
}

impl<T: RegisterValue> Debug for BitRw<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        print_debug_bool(self.read(), f)
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
