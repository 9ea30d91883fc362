// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

/// Defines a block of registers at fixed offsets, with one accessor per register.
///
/// Each field's type must implement [`BackedBySubregion`](crate::regions::BackedBySubregion), so it
/// can be a [`RegisterRo`](crate::regions::structured::RegisterRo),
/// [`RegisterRw`](crate::regions::structured::RegisterRw), a type generated by
/// [`register_bit_field!`](crate::register_bit_field), or another block.
///
/// A field followed by `[count; stride]` is an array of `count` registers, `stride` bytes apart.
/// Its accessor takes an index and fails with [`ErrorKind::InvalidInput`] past the end:
///
/// ```ignore
/// register_block! {
///     pub struct Example<'a> {
///         control    @ 0x000          : RegisterRw<'a, u32>,
///         ring_sizes @ 0x204 [16; 4]  : RegisterRw<'a, u32>,
///     }
/// }
///
/// example.ring_sizes(3)?.write(193)?;
/// ```
///
/// The optional length limits the block's subregion, so accesses past it fail instead of landing
/// on whatever follows.
///
/// [`ErrorKind::InvalidInput`]: std::io::ErrorKind::InvalidInput
#[macro_export]
macro_rules! register_block {
    (
        $(
            $(#[$attr:meta])*
            $vis:vis struct $name:ident<$lifetime:lifetime> $(: $length:literal)? {
                $(
                    $(#[$field_attr:meta])*
                    $field_name:ident @ $field_offset:literal $([$count:expr; $stride:expr])? :
                    $($field_type:ident)::+$(<$($field_generics:tt),+ $(,)?>)?
                ),* $(,)?
            }
        )*
    ) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy)]
            $vis struct $name<$lifetime> {
                subregion: $crate::regions::Subregion<$lifetime>,
            }

            impl<'a> $crate::regions::BackedBySubregion<'a> for $name<'a> {
                fn backed_by(as_subregion: impl $crate::regions::AsSubregion<'a>) -> Self {
                    let subregion = $crate::regions::AsSubregion::subregion(&as_subregion, ..$($length)?);
                    $name { subregion }
                }
            }

            impl<'a> $crate::regions::AsSubregion<'a> for $name<'a> {
                fn as_subregion(&self) -> $crate::regions::Subregion<'a> {
                    self.subregion
                }
            }

            impl ::std::fmt::Debug for $name<'_> {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    let mut debug_struct = f.debug_struct(::std::stringify!($name));
                    $(
                        debug_struct.field(
                            ::std::stringify!($field_name),
                            &$crate::_register_block_field!(debug self.$field_name $([$count])?),
                        );
                    )*
                    debug_struct.finish()
                }
            }

            impl<$lifetime> $name<$lifetime> {
                $(
                    $crate::_register_block_field! {
                        accessor
                        $(#[$field_attr])*
                        $field_name @ $field_offset $([$count; $stride])? :
                        $($field_type)::+$(<$($field_generics),+>)?
                    }
                )*
            }
        )*
    };
}

/// This macro is __internal__. It should __not__ be used outside of the `qdma-driver` crate.
#[doc(hidden)]
#[macro_export]
macro_rules! _register_block_field {
    (debug $this:ident . $field_name:ident) => {
        $this.$field_name()
    };

    (debug $this:ident . $field_name:ident [$count:expr]) => {
        (0..$count)
            .filter_map(|index| $this.$field_name(index).ok())
            .collect::<::std::vec::Vec<_>>()
    };

    (
        accessor
        $(#[$field_attr:meta])*
        $field_name:ident @ $field_offset:literal [$count:expr; $stride:expr] :
        $($field_type:ident)::+$(<$($field_generics:tt),+ $(,)?>)?
    ) => {
        $(#[$field_attr])*
        pub fn $field_name(
            &self,
            index: usize,
        ) -> ::std::io::Result<$($field_type)::+$(<$($field_generics),+>)?> {
            if index >= $count {
                return Err(::std::io::Error::new(
                    ::std::io::ErrorKind::InvalidInput,
                    ::std::format!(
                        "{} index {} out of range, must be below {}",
                        ::std::stringify!($field_name),
                        index,
                        $count
                    ),
                ));
            }
            let offset = $field_offset + ($stride) * index as u64;
            let subregion = $crate::regions::AsSubregion::subregion(self, offset..);
            Ok($crate::regions::BackedBySubregion::backed_by(subregion))
        }
    };

    (
        accessor
        $(#[$field_attr:meta])*
        $field_name:ident @ $field_offset:literal :
        $($field_type:ident)::+$(<$($field_generics:tt),+ $(,)?>)?
    ) => {
        $(#[$field_attr])*
        pub fn $field_name(&self) -> $($field_type)::+$(<$($field_generics),+>)? {
            let subregion = $crate::regions::AsSubregion::subregion(self, $field_offset..);
            $crate::regions::BackedBySubregion::backed_by(subregion)
        }
    };
}

/* ---------------------------------------------------------------------------------------------- */
