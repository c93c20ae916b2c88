//! Cells, Bag-of-Cells serialization and refcounted cell storage.
//!
//! ## `Cell` vs `DynCell`
//!
//! [`Cell`] is an owned handle (an `Arc` over the cell implementation),
//! while [`DynCell`] is a borrowed dynamic view used by all helper methods.
//!
//! ```
//! use ton_cells::prelude::*;
//!
//! let mut builder = CellBuilder::new();
//! builder.store_u32(0xdeadbeef)?;
//! builder.store_reference(Cell::empty_cell())?;
//! let cell = builder.build()?;
//!
//! let bytes = Boc::encode(&cell)?;
//! let decoded = Boc::decode(&bytes)?;
//! assert_eq!(decoded.repr_hash(), cell.repr_hash());
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Storage
//!
//! Cells can be persisted in any [`KeyValue`] backend through
//! [`DynamicBagOfCellsDb`], which keeps reference counters of the stored
//! records and commits pending changes in batches.
//!
//! [`DynCell`]: cell::DynCell
//! [`KeyValue`]: db::KeyValue
//! [`DynamicBagOfCellsDb`]: db::DynamicBagOfCellsDb

/// Unwraps the result or returns the error from the enclosing function.
///
/// Same as `?` but without the `From` conversion, which keeps
/// the generated code smaller.
macro_rules! ok {
    ($e:expr $(,)?) => {
        match $e {
            core::result::Result::Ok(val) => val,
            core::result::Result::Err(err) => return core::result::Result::Err(err),
        }
    };
}

pub use self::boc::Boc;
pub use self::cell::{Cell, CellBuilder, CellSlice, HashBytes};

pub mod boc;
pub mod cell;
pub mod db;
pub mod error;
pub mod error_log;
pub mod merkle;
pub mod prelude;
pub mod util;
