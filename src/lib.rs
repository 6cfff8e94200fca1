//! A shared-ownership pointer, [`Shared`], and its non-owning observer, [`Weak`]
//!
//! Every payload is tracked by a ledger holding two atomic counts: owners and
//! observers. The payload is destroyed the moment its last [`Shared`] goes
//! away, the ledger is freed once the last [`Weak`] is gone as well. Owners
//! collectively hold one observer unit, so the ledger never disappears from
//! under an owner that is still tearing the payload down.
//!
//! [`Shared::new`] puts the ledger and the payload in one allocation, while
//! [`Shared::from_box`] adopts an existing `Box` and allocates the ledger on
//! its own.
//!
//! ```
//! use tether::{Shared, Weak};
//!
//! let a = Shared::<u32>::new(10);
//! let b = a.clone();
//! assert_eq!(a.use_count(), 2);
//!
//! let w = Weak::from(&a);
//! drop((a, b));
//! assert!(w.expired());
//! assert!(w.upgrade().is_none());
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

extern crate alloc;

mod abort;
mod atomic;
mod block;
mod error;
mod ledger;
mod shared;
mod weak;

pub use atomic::Atomic;
pub use error::AllocError;
pub use shared::Shared;
pub use weak::Weak;

mod sealed {
    pub trait Sealed {}
}
