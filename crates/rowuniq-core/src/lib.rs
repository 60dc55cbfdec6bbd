//! Bounded-memory duplicate elimination for fixed-width keys.
//!
//! A [`Deduper`] accepts a stream of fixed-width opaque keys, removes
//! duplicates under a caller-supplied total order, and returns the unique
//! keys in sorted order. It is built for collecting row identifiers during
//! multi-table deletes, where emitting them in disk-layout order minimises
//! random I/O in the delete pass.
//!
//! Keys accumulate in an ordered in-memory set bounded by a byte budget;
//! overflow spills sorted runs to a temp file, and extraction streams a
//! bounded-fan-in merge that drops duplicates between runs. A standalone
//! cost model ([`estimate_cost`]) lets a query planner price the whole
//! pipeline before constructing anything.
//!
//! ```no_run
//! use rowuniq_core::{Deduper, LexicalOrder, TempConfig, VecSink};
//!
//! # fn main() -> rowuniq_core::Result<()> {
//! let temp = TempConfig::in_os_temp("rowuniq-");
//! let mut dedup = Deduper::new(LexicalOrder, 8, 1 << 20, temp)?;
//! for row_id in [5u64, 1, 3, 1, 5] {
//!     dedup.put(&row_id.to_be_bytes())?;
//! }
//! let mut sink = VecSink::new(8);
//! let unique = dedup.extract_into(&mut sink)?;
//! assert_eq!(unique, 3);
//! # Ok(())
//! # }
//! ```

pub mod cost;
pub mod dedup;
pub mod keyset;
pub(crate) mod merge;
pub mod order;
pub mod sink;
pub mod spill;

pub use cost::{estimate_cost, log2_n_fact, CostConfig};
pub use dedup::{Deduper, DeduperStats};
pub use keyset::{Insertion, KeySet};
pub use merge::{MERGE_FAN_IN, MERGE_FAN_IN_THRESHOLD};
pub use order::{KeyOrder, LexicalOrder};
pub use sink::{KeySink, SpoolKeys, SpoolSink, VecSink};
pub use spill::{RunDescriptor, SpillFile, TempConfig};

pub use rowuniq_error::{DedupError, ErrorKind, Result};
