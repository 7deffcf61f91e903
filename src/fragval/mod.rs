//! L6 — fragmented (large) value storage: values too big to keep inline
//! in a leaf entry spill into their own chain of pages, addressed by a
//! descriptor stored in the entry's place.

pub mod descriptor;
pub mod trash;
pub mod value;
