//! Small pieces of ambient infrastructure shared by every component that
//! touches the on-disk catalog: crash-safe file writes, the base-36 id
//! codec, and process-wide logging setup. Grounded on the conventions of
//! the teacher's `utils` crate (`crashsafe`, `logging`, `id`).

pub mod base36;
pub mod crashsafe;
pub mod logging;
pub mod pid;
