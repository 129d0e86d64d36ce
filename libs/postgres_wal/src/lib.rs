//! Primitives shared by everything that reasons about Postgres WAL positions:
//! the [`Lsn`] type, the archival segment-file naming scheme, and a parser for
//! `pg_controldata` output.
//!
//! Both the publishing and the consuming side of a DR deployment derive WAL
//! file names from LSNs with this crate. Any divergence between the two sides
//! here would make the publisher prove the wrong file durable, so the naming
//! code is pure and exhaustively unit tested.

pub mod controldata;
pub mod lsn;
pub mod wal_file;

pub use controldata::ControlFileData;
pub use lsn::Lsn;
pub use wal_file::{validate_wal_segment_size, wal_file_name};
