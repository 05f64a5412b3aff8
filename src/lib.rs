//! Kenshin/Rurouni: a Graphite-compatible time-series storage engine that
//! co-locates many related series into a single fixed-layout "bundle" file
//! so one row on disk spans every series at a given timestamp.
//!
//! `kenshin` is the on-disk bundle format and archive engine. `rurouni` is
//! the in-memory write cache and background writer that feeds it.

pub mod kenshin;
pub mod rurouni;
