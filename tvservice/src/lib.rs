//! tvservice: service registry, elementary stream demux and CWC
//! descrambling core for TV ingestion.
//!
//! A [`service::Registry`] owns services created from [`feed::Feed`]
//! backends. Feeds push transport stream bytes into a running service; the
//! service demuxes them through its elementary stream table, descrambles
//! with keys obtained by the [`descrambler::CwcClient`], and hands the
//! result to subscribers through the streaming pad.

pub mod config;
pub mod descrambler;
pub mod es;
pub mod feed;
pub mod logging;
pub mod pad;
pub mod service;
pub mod stats;
pub mod ts;
