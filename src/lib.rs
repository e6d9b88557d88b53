//! A deduplicating, content-addressed backup creation pipeline.
//!
//! See [`run`] for the top-level entry point: it wires together the
//! Scanner ([`scan`]), Reuse Detector ([`reuse`]), Hash Pre-Pass
//! ([`hashprepass`]), and Ingest Coordinator ([`ingest`]) around one
//! [`catalog::CatalogSession`] transaction and a [`blobstore::BlobStore`].

pub mod blobstore;
pub mod bqm;
pub mod catalog;
pub mod compress;
pub mod config;
pub mod counters;
pub mod error;
pub mod hashing;
pub mod hashprepass;
pub mod ingest;
pub mod reuse;
pub mod run;
pub mod scan;
pub mod statutil;

// CLI stuff:
pub mod ui;
