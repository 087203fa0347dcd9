//! Core library for scriptman: parsing and rewriting MediaWiki user
//! script pages (`common.js`, skin pages and the cross-site global page).
//!
//! The text transforms are pure functions over page text; everything
//! that talks to a wiki goes through the [`service::WikiEditApi`] trait
//! so the [`engine::Engine`] can be driven against in-memory doubles.

pub mod capture;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod escape;
pub mod import;
pub mod lock;
pub mod service;
pub mod summary;
