//! Bundled job executors.
//!
//! Only thumbnail generation runs in-process; OCR and object detection are
//! served by a separate ML worker that claims their job names from the same
//! intent store.

pub mod thumbnail;

pub use thumbnail::ThumbnailExecutor;
