//! Registry access: authentication, client operations, manifest model

pub mod auth;
pub mod client;
pub mod manifest;

pub use client::{ImageDestination, ImageSource};
pub use manifest::{BlobInfo, Manifest, ManifestList};
