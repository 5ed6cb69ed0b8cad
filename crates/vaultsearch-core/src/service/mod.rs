//! Entry point for applications embedding encrypted search.

mod facade;

pub use facade::EncryptedSearchService;
