pub mod config;
pub mod contact;
pub mod error;
pub mod merge;
pub mod photo;
pub mod remote;
pub mod roster;
pub mod sync;
pub mod vcard_io;
pub mod vdir;
