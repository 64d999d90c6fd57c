//! Common types used by the various installer components.
pub mod error;
pub mod file;
pub mod httpclient;
pub mod xml;

//------------ Response Aliases ----------------------------------------------

pub type SetupEmptyResult = std::result::Result<(), self::error::Error>;
pub type SetupResult<T> = std::result::Result<T, self::error::Error>;
