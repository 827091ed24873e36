mod ballot;
mod election;
mod error;
mod receipt;

pub use ballot::*;
pub use election::*;
pub use error::*;
pub use receipt::*;

pub trait StringConversion: Sized {
    fn as_string(&self) -> String;
    fn from_string(s: String) -> Option<Self>;
}
