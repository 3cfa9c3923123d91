#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod admission;
mod pod;
pub mod randhostport;

pub use self::admission::{Admission, Plugin, Registry};
pub use bcs_webhook_k8s_api as k8s;
