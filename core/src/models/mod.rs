//! Foundation models shipped with the stack.

pub mod generic_onoff;

pub use generic_onoff::{GenericOnOffClient, GenericOnOffMessage, GenericOnOffServer};
