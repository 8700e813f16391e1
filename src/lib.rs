#![doc = include_str!("../README.md")]

mod codec;
pub mod properties;

#[doc(inline)]
pub use properties::{BrokerProperties, BrokerPropertiesBuilder, BROKER_PROPERTIES_HEADER};

#[doc(inline)]
pub use codec::{DecodeError, DecodeErrorKind, EncodeError, EncodeErrorKind};
