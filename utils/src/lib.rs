#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

#[cfg(feature = "closer")]
#[cfg_attr(docsrs, doc(cfg(feature = "closer")))]
mod closer;
#[cfg(feature = "closer")]
pub use closer::*;

#[cfg(feature = "throttle")]
#[cfg_attr(docsrs, doc(cfg(feature = "throttle")))]
mod throttle;
#[cfg(feature = "throttle")]
pub use throttle::*;
