//! Traffic shaping
//!
//! Optional add-ons applied by the frame writer. Timing waits a random
//! delay before each write so burst timing does not mirror the proxied
//! application. Padding grows DATA payloads to a few standard sizes so
//! frame lengths say little about the data inside.

mod padding;
mod timing;

pub use padding::{unpad, PaddingConfig, PaddingError, PAD_SIZES};
pub use timing::{ShapingConfig, TrafficShaper};
