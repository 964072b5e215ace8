//! Dashboard and console side of vmlab.
//!
//! The dashboard runs one [`idle::IdleDriver`] per signed-in user. It fuses
//! local input, console messages and the server's session list into a single
//! idle deadline, shows the grace-period prompt and ends the sessions when
//! nobody answers. The server enforces the same deadline on its own, so a
//! dashboard that disappears only delays reclamation until the next reaper pass.

pub mod api;
pub mod clock;
pub mod idle;

pub use api::{HttpSessionControl, SessionControl, SessionControlError};
pub use clock::{Clock, TokioClock};
pub use idle::{IdleConfig, IdleDriver, IdleHandle, IdleView};
