/*!
Exchange session management.

This module defines the exchange state machine, the per-attempt session data
and the source of local bit and basis choices.
*/

pub mod state;
pub mod session;
pub mod input;

pub use state::{ExchangeState, Role, StateManager};
pub use session::ExchangeSession;
pub use input::{LocalInput, RandomInput, ScriptedInput};
