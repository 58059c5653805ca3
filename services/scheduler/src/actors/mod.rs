//! Actor framework for executor regions.
//!
//! ## Design Principles
//!
//! - **One actor per key**: each actor owns the work for a single job id and
//!   handles its messages strictly one at a time
//! - **Bounded mailboxes**: a full mailbox is reported to the sender, never
//!   waited on
//! - **Passivation**: actors with nothing to do for a while stop themselves
//!   and are respawned on the next message
//! - **Cancellation tree**: every actor runs under a child of its
//!   supervisor's `CancellationToken`

mod framework;

pub use framework::{
    Actor, ActorContext, ActorError, ActorHandle, ActorState, Message, Supervisor,
};
