//! Actor framework for the device agent.
//!
//! A lightweight mailbox-per-actor runtime. Each actor owns its mutable state
//! and side effects and handles messages strictly one at a time, which is how
//! the service supervisor serializes lifecycle actions.

mod framework;

pub use framework::{
    mailbox, spawn, Actor, ActorContext, ActorError, ActorHandle, Mailbox, Message,
};
