//! # granite-poll: portable edge-triggered readiness engine
//!
//! A thin, uniform surface over the platform readiness APIs:
//!
//! | Engine | Platform | Edge-triggered | Re-arm per event |
//! |---|---|---|---|
//! | epoll | linux | `EPOLLET` | no |
//! | kqueue | macOS, *BSD | `EV_CLEAR`, READ/WRITE as separate filters | no |
//! | event ports | solaris, illumos | one-shot associations | yes |
//! | poll | any unix | simulated (callers drain anyway) | no |
//!
//! Each [`Poller`] owns one worker thread that blocks in the engine's wait
//! call and dispatches [`Event`]s to an [`EventHandler`] on that thread.
//! Registration is done through a cloneable [`Registry`] handle and is safe
//! from any thread; the engine-specific interest-adjustment policies are
//! methods on the [`Backend`] trait so callers never branch on the engine.
//!
//! The crate also carries the two allocation-free building blocks the
//! engines and their callers share: a fixed-capacity typed arena
//! ([`Pool`]) and a byte-keyed chaining hash map ([`ByteMap`]).

mod backend;
mod byte_map;
mod code;
mod poller;
mod slab;
pub mod sys;

pub use backend::{Backend, Events, PollError, PollResult};
pub use byte_map::ByteMap;
pub use code::{Code, Event, Token};
pub use poller::{EventHandler, Poller, Registry};
pub use slab::Pool;
